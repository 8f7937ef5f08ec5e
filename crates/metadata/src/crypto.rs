use std::fmt;

use async_trait::async_trait;
use ed25519_dalek::Signer as _;
pub use ed25519_dalek::{
    Signature,
    SigningKey,
    VerifyingKey,
};
use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};
use tokio_util::sync::CancellationToken;

use crate::ids::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureVersion {
    Ed25519V1,
}

/// A detached signature together with the key that produced it. Verification
/// checks the bytes against the claimed key; whether that key actually
/// belongs to the claimed device is the key directory's call.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureInfo {
    pub version: SignatureVersion,
    pub signature: Vec<u8>,
    pub verifying_key: VerifyingKey,
}

impl SignatureInfo {
    pub fn verify(&self, data: &[u8]) -> anyhow::Result<()> {
        match self.version {
            SignatureVersion::Ed25519V1 => {
                let signature = Signature::try_from(&self.signature[..]).map_err(|e| {
                    anyhow::anyhow!(e).context(ErrorMetadata::bad_request(
                        "MalformedSignature",
                        "signature bytes are not a valid ed25519 signature",
                    ))
                })?;
                self.verifying_key
                    .verify_strict(data, &signature)
                    .map_err(|e| {
                        anyhow::anyhow!(e).context(ErrorMetadata::bad_request(
                            "InvalidSignature",
                            "signature does not verify against the claimed key",
                        ))
                    })
            },
        }
    }
}

impl fmt::Debug for SignatureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignatureInfo({:?}, sig={}, key={})",
            self.version,
            hex::encode(&self.signature),
            hex::encode(self.verifying_key.as_bytes()),
        )
    }
}

/// Signing capability. Signing may be an RPC to a key agent, so it is async
/// and cancelable. Must be pure given the key: the same input always yields
/// the same signature.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, ctx: &CancellationToken, data: &[u8]) -> anyhow::Result<SignatureInfo>;

    fn verifying_key(&self) -> VerifyingKey;
}

/// In-process signer over a device's ed25519 keypair.
pub struct DeviceSigner {
    signing_key: SigningKey,
}

impl DeviceSigner {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }
}

#[async_trait]
impl Signer for DeviceSigner {
    async fn sign(&self, ctx: &CancellationToken, data: &[u8]) -> anyhow::Result<SignatureInfo> {
        if ctx.is_cancelled() {
            return Err(anyhow::anyhow!("signing canceled").context(ErrorMetadata::canceled()));
        }
        let signature = self.signing_key.sign(data);
        Ok(SignatureInfo {
            version: SignatureVersion::Ed25519V1,
            signature: signature.to_bytes().to_vec(),
            verifying_key: self.signing_key.verifying_key(),
        })
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// Identity seam: answers whether a verifying key is a valid device key for a
/// user. Backed by the identity service in production; tests use a static
/// table.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn check_device_key(
        &self,
        ctx: &CancellationToken,
        uid: UserId,
        key: &VerifyingKey,
    ) -> anyhow::Result<()>;
}
