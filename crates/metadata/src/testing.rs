//! Fixtures shared by tests across the workspace: deterministic ids, an
//! in-process device, a signer with a signature budget, and a static key
//! directory.

use std::sync::atomic::{
    AtomicUsize,
    Ordering,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    crypto::{
        DeviceSigner,
        KeyDirectory,
        SignatureInfo,
        Signer,
        VerifyingKey,
    },
    handle::TlfHandle,
    ids::{
        BranchId,
        TlfId,
        UserId,
    },
    md_id::MdId,
    revision::MetadataRevision,
    root_metadata::{
        KeyBundle,
        RootMetadata,
        WriterMetadata,
    },
};

pub fn test_uid(n: u8) -> UserId {
    UserId::from_bytes([n; 16])
}

pub fn fake_md_id(n: u8) -> MdId {
    MdId::from([n; 32])
}

pub fn test_tlf_id(n: u8) -> TlfId {
    let mut bytes = [n; 16];
    bytes[15] = 0x16;
    TlfId::from_bytes(bytes).expect("private suffix is always valid")
}

/// One user on one device, with a deterministic key derived from `n`.
pub struct TestDevice {
    pub uid: UserId,
    pub signer: DeviceSigner,
}

impl TestDevice {
    pub fn new(n: u8) -> Self {
        Self {
            uid: test_uid(n),
            signer: DeviceSigner::from_seed([n; 32]),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signer.verifying_key()
    }
}

/// An unsigned revision for `device`'s private folder, on the master branch.
/// `prev_root` of `None` means the zero digest.
pub fn test_root_metadata(
    device: &TestDevice,
    revision: MetadataRevision,
    prev_root: Option<MdId>,
) -> RootMetadata {
    let handle = TlfHandle::new_private([device.uid], []);
    test_root_metadata_for(test_tlf_id(1), &handle, device, revision, prev_root)
}

/// Like `test_root_metadata`, but for an explicit folder and handle, so
/// multi-writer scenarios can share one history.
pub fn test_root_metadata_for(
    tlf_id: TlfId,
    handle: &TlfHandle,
    device: &TestDevice,
    revision: MetadataRevision,
    prev_root: Option<MdId>,
) -> RootMetadata {
    let writer_metadata = WriterMetadata {
        tlf_id,
        handle: handle.clone(),
        revision,
        branch_id: BranchId::NULL,
        merge_status: BranchId::NULL.merge_status(),
        prev_root: prev_root.unwrap_or(MdId::ZERO),
        last_modifying_writer: device.uid,
        private_metadata: format!("payload for revision {revision}").into_bytes(),
        key_bundle: KeyBundle::empty(),
        disk_usage: 500,
    };
    RootMetadata::new(writer_metadata, device.uid)
}

/// Delegates to an inner signer until the budget runs out, then fails every
/// call. Exercises the all-or-nothing promise of multi-entry re-signing.
pub struct CountingSigner {
    inner: DeviceSigner,
    remaining: AtomicUsize,
}

impl CountingSigner {
    pub fn new(inner: DeviceSigner, budget: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(budget),
        }
    }
}

#[async_trait]
impl Signer for CountingSigner {
    async fn sign(&self, ctx: &CancellationToken, data: &[u8]) -> anyhow::Result<SignatureInfo> {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous.is_err() {
            anyhow::bail!("signer budget exhausted");
        }
        self.inner.sign(ctx, data).await
    }

    fn verifying_key(&self) -> VerifyingKey {
        self.inner.verifying_key()
    }
}

/// Key directory over a fixed table. `allow_all` skips the table entirely.
pub struct StaticKeyDirectory {
    devices: Vec<(UserId, VerifyingKey)>,
    allow_all: bool,
}

impl StaticKeyDirectory {
    pub fn allow_all() -> Self {
        Self {
            devices: Vec::new(),
            allow_all: true,
        }
    }

    pub fn with_devices(devices: impl IntoIterator<Item = (UserId, VerifyingKey)>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
            allow_all: false,
        }
    }
}

#[async_trait]
impl KeyDirectory for StaticKeyDirectory {
    async fn check_device_key(
        &self,
        _ctx: &CancellationToken,
        uid: UserId,
        key: &VerifyingKey,
    ) -> anyhow::Result<()> {
        if self.allow_all {
            return Ok(());
        }
        anyhow::ensure!(
            self.devices
                .iter()
                .any(|(known_uid, known_key)| *known_uid == uid && known_key == key),
            "{key:?} is not a known device key for {uid}",
        );
        Ok(())
    }
}
