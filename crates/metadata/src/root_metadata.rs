use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::Codec,
    crypto::{
        SignatureInfo,
        Signer,
        VerifyingKey,
    },
    handle::TlfHandle,
    ids::{
        BranchId,
        MergeStatus,
        TlfId,
        UserId,
    },
    md_id::MdId,
    revision::MetadataRevision,
};

/// Opaque snapshot of the folder key material current at signing time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBundle {
    pub generation: u64,
    pub bytes: Vec<u8>,
}

impl KeyBundle {
    pub fn empty() -> Self {
        Self {
            generation: 0,
            bytes: Vec::new(),
        }
    }
}

/// The writer portion of a revision: everything covered by the writer
/// signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterMetadata {
    pub tlf_id: TlfId,
    pub handle: TlfHandle,
    pub revision: MetadataRevision,
    pub branch_id: BranchId,
    pub merge_status: MergeStatus,
    pub prev_root: MdId,
    pub last_modifying_writer: UserId,
    /// Encrypted private payload, opaque at this layer.
    pub private_metadata: Vec<u8>,
    pub key_bundle: KeyBundle,
    pub disk_usage: u64,
}

/// A mutable revision record. The writer-signature slot is filled by
/// `sign`; its canonical encoding (with the slot filled) is what the root
/// signature covers and what the md id hashes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadata {
    pub writer_metadata: WriterMetadata,
    pub writer_signature: Option<SignatureInfo>,
    pub last_modifying_user: UserId,
}

/// Distinguishes the ways a revision can fail to chain onto its predecessor.
/// Conflict handling branches on the variant.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SuccessorError {
    #[error("expected revision {expected}, got {actual}")]
    RevisionMismatch {
        expected: MetadataRevision,
        actual: MetadataRevision,
    },
    #[error("previous root {actual} does not match head {expected}")]
    PrevRootMismatch { expected: MdId, actual: MdId },
    #[error("branch changed from {expected} to {actual} across adjacent revisions")]
    BranchMismatch { expected: BranchId, actual: BranchId },
    #[error("merge status changed from {expected} to {actual} across adjacent revisions")]
    MergeStatusMismatch {
        expected: MergeStatus,
        actual: MergeStatus,
    },
}

impl RootMetadata {
    pub fn new(writer_metadata: WriterMetadata, last_modifying_user: UserId) -> Self {
        Self {
            writer_metadata,
            writer_signature: None,
            last_modifying_user,
        }
    }

    pub fn tlf_id(&self) -> TlfId {
        self.writer_metadata.tlf_id
    }

    pub fn revision(&self) -> MetadataRevision {
        self.writer_metadata.revision
    }

    pub fn branch_id(&self) -> BranchId {
        self.writer_metadata.branch_id
    }

    pub fn merge_status(&self) -> MergeStatus {
        self.writer_metadata.merge_status
    }

    pub fn prev_root(&self) -> MdId {
        self.writer_metadata.prev_root
    }

    /// Stamp the record onto a branch, keeping the merge status consistent
    /// with it.
    pub fn stamp_branch(&mut self, branch_id: BranchId) {
        self.writer_metadata.branch_id = branch_id;
        self.writer_metadata.merge_status = branch_id.merge_status();
    }

    pub fn set_prev_root(&mut self, prev_root: MdId) {
        self.writer_metadata.prev_root = prev_root;
    }

    pub fn set_last_modified_by(&mut self, uid: UserId) {
        self.writer_metadata.last_modifying_writer = uid;
        self.last_modifying_user = uid;
    }

    /// Would `next` be a valid direct successor of this revision, whose md id
    /// is `prev_id`? Each violation gets its own error kind.
    pub fn check_valid_successor(
        &self,
        prev_id: MdId,
        next: &RootMetadata,
    ) -> Result<(), SuccessorError> {
        let expected_revision = MetadataRevision::new(u64::from(self.revision()).saturating_add(1));
        if next.revision() != expected_revision {
            return Err(SuccessorError::RevisionMismatch {
                expected: expected_revision,
                actual: next.revision(),
            });
        }
        if next.prev_root() != prev_id {
            return Err(SuccessorError::PrevRootMismatch {
                expected: prev_id,
                actual: next.prev_root(),
            });
        }
        if next.branch_id() != self.branch_id() {
            return Err(SuccessorError::BranchMismatch {
                expected: self.branch_id(),
                actual: next.branch_id(),
            });
        }
        if next.merge_status() != self.merge_status() {
            return Err(SuccessorError::MergeStatusMismatch {
                expected: self.merge_status(),
                actual: next.merge_status(),
            });
        }
        Ok(())
    }

    /// Sign the writer portion, then the whole record, with the same device
    /// key.
    pub async fn sign<C: Codec>(
        mut self,
        ctx: &CancellationToken,
        codec: &C,
        signer: &dyn Signer,
    ) -> anyhow::Result<RootMetadataSigned> {
        let writer_bytes = codec.encode(&self.writer_metadata)?;
        let writer_signature = signer.sign(ctx, &writer_bytes).await?;
        self.writer_signature = Some(writer_signature);
        let root_bytes = codec.encode(&self)?;
        let root_signature = signer.sign(ctx, &root_bytes).await?;
        Ok(RootMetadataSigned {
            root_metadata: self,
            root_signature,
        })
    }

    /// Content hash of the canonical encoding. Only meaningful once the
    /// writer-signature slot is filled.
    pub fn md_id<C: Codec>(&self, codec: &C) -> anyhow::Result<MdId> {
        anyhow::ensure!(
            self.writer_signature.is_some(),
            "md id requested for an unsigned revision"
        );
        Ok(MdId::digest(&codec.encode(self)?))
    }
}

/// A fully signed revision, as stored in the journal and exchanged with the
/// server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadataSigned {
    pub root_metadata: RootMetadata,
    pub root_signature: SignatureInfo,
}

impl RootMetadataSigned {
    pub fn tlf_id(&self) -> TlfId {
        self.root_metadata.tlf_id()
    }

    pub fn revision(&self) -> MetadataRevision {
        self.root_metadata.revision()
    }

    pub fn branch_id(&self) -> BranchId {
        self.root_metadata.branch_id()
    }

    pub fn merge_status(&self) -> MergeStatus {
        self.root_metadata.merge_status()
    }

    pub fn prev_root(&self) -> MdId {
        self.root_metadata.prev_root()
    }

    pub fn handle(&self) -> &TlfHandle {
        &self.root_metadata.writer_metadata.handle
    }

    pub fn md_id<C: Codec>(&self, codec: &C) -> anyhow::Result<MdId> {
        self.root_metadata.md_id(codec)
    }

    /// Full structural and cryptographic validation. Any reader of a signed
    /// revision may call this; the server calls it on every put.
    pub fn is_valid_and_signed<C: Codec>(&self, codec: &C) -> anyhow::Result<()> {
        let md = &self.root_metadata;
        md.writer_metadata.handle.check_well_formed()?;

        let writer_signature = md.writer_signature.as_ref().ok_or_else(|| {
            anyhow::anyhow!("writer-signature slot is empty").context(ErrorMetadata::bad_request(
                "UnsignedRevision",
                "revision is missing its writer signature",
            ))
        })?;
        if writer_signature.verifying_key != self.root_signature.verifying_key {
            anyhow::bail!(anyhow::anyhow!("signatures name different keys").context(
                ErrorMetadata::bad_request(
                    "SignerMismatch",
                    "writer and root signatures were produced by different keys",
                )
            ));
        }
        writer_signature.verify(&codec.encode(&md.writer_metadata)?)?;
        self.root_signature.verify(&codec.encode(md)?)?;

        if !md.revision().is_initialized() {
            anyhow::bail!(anyhow::anyhow!("revision number is zero").context(
                ErrorMetadata::bad_request(
                    "UninitializedRevision",
                    "revision numbers start at one",
                )
            ));
        }
        let is_initial = md.revision() == MetadataRevision::INITIAL;
        if is_initial != md.prev_root().is_zero() {
            anyhow::bail!(anyhow::anyhow!(
                "revision {} has prev root {}",
                md.revision(),
                md.prev_root()
            )
            .context(ErrorMetadata::bad_request(
                "BrokenChainStart",
                "only the initial revision may (and must) have a zero previous root",
            )));
        }
        if md.merge_status() != md.branch_id().merge_status() {
            anyhow::bail!(anyhow::anyhow!(
                "{} revision on branch {}",
                md.merge_status(),
                md.branch_id()
            )
            .context(ErrorMetadata::bad_request(
                "MergeStatusMismatch",
                "merge status disagrees with the branch id",
            )));
        }
        Ok(())
    }

    /// Was this revision produced by `uid` on the device holding
    /// `verifying_key`?
    pub fn is_last_modified_by(
        &self,
        uid: UserId,
        verifying_key: &VerifyingKey,
    ) -> anyhow::Result<()> {
        let md = &self.root_metadata;
        anyhow::ensure!(
            md.last_modifying_user == uid,
            "last modifying user {} is not {uid}",
            md.last_modifying_user,
        );
        anyhow::ensure!(
            md.writer_metadata.last_modifying_writer == uid,
            "last modifying writer {} is not {uid}",
            md.writer_metadata.last_modifying_writer,
        );
        let writer_signature = md
            .writer_signature
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("revision is unsigned"))?;
        anyhow::ensure!(
            &writer_signature.verifying_key == verifying_key
                && &self.root_signature.verifying_key == verifying_key,
            "revision was signed by a different device key",
        );
        Ok(())
    }
}

/// A signed revision with its content hash computed once. The journal stores
/// these so chain checks never re-hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImmutableRootMetadata {
    pub rmds: RootMetadataSigned,
    pub md_id: MdId,
}

impl ImmutableRootMetadata {
    pub fn new<C: Codec>(codec: &C, rmds: RootMetadataSigned) -> anyhow::Result<Self> {
        let md_id = rmds.md_id(codec)?;
        Ok(Self { rmds, md_id })
    }

    pub fn revision(&self) -> MetadataRevision {
        self.rmds.revision()
    }

    pub fn branch_id(&self) -> BranchId {
        self.rmds.branch_id()
    }
}
