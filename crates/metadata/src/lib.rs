//! Data model for the folder metadata protocol: identifiers, signed revision
//! records, the canonical codec and signing seams, and the typed errors that
//! cross the metadata-server RPC boundary.

pub mod codec;
pub mod crypto;
pub mod handle;
pub mod ids;
pub mod md_id;
pub mod revision;
pub mod root_metadata;
pub mod server_errors;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use codec::{
    BincodeCodec,
    Codec,
};
pub use crypto::{
    DeviceSigner,
    KeyDirectory,
    Signature,
    SignatureInfo,
    SignatureVersion,
    Signer,
    SigningKey,
    VerifyingKey,
};
pub use handle::TlfHandle;
pub use ids::{
    BranchId,
    MergeStatus,
    TlfId,
    UserId,
};
pub use md_id::MdId;
pub use revision::MetadataRevision;
pub use root_metadata::{
    ImmutableRootMetadata,
    KeyBundle,
    RootMetadata,
    RootMetadataSigned,
    SuccessorError,
    WriterMetadata,
};
pub use server_errors::{
    unwrap_status,
    MetadataServerError,
    StatusRecord,
};
