//! Typed errors of the metadata-server protocol and the status record that
//! carries them across the RPC boundary. The numeric codes are part of the
//! wire contract and must never be renumbered.

use std::{
    collections::BTreeMap,
    time::Duration,
};

use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    md_id::MdId,
    revision::MetadataRevision,
};

pub const CODE_SERVER_ERROR: u32 = 2800;
pub const CODE_BAD_REQUEST: u32 = 2801;
pub const CODE_CONFLICT_REVISION: u32 = 2802;
pub const CODE_CONFLICT_PREV_ROOT: u32 = 2803;
pub const CODE_CONFLICT_DISK_USAGE: u32 = 2804;
pub const CODE_LOCKED: u32 = 2805;
pub const CODE_UNAUTHORIZED: u32 = 2806;
pub const CODE_THROTTLE: u32 = 2807;
pub const CODE_CONDITION_FAILED: u32 = 2808;
pub const CODE_WRITE_ACCESS: u32 = 2809;
pub const CODE_CONFLICT_FOLDER_MAPPING: u32 = 2810;

/// An error returned by the metadata server. Carried as typed values so
/// clients can branch on the kind; the journal's flush path depends on
/// distinguishing the conflict variants.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataServerError {
    #[error("metadata server error: {msg}")]
    Server { msg: String },

    #[error("bad request: {msg}")]
    BadRequest { msg: String },

    #[error("revision conflict: expected {expected}, got {actual}")]
    ConflictRevision {
        expected: MetadataRevision,
        actual: MetadataRevision,
    },

    #[error("previous root {actual} does not match the server head {expected}")]
    ConflictPrevRoot { expected: MdId, actual: MdId },

    #[error("disk usage conflict: expected {expected}, got {actual}")]
    ConflictDiskUsage { expected: u64, actual: u64 },

    #[error("folder is locked for a mutually exclusive operation")]
    Locked,

    #[error("unauthorized: {msg}")]
    Unauthorized { msg: String },

    #[error("throttled, retry after {}ms", .suggested_retry.as_millis())]
    Throttle { suggested_retry: Duration },

    #[error("condition failed: {msg}")]
    ConditionFailed { msg: String },

    #[error("user is not a writer of this folder")]
    WriteAccess,

    #[error("handle is already mapped to a different folder")]
    ConflictFolderMapping,
}

impl MetadataServerError {
    pub fn code(&self) -> u32 {
        match self {
            Self::Server { .. } => CODE_SERVER_ERROR,
            Self::BadRequest { .. } => CODE_BAD_REQUEST,
            Self::ConflictRevision { .. } => CODE_CONFLICT_REVISION,
            Self::ConflictPrevRoot { .. } => CODE_CONFLICT_PREV_ROOT,
            Self::ConflictDiskUsage { .. } => CODE_CONFLICT_DISK_USAGE,
            Self::Locked => CODE_LOCKED,
            Self::Unauthorized { .. } => CODE_UNAUTHORIZED,
            Self::Throttle { .. } => CODE_THROTTLE,
            Self::ConditionFailed { .. } => CODE_CONDITION_FAILED,
            Self::WriteAccess => CODE_WRITE_ACCESS,
            Self::ConflictFolderMapping => CODE_CONFLICT_FOLDER_MAPPING,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Server { .. } => "ServerError",
            Self::BadRequest { .. } => "BadRequest",
            Self::ConflictRevision { .. } => "ConflictRevision",
            Self::ConflictPrevRoot { .. } => "ConflictPrevRoot",
            Self::ConflictDiskUsage { .. } => "ConflictDiskUsage",
            Self::Locked => "Locked",
            Self::Unauthorized { .. } => "Unauthorized",
            Self::Throttle { .. } => "Throttle",
            Self::ConditionFailed { .. } => "ConditionFailed",
            Self::WriteAccess => "WriteAccess",
            Self::ConflictFolderMapping => "ConflictFolderMapping",
        }
    }

    /// Coarse classification used by logging and retry policy.
    pub fn error_metadata(&self) -> ErrorMetadata {
        let name = self.name();
        let msg = self.to_string();
        match self {
            Self::Server { .. } => ErrorMetadata::operational_internal_server_error(),
            Self::BadRequest { .. } | Self::ConditionFailed { .. } => {
                ErrorMetadata::bad_request(name, msg)
            },
            Self::ConflictRevision { .. }
            | Self::ConflictPrevRoot { .. }
            | Self::ConflictDiskUsage { .. }
            | Self::ConflictFolderMapping => ErrorMetadata::conflict(name, msg),
            Self::Locked => ErrorMetadata::locked(name, msg),
            Self::Unauthorized { .. } => ErrorMetadata::unauthenticated(name, msg),
            Self::Throttle { .. } => ErrorMetadata::throttled(name, msg),
            Self::WriteAccess => ErrorMetadata::forbidden(name, msg),
        }
    }

    /// Promote into an anyhow chain, keeping the typed value downcastable and
    /// attaching the coarse tag.
    pub fn into_anyhow(self) -> anyhow::Error {
        let metadata = self.error_metadata();
        anyhow::Error::new(self).context(metadata)
    }

    /// The wire form of this error.
    pub fn to_status(&self) -> StatusRecord {
        let mut fields = BTreeMap::new();
        match self {
            Self::ConflictRevision { expected, actual } => {
                fields.insert("expected".to_string(), u64::from(*expected).to_string());
                fields.insert("actual".to_string(), u64::from(*actual).to_string());
            },
            Self::ConflictPrevRoot { expected, actual } => {
                fields.insert("expected".to_string(), expected.as_hex());
                fields.insert("actual".to_string(), actual.as_hex());
            },
            Self::ConflictDiskUsage { expected, actual } => {
                fields.insert("expected".to_string(), expected.to_string());
                fields.insert("actual".to_string(), actual.to_string());
            },
            Self::Throttle { suggested_retry } => {
                fields.insert(
                    "retry_after_ms".to_string(),
                    suggested_retry.as_millis().to_string(),
                );
            },
            _ => {},
        }
        StatusRecord {
            code: self.code(),
            name: self.name().to_string(),
            description: self.to_string(),
            fields,
        }
    }
}

/// Generic RPC status record. Anything the transport hands back is reduced to
/// this shape before unwrapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub code: u32,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

/// A status whose code is not part of the protocol. Carried whole so nothing
/// is lost in transit.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("application status {} ({}): {}", .record.code, .record.name, .record.description)]
pub struct UnknownStatusError {
    pub record: StatusRecord,
}

fn field_u64(fields: &BTreeMap<String, String>, key: &str) -> u64 {
    fields
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}

fn field_md_id(fields: &BTreeMap<String, String>, key: &str) -> MdId {
    fields
        .get(key)
        .and_then(|v| MdId::from_hex(v).ok())
        .unwrap_or(MdId::ZERO)
}

/// Turn a wire status back into the typed kind. Codes outside the taxonomy
/// yield an `UnknownStatusError` carrying the full record.
pub fn unwrap_status(record: StatusRecord) -> anyhow::Error {
    let error = match record.code {
        CODE_SERVER_ERROR => MetadataServerError::Server {
            msg: record.description,
        },
        CODE_BAD_REQUEST => MetadataServerError::BadRequest {
            msg: record.description,
        },
        CODE_CONFLICT_REVISION => MetadataServerError::ConflictRevision {
            expected: MetadataRevision::new(field_u64(&record.fields, "expected")),
            actual: MetadataRevision::new(field_u64(&record.fields, "actual")),
        },
        CODE_CONFLICT_PREV_ROOT => MetadataServerError::ConflictPrevRoot {
            expected: field_md_id(&record.fields, "expected"),
            actual: field_md_id(&record.fields, "actual"),
        },
        CODE_CONFLICT_DISK_USAGE => MetadataServerError::ConflictDiskUsage {
            expected: field_u64(&record.fields, "expected"),
            actual: field_u64(&record.fields, "actual"),
        },
        CODE_LOCKED => MetadataServerError::Locked,
        CODE_UNAUTHORIZED => MetadataServerError::Unauthorized {
            msg: record.description,
        },
        CODE_THROTTLE => MetadataServerError::Throttle {
            suggested_retry: Duration::from_millis(field_u64(&record.fields, "retry_after_ms")),
        },
        CODE_CONDITION_FAILED => MetadataServerError::ConditionFailed {
            msg: record.description,
        },
        CODE_WRITE_ACCESS => MetadataServerError::WriteAccess,
        CODE_CONFLICT_FOLDER_MAPPING => MetadataServerError::ConflictFolderMapping,
        _ => {
            return anyhow::Error::new(UnknownStatusError { record })
                .context(ErrorMetadata::operational_internal_server_error());
        },
    };
    error.into_anyhow()
}
