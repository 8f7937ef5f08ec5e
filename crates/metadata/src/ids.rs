use std::fmt;

use anyhow::Context;
use errors::ErrorMetadata;
use runtime::Runtime;
use serde::{
    Deserialize,
    Serialize,
};

pub const ID_BYTE_LEN: usize = 16;

// The last byte of a folder id encodes its visibility class.
const SUFFIX_PRIVATE: u8 = 0x16;
const SUFFIX_PUBLIC: u8 = 0x17;

/// Identifier of a top-level folder. Sixteen opaque bytes whose final byte
/// distinguishes public from private folders. Immutable once minted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TlfId([u8; ID_BYTE_LEN]);

impl TlfId {
    /// Mint a fresh id from the runtime's randomness.
    pub fn mint<RT: Runtime>(rt: &RT, public: bool) -> Self {
        let mut bytes: [u8; ID_BYTE_LEN] = rt.random_bytes();
        bytes[ID_BYTE_LEN - 1] = if public { SUFFIX_PUBLIC } else { SUFFIX_PRIVATE };
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; ID_BYTE_LEN]) -> anyhow::Result<Self> {
        match bytes[ID_BYTE_LEN - 1] {
            SUFFIX_PRIVATE | SUFFIX_PUBLIC => Ok(Self(bytes)),
            suffix => Err(anyhow::anyhow!("invalid folder id suffix {suffix:#04x}").context(
                ErrorMetadata::bad_request("InvalidFolderId", "folder id has an unknown suffix"),
            )),
        }
    }

    pub fn is_public(&self) -> bool {
        self.0[ID_BYTE_LEN - 1] == SUFFIX_PUBLIC
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTE_LEN] {
        &self.0
    }
}

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlfId({})", hex::encode(self.0))
    }
}

/// Identifier of a line of development within a folder. The all-zero value is
/// the master (merged) branch; every other value names an unmerged branch
/// created by a fork.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchId([u8; ID_BYTE_LEN]);

impl BranchId {
    pub const NULL: BranchId = BranchId([0; ID_BYTE_LEN]);

    /// Generate a fresh unmerged branch id. Never returns the null value.
    pub fn generate<RT: Runtime>(rt: &RT) -> Self {
        loop {
            let candidate = Self(rt.random_bytes());
            if !candidate.is_null() {
                return candidate;
            }
        }
    }

    pub fn from_bytes(bytes: [u8; ID_BYTE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn merge_status(&self) -> MergeStatus {
        if self.is_null() {
            MergeStatus::Merged
        } else {
            MergeStatus::Unmerged
        }
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTE_LEN] {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "master")
        } else {
            write!(f, "{}", hex::encode(self.0))
        }
    }
}

impl fmt::Debug for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchId({self})")
    }
}

/// Whether a revision lives on the master branch or a forked one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeStatus {
    Merged,
    Unmerged,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStatus::Merged => write!(f, "merged"),
            MergeStatus::Unmerged => write!(f, "unmerged"),
        }
    }
}

/// A user of the filesystem.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId([u8; ID_BYTE_LEN]);

impl UserId {
    pub fn from_bytes(bytes: [u8; ID_BYTE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        let bytes: [u8; ID_BYTE_LEN] = bytes.try_into().context("user id must be 16 bytes")?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTE_LEN] {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", hex::encode(self.0))
    }
}

#[cfg(any(test, feature = "testing"))]
mod arbitrary_impls {
    use proptest::prelude::*;

    use super::{
        BranchId,
        TlfId,
        UserId,
        ID_BYTE_LEN,
        SUFFIX_PRIVATE,
        SUFFIX_PUBLIC,
    };

    impl Arbitrary for TlfId {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (any::<[u8; ID_BYTE_LEN]>(), any::<bool>())
                .prop_map(|(mut bytes, public)| {
                    bytes[ID_BYTE_LEN - 1] = if public { SUFFIX_PUBLIC } else { SUFFIX_PRIVATE };
                    TlfId(bytes)
                })
                .boxed()
        }
    }

    impl Arbitrary for BranchId {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<[u8; ID_BYTE_LEN]>().prop_map(BranchId).boxed()
        }
    }

    impl Arbitrary for UserId {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<[u8; ID_BYTE_LEN]>().prop_map(UserId).boxed()
        }
    }
}
