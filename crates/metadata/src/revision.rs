use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

/// Position of a revision within one (folder, branch) history. Strictly
/// positive and consecutive for real revisions; zero is the uninitialized
/// sentinel.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct MetadataRevision(u64);

impl MetadataRevision {
    pub const UNINITIALIZED: MetadataRevision = MetadataRevision(0);
    pub const INITIAL: MetadataRevision = MetadataRevision(1);

    pub fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn is_initialized(&self) -> bool {
        *self >= Self::INITIAL
    }

    pub fn succ(&self) -> anyhow::Result<Self> {
        let next = self
            .0
            .checked_add(1)
            .ok_or_else(|| anyhow::anyhow!("revision number overflow"))?;
        Ok(Self(next))
    }

    pub fn pred(&self) -> anyhow::Result<Self> {
        let prev = self
            .0
            .checked_sub(1)
            .ok_or_else(|| anyhow::anyhow!("revision number underflow"))?;
        Ok(Self(prev))
    }
}

impl From<MetadataRevision> for u64 {
    fn from(r: MetadataRevision) -> u64 {
        r.0
    }
}

impl fmt::Display for MetadataRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MetadataRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetadataRevision({})", self.0)
    }
}
