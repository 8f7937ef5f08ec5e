use std::collections::BTreeSet;

use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

use crate::ids::UserId;

/// The access lists of a top-level folder: who may write, who may read, and
/// whether the folder is world-readable. Sets are ordered so the canonical
/// encoding is stable.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TlfHandle {
    pub writers: BTreeSet<UserId>,
    pub readers: BTreeSet<UserId>,
    pub public: bool,
}

impl TlfHandle {
    pub fn new_private(
        writers: impl IntoIterator<Item = UserId>,
        readers: impl IntoIterator<Item = UserId>,
    ) -> Self {
        Self {
            writers: writers.into_iter().collect(),
            readers: readers.into_iter().collect(),
            public: false,
        }
    }

    pub fn new_public(writers: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            writers: writers.into_iter().collect(),
            readers: BTreeSet::new(),
            public: true,
        }
    }

    pub fn check_well_formed(&self) -> anyhow::Result<()> {
        if self.writers.is_empty() {
            anyhow::bail!(anyhow::anyhow!("folder handle has no writers").context(
                ErrorMetadata::bad_request("MalformedHandle", "a folder needs at least one writer")
            ));
        }
        if self.public && !self.readers.is_empty() {
            anyhow::bail!(anyhow::anyhow!("public folder with a reader list").context(
                ErrorMetadata::bad_request(
                    "MalformedHandle",
                    "public folders are readable by everyone and carry no reader list",
                )
            ));
        }
        if self.writers.intersection(&self.readers).next().is_some() {
            anyhow::bail!(anyhow::anyhow!("writer listed as reader").context(
                ErrorMetadata::bad_request(
                    "MalformedHandle",
                    "writers already read; the reader list must not repeat them",
                )
            ));
        }
        Ok(())
    }

    pub fn is_writer(&self, uid: UserId) -> bool {
        self.writers.contains(&uid)
    }

    pub fn is_reader(&self, uid: UserId) -> bool {
        self.public || self.writers.contains(&uid) || self.readers.contains(&uid)
    }
}
