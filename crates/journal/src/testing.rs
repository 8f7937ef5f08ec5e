//! In-memory `LogPersistence` for tests, mirroring the on-disk behavior
//! without touching the filesystem.

use std::{
    collections::VecDeque,
    sync::Arc,
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use metadata::BranchId;
use parking_lot::Mutex;

use crate::log::LogPersistence;

#[derive(Clone)]
pub struct TestLogPersistence {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    earliest: u64,
    entries: VecDeque<Vec<u8>>,
    branch_id: BranchId,
}

impl TestLogPersistence {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                earliest: 0,
                entries: VecDeque::new(),
                branch_id: BranchId::NULL,
            })),
        }
    }
}

impl Default for TestLogPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn offset(&self, index: u64) -> anyhow::Result<usize> {
        let in_window =
            index >= self.earliest && index < self.earliest + self.entries.len() as u64;
        if !in_window {
            return Err(anyhow::anyhow!("no live entry at index {index}").context(
                ErrorMetadata::not_found(
                    "LogIndexOutOfRange",
                    "the requested index is outside the log's live window",
                ),
            ));
        }
        Ok((index - self.earliest) as usize)
    }
}

#[async_trait]
impl LogPersistence for TestLogPersistence {
    async fn len(&self) -> anyhow::Result<u64> {
        Ok(self.inner.lock().entries.len() as u64)
    }

    async fn earliest_index(&self) -> anyhow::Result<Option<u64>> {
        let inner = self.inner.lock();
        Ok((!inner.entries.is_empty()).then_some(inner.earliest))
    }

    async fn latest_index(&self) -> anyhow::Result<Option<u64>> {
        let inner = self.inner.lock();
        Ok((!inner.entries.is_empty()).then(|| inner.earliest + inner.entries.len() as u64 - 1))
    }

    async fn append(&self, data: Vec<u8>) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock();
        let index = inner.earliest + inner.entries.len() as u64;
        inner.entries.push_back(data);
        Ok(index)
    }

    async fn get(&self, index: u64) -> anyhow::Result<Vec<u8>> {
        let inner = self.inner.lock();
        let offset = inner.offset(index)?;
        Ok(inner.entries[offset].clone())
    }

    async fn replace(&self, index: u64, data: Vec<u8>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let offset = inner.offset(index)?;
        inner.entries[offset] = data;
        Ok(())
    }

    async fn remove_earliest(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(
            inner.entries.pop_front().is_some(),
            "remove_earliest called on an empty log"
        );
        if inner.entries.is_empty() {
            inner.earliest = 0;
        } else {
            inner.earliest += 1;
        }
        Ok(())
    }

    async fn clear_all(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.earliest = 0;
        Ok(())
    }

    async fn branch_id(&self) -> anyhow::Result<BranchId> {
        Ok(self.inner.lock().branch_id)
    }

    async fn set_branch_id(&self, branch_id: BranchId) -> anyhow::Result<()> {
        self.inner.lock().branch_id = branch_id;
        Ok(())
    }

    async fn install(&self, entries: Vec<Vec<u8>>, branch_id: BranchId) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.entries = entries.into();
        inner.earliest = 0;
        inner.branch_id = branch_id;
        Ok(())
    }
}
