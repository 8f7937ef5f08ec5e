use std::{
    collections::BTreeMap,
    sync::Arc,
};

use async_trait::async_trait;
use metadata::{
    BranchId,
    MetadataRevision,
    TlfId,
};
use parking_lot::Mutex;

use crate::store::ServerStore;

/// Whole-server state in memory. The default shim for tests and local
/// development.
#[derive(Clone)]
pub struct MemoryServerStore {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    handles: BTreeMap<Vec<u8>, TlfId>,
    logs: BTreeMap<(TlfId, BranchId), BTreeMap<MetadataRevision, Vec<u8>>>,
}

impl MemoryServerStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                handles: BTreeMap::new(),
                logs: BTreeMap::new(),
            })),
        }
    }
}

impl Default for MemoryServerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerStore for MemoryServerStore {
    async fn handle_mapping(&self, handle_bytes: &[u8]) -> anyhow::Result<Option<TlfId>> {
        Ok(self.inner.lock().handles.get(handle_bytes).copied())
    }

    async fn record_handle(&self, handle_bytes: Vec<u8>, id: TlfId) -> anyhow::Result<()> {
        self.inner.lock().handles.insert(handle_bytes, id);
        Ok(())
    }

    async fn head(&self, id: TlfId, branch_id: BranchId) -> anyhow::Result<Option<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(inner
            .logs
            .get(&(id, branch_id))
            .and_then(|log| log.values().next_back().cloned()))
    }

    async fn append(
        &self,
        id: TlfId,
        branch_id: BranchId,
        revision: MetadataRevision,
        data: Vec<u8>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let log = inner.logs.entry((id, branch_id)).or_default();
        anyhow::ensure!(
            !log.contains_key(&revision),
            "branch {branch_id} of {id} already has revision {revision}",
        );
        log.insert(revision, data);
        Ok(())
    }

    async fn range(
        &self,
        id: TlfId,
        branch_id: BranchId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        let inner = self.inner.lock();
        Ok(inner
            .logs
            .get(&(id, branch_id))
            .map(|log| log.range(start..=stop).map(|(_, data)| data.clone()).collect())
            .unwrap_or_default())
    }

    async fn prune(&self, id: TlfId, branch_id: BranchId) -> anyhow::Result<()> {
        self.inner.lock().logs.remove(&(id, branch_id));
        Ok(())
    }
}
