use async_trait::async_trait;
use metadata::BranchId;

/// Durable append-only log underlying one journal, plus a small header record
/// holding the journal's current branch id.
///
/// Indices are dense within the live window `[earliest, latest]`. Each
/// operation is atomic: after a crash, recovery yields the state left by some
/// prefix of the completed operations, never a torn one. `append` must have
/// durably persisted the entry before returning.
///
/// The log is the private resource of a single journal; concurrent access
/// from multiple processes is not supported.
#[async_trait]
pub trait LogPersistence: Send + Sync + 'static {
    /// Number of live entries.
    async fn len(&self) -> anyhow::Result<u64>;

    async fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn earliest_index(&self) -> anyhow::Result<Option<u64>>;

    async fn latest_index(&self) -> anyhow::Result<Option<u64>>;

    /// Append one entry, returning its index.
    async fn append(&self, data: Vec<u8>) -> anyhow::Result<u64>;

    /// Read one live entry. Indices outside the live window fail with a
    /// NotFound-tagged error.
    async fn get(&self, index: u64) -> anyhow::Result<Vec<u8>>;

    /// Overwrite exactly one live entry.
    async fn replace(&self, index: u64, data: Vec<u8>) -> anyhow::Result<()>;

    /// Reclaim the oldest entry, advancing the live window.
    async fn remove_earliest(&self) -> anyhow::Result<()>;

    /// Truncate to empty. `len()` is zero afterward.
    async fn clear_all(&self) -> anyhow::Result<()>;

    async fn branch_id(&self) -> anyhow::Result<BranchId>;

    async fn set_branch_id(&self, branch_id: BranchId) -> anyhow::Result<()>;

    /// Atomically replace the whole live window and the branch header in one
    /// step. Observers see either the old entries or the new ones, never a
    /// mixture. This is the swap target for fork conversion's shadow log.
    async fn install(&self, entries: Vec<Vec<u8>>, branch_id: BranchId) -> anyhow::Result<()>;
}
