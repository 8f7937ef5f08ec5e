use async_trait::async_trait;
use metadata::{
    BranchId,
    MetadataRevision,
    TlfId,
};

/// Storage backing one metadata server: the canonical handle mapping plus an
/// ordered revision log per (folder, branch). The store deals in encoded
/// revisions; the protocol layer owns validation and decoding.
#[async_trait]
pub trait ServerStore: Send + Sync + 'static {
    async fn handle_mapping(&self, handle_bytes: &[u8]) -> anyhow::Result<Option<TlfId>>;

    async fn record_handle(&self, handle_bytes: Vec<u8>, id: TlfId) -> anyhow::Result<()>;

    /// The encoded tail of a branch, if the branch has any revisions.
    async fn head(&self, id: TlfId, branch_id: BranchId) -> anyhow::Result<Option<Vec<u8>>>;

    /// Append one encoded revision. The revision number must be new for the
    /// branch.
    async fn append(
        &self,
        id: TlfId,
        branch_id: BranchId,
        revision: MetadataRevision,
        data: Vec<u8>,
    ) -> anyhow::Result<()>;

    /// Encoded revisions with numbers in `[start, stop]`, ascending.
    async fn range(
        &self,
        id: TlfId,
        branch_id: BranchId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> anyhow::Result<Vec<Vec<u8>>>;

    /// Drop a whole branch. Missing branches are fine.
    async fn prune(&self, id: TlfId, branch_id: BranchId) -> anyhow::Result<()>;
}
