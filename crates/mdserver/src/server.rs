use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use futures::{
    future,
    stream::{
        self,
        BoxStream,
    },
    StreamExt,
};
use journal::MdServerConnection;
use metadata::{
    BranchId,
    Codec,
    KeyDirectory,
    MergeStatus,
    MetadataRevision,
    MetadataServerError,
    RootMetadataSigned,
    TlfHandle,
    TlfId,
    UserId,
};
use parking_lot::Mutex;
use runtime::Runtime;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    metrics,
    store::ServerStore,
};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// The authoritative revision log, one serial history per (folder, branch).
///
/// Writes are serialized under a single lock so every conditional append sees
/// a consistent tail; signature verification runs before the lock is taken.
/// Reads go straight to the store.
///
/// Requests that reach the server run to completion: cancellation is a
/// client-side concern, and a committed put stays committed even if the
/// caller gave up waiting for the acknowledgment.
pub struct MetadataServer<RT: Runtime, C: Codec> {
    rt: RT,
    codec: C,
    key_directory: Arc<dyn KeyDirectory>,
    store: Box<dyn ServerStore>,
    write_lock: tokio::sync::Mutex<()>,
    notifiers: Mutex<HashMap<TlfId, broadcast::Sender<MetadataRevision>>>,
    planted_failure: Mutex<Option<MetadataServerError>>,
}

impl<RT: Runtime, C: Codec> MetadataServer<RT, C> {
    pub fn new(
        rt: RT,
        codec: C,
        key_directory: Arc<dyn KeyDirectory>,
        store: Box<dyn ServerStore>,
    ) -> Self {
        Self {
            rt,
            codec,
            key_directory,
            store,
            write_lock: tokio::sync::Mutex::new(()),
            notifiers: Mutex::new(HashMap::new()),
            planted_failure: Mutex::new(None),
        }
    }

    /// Make the next operation fail with `error`. Exercises the throttle and
    /// lock paths that a loaded production server produces on its own.
    #[cfg(any(test, feature = "testing"))]
    pub fn plant_failure(&self, error: MetadataServerError) {
        *self.planted_failure.lock() = Some(error);
    }

    fn take_planted_failure(&self) -> anyhow::Result<()> {
        if let Some(error) = self.planted_failure.lock().take() {
            return Err(error.into_anyhow());
        }
        Ok(())
    }

    /// Look up a folder by its handle, minting a fresh id the first time the
    /// handle is seen. Returns the merged head once one exists.
    pub async fn get_for_handle(
        &self,
        _ctx: &CancellationToken,
        caller: UserId,
        handle: &TlfHandle,
        merge: MergeStatus,
    ) -> anyhow::Result<(TlfId, Option<RootMetadataSigned>)> {
        self.take_planted_failure()?;
        handle
            .check_well_formed()
            .map_err(|e| MetadataServerError::BadRequest { msg: e.to_string() }.into_anyhow())?;
        if !handle.is_reader(caller) {
            return Err(MetadataServerError::Unauthorized {
                msg: format!("{caller} is not a reader of this folder"),
            }
            .into_anyhow());
        }

        let handle_bytes = self.codec.encode(handle)?;
        let _write = self.write_lock.lock().await;
        let id = match self.store.handle_mapping(&handle_bytes).await? {
            Some(id) => {
                if id.is_public() != handle.public {
                    return Err(MetadataServerError::ConflictFolderMapping.into_anyhow());
                }
                id
            },
            None => {
                let id = TlfId::mint(&self.rt, handle.public);
                self.store.record_handle(handle_bytes, id).await?;
                metrics::log_folder_created();
                tracing::info!("minted folder {id} for a new handle");
                id
            },
        };
        let head = match merge {
            MergeStatus::Merged => self.decode_head(id, BranchId::NULL).await?,
            // An unmerged lookup needs a branch id; by handle there is none.
            MergeStatus::Unmerged => None,
        };
        Ok((id, head))
    }

    /// The tail of the requested branch, or None while the branch is empty.
    pub async fn get_for_tlf(
        &self,
        _ctx: &CancellationToken,
        caller: UserId,
        id: TlfId,
        branch_id: BranchId,
        merge: MergeStatus,
    ) -> anyhow::Result<Option<RootMetadataSigned>> {
        self.take_planted_failure()?;
        check_merge_consistency(branch_id, merge)?;
        self.authorize_read(caller, id).await?;
        self.decode_head(id, branch_id).await
    }

    /// Revisions of one branch with numbers in `[start, stop]`, ascending.
    pub async fn get_range(
        &self,
        _ctx: &CancellationToken,
        caller: UserId,
        id: TlfId,
        branch_id: BranchId,
        merge: MergeStatus,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> anyhow::Result<Vec<RootMetadataSigned>> {
        self.take_planted_failure()?;
        check_merge_consistency(branch_id, merge)?;
        self.authorize_read(caller, id).await?;
        let encoded = self.store.range(id, branch_id, start, stop).await?;
        encoded
            .iter()
            .map(|data| self.codec.decode(data))
            .collect()
    }

    /// Conditional append. The revision must extend the branch tail; the
    /// error distinguishes a stale revision number from a broken chain
    /// pointer so clients can decide between forking and giving up.
    pub async fn put(
        &self,
        ctx: &CancellationToken,
        rmds: RootMetadataSigned,
    ) -> anyhow::Result<()> {
        self.take_planted_failure()?;
        metrics::log_put();

        let id = rmds.tlf_id();
        let branch_id = rmds.branch_id();
        let revision = rmds.revision();
        let writer = rmds.root_metadata.writer_metadata.last_modifying_writer;

        // Authorization comes first, and it runs against the folder's stored
        // handle, never the one inside the incoming payload: once any
        // revision is on record its handle is authoritative, exactly as for
        // reads and pruning. The payload's own handle only vouches for a
        // brand-new folder that has nothing stored yet.
        let mut stored = self.decode_head(id, BranchId::NULL).await?;
        if stored.is_none() && !branch_id.is_null() {
            stored = self.decode_head(id, branch_id).await?;
        }
        let authoritative_handle = match stored {
            Some(ref head) => head.handle(),
            None => rmds.handle(),
        };
        if !authoritative_handle.is_writer(writer) {
            return Err(MetadataServerError::WriteAccess.into_anyhow());
        }
        if self
            .key_directory
            .check_device_key(ctx, writer, &rmds.root_signature.verifying_key)
            .await
            .is_err()
        {
            return Err(MetadataServerError::WriteAccess.into_anyhow());
        }

        // Everything signature-shaped happens before the write lock.
        rmds.is_valid_and_signed(&self.codec)
            .map_err(|e| MetadataServerError::BadRequest { msg: e.to_string() }.into_anyhow())?;

        let _write = self.write_lock.lock().await;

        let handle_bytes = self.codec.encode(rmds.handle())?;
        match self.store.handle_mapping(&handle_bytes).await? {
            None => self.store.record_handle(handle_bytes, id).await?,
            Some(existing) if existing == id => {},
            Some(_) => {
                return Err(MetadataServerError::ConflictFolderMapping.into_anyhow());
            },
        }

        match self.decode_head(id, branch_id).await? {
            Some(tail) => {
                let tail_id = tail.md_id(&self.codec)?;
                match tail
                    .root_metadata
                    .check_valid_successor(tail_id, &rmds.root_metadata)
                {
                    Ok(()) => {},
                    Err(_) if revision <= tail.revision() => {
                        metrics::log_put_conflict();
                        return Err(MetadataServerError::ConflictRevision {
                            expected: tail.revision().succ()?,
                            actual: revision,
                        }
                        .into_anyhow());
                    },
                    Err(_) if rmds.prev_root() != tail_id => {
                        metrics::log_put_conflict();
                        return Err(MetadataServerError::ConflictPrevRoot {
                            expected: tail_id,
                            actual: rmds.prev_root(),
                        }
                        .into_anyhow());
                    },
                    Err(e) => {
                        return Err(MetadataServerError::BadRequest { msg: e.to_string() }
                            .into_anyhow());
                    },
                }
            },
            None => {
                if branch_id.is_null() && revision != MetadataRevision::INITIAL {
                    return Err(MetadataServerError::BadRequest {
                        msg: format!(
                            "merged history of {id} must start at revision 1, not {revision}"
                        ),
                    }
                    .into_anyhow());
                }
                // A fresh unmerged branch may start anywhere: its first entry
                // either opens a new history (initial, zero prev root) or
                // continues from a merged ancestor this server does not
                // resolve. Structural validation already pinned that shape.
            },
        }

        self.store
            .append(id, branch_id, revision, self.codec.encode(&rmds)?)
            .await?;
        tracing::debug!("committed revision {revision} on branch {branch_id} of {id}");
        if branch_id.is_null() {
            self.notify_merged_advance(id, revision);
        }
        Ok(())
    }

    /// Delete every revision of an unmerged branch. Idempotent.
    pub async fn prune_branch(
        &self,
        _ctx: &CancellationToken,
        caller: UserId,
        id: TlfId,
        branch_id: BranchId,
    ) -> anyhow::Result<()> {
        self.take_planted_failure()?;
        if branch_id.is_null() {
            return Err(MetadataServerError::BadRequest {
                msg: "the master branch cannot be pruned".to_string(),
            }
            .into_anyhow());
        }
        self.authorize_write(caller, id).await?;
        let _write = self.write_lock.lock().await;
        self.store.prune(id, branch_id).await?;
        tracing::info!("pruned branch {branch_id} of {id}");
        Ok(())
    }

    /// Stream of merged-head revisions past `last_seen`. Fires immediately if
    /// the head is already there; multiple registrations per caller are fine.
    pub async fn register_for_update(
        &self,
        _ctx: &CancellationToken,
        caller: UserId,
        id: TlfId,
        last_seen: MetadataRevision,
    ) -> anyhow::Result<BoxStream<'static, MetadataRevision>> {
        self.take_planted_failure()?;
        self.authorize_read(caller, id).await?;
        let receiver = {
            let mut notifiers = self.notifiers.lock();
            notifiers
                .entry(id)
                .or_insert_with(|| broadcast::channel(UPDATE_CHANNEL_CAPACITY).0)
                .subscribe()
        };
        let updates = BroadcastStream::new(receiver)
            .filter_map(|update| future::ready(update.ok()))
            .filter(move |revision| future::ready(*revision > last_seen));
        let current = self
            .decode_head(id, BranchId::NULL)
            .await?
            .map(|head| head.revision());
        let stream = match current {
            Some(revision) if revision > last_seen => {
                stream::once(future::ready(revision)).chain(updates).boxed()
            },
            _ => updates.boxed(),
        };
        Ok(stream)
    }

    async fn decode_head(
        &self,
        id: TlfId,
        branch_id: BranchId,
    ) -> anyhow::Result<Option<RootMetadataSigned>> {
        match self.store.head(id, branch_id).await? {
            None => Ok(None),
            Some(data) => Ok(Some(self.codec.decode(&data)?)),
        }
    }

    /// Folders with no merged history yet are readable by anyone; there is
    /// nothing to leak. Once a head exists, its handle is authoritative.
    async fn authorize_read(&self, caller: UserId, id: TlfId) -> anyhow::Result<()> {
        if let Some(head) = self.decode_head(id, BranchId::NULL).await? {
            if !head.handle().is_reader(caller) {
                return Err(MetadataServerError::Unauthorized {
                    msg: format!("{caller} is not a reader of {id}"),
                }
                .into_anyhow());
            }
        }
        Ok(())
    }

    async fn authorize_write(&self, caller: UserId, id: TlfId) -> anyhow::Result<()> {
        if let Some(head) = self.decode_head(id, BranchId::NULL).await? {
            if !head.handle().is_writer(caller) {
                return Err(MetadataServerError::Unauthorized {
                    msg: format!("{caller} is not a writer of {id}"),
                }
                .into_anyhow());
            }
        }
        Ok(())
    }

    fn notify_merged_advance(&self, id: TlfId, revision: MetadataRevision) {
        let sender = {
            let mut notifiers = self.notifiers.lock();
            notifiers
                .entry(id)
                .or_insert_with(|| broadcast::channel(UPDATE_CHANNEL_CAPACITY).0)
                .clone()
        };
        // No receivers is fine; nobody is waiting on this folder.
        let _ = sender.send(revision);
    }
}

fn check_merge_consistency(branch_id: BranchId, merge: MergeStatus) -> anyhow::Result<()> {
    if branch_id.merge_status() != merge {
        return Err(MetadataServerError::BadRequest {
            msg: format!(
                "{merge} lookup against branch {branch_id} is inconsistent"
            ),
        }
        .into_anyhow());
    }
    Ok(())
}

/// One client session's view of the server, narrowed to the capability the
/// journal flushes through. Errors cross this seam the way they cross the
/// real wire: reduced to a status record and unwrapped back into the typed
/// kind on the client side.
pub struct ServerConnection<RT: Runtime, C: Codec> {
    server: Arc<MetadataServer<RT, C>>,
    caller: UserId,
}

impl<RT: Runtime, C: Codec> ServerConnection<RT, C> {
    pub fn new(server: Arc<MetadataServer<RT, C>>, caller: UserId) -> Self {
        Self { server, caller }
    }
}

fn over_the_wire(error: anyhow::Error) -> anyhow::Error {
    match error.downcast_ref::<MetadataServerError>() {
        Some(typed) => metadata::unwrap_status(typed.to_status()),
        None => error,
    }
}

#[async_trait]
impl<RT: Runtime, C: Codec> MdServerConnection for ServerConnection<RT, C> {
    async fn put(
        &self,
        ctx: &CancellationToken,
        rmds: &RootMetadataSigned,
    ) -> anyhow::Result<()> {
        self.server
            .put(ctx, rmds.clone())
            .await
            .map_err(over_the_wire)
    }

    async fn get_range(
        &self,
        ctx: &CancellationToken,
        id: TlfId,
        branch_id: BranchId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> anyhow::Result<Vec<RootMetadataSigned>> {
        self.server
            .get_range(
                ctx,
                self.caller,
                id,
                branch_id,
                branch_id.merge_status(),
                start,
                stop,
            )
            .await
            .map_err(over_the_wire)
    }
}
