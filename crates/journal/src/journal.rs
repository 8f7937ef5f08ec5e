use std::path::Path;

use async_trait::async_trait;
use errors::ErrorMetadata;
use metadata::{
    BranchId,
    Codec,
    ImmutableRootMetadata,
    MdId,
    MetadataRevision,
    MetadataServerError,
    RootMetadata,
    RootMetadataSigned,
    Signer,
    TlfId,
    UserId,
    VerifyingKey,
};
use runtime::Runtime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    log::LogPersistence,
    metrics,
    sqlite_log::SqliteLogPersistence,
};

/// Raised by `put` when the journal has already forked and the caller hands
/// it a merged revision. The caller re-stamps its record onto the journal's
/// branch and retries.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("journal is on branch {branch_id}; merged revisions are no longer accepted")]
pub struct JournalConflictError {
    pub branch_id: BranchId,
}

impl JournalConflictError {
    pub fn into_anyhow(self) -> anyhow::Error {
        let message = self.to_string();
        anyhow::Error::new(self).context(ErrorMetadata::conflict("JournalForked", message))
    }
}

/// The slice of the server surface the journal needs for flushing. The full
/// server protocol stays out of this crate on purpose.
#[async_trait]
pub trait MdServerConnection: Send + Sync {
    async fn put(
        &self,
        ctx: &CancellationToken,
        rmds: &RootMetadataSigned,
    ) -> anyhow::Result<()>;

    async fn get_range(
        &self,
        ctx: &CancellationToken,
        id: TlfId,
        branch_id: BranchId,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> anyhow::Result<Vec<RootMetadataSigned>>;
}

/// The ordered history of one folder's pending revisions on one device.
///
/// Revisions are appended locally while offline and drained to the metadata
/// server one at a time. A revision conflict on flush converts the whole
/// journal onto a fresh unmerged branch; the server arbitrates the merge
/// later.
///
/// Every operation serializes on the journal's own mutex. No user code runs
/// under it.
pub struct MetadataJournal<RT: Runtime, C: Codec> {
    rt: RT,
    codec: C,
    tlf_id: TlfId,
    uid: UserId,
    verifying_key: VerifyingKey,
    inner: Mutex<Inner>,
}

struct Inner {
    log: Box<dyn LogPersistence>,
    branch_id: BranchId,
}

impl<RT: Runtime, C: Codec> MetadataJournal<RT, C> {
    /// Build a journal over an already-opened log, picking up the branch the
    /// log was on when the process last stopped.
    pub async fn new(
        rt: RT,
        codec: C,
        tlf_id: TlfId,
        uid: UserId,
        verifying_key: VerifyingKey,
        log: Box<dyn LogPersistence>,
    ) -> anyhow::Result<Self> {
        let branch_id = log.branch_id().await?;
        Ok(Self {
            rt,
            codec,
            tlf_id,
            uid,
            verifying_key,
            inner: Mutex::new(Inner { log, branch_id }),
        })
    }

    /// Open (or create) the durable journal for `tlf_id` under `dir`.
    pub async fn open(
        rt: RT,
        codec: C,
        tlf_id: TlfId,
        uid: UserId,
        verifying_key: VerifyingKey,
        dir: &Path,
    ) -> anyhow::Result<Self> {
        let log = SqliteLogPersistence::new(dir)?;
        Self::new(rt, codec, tlf_id, uid, verifying_key, Box::new(log)).await
    }

    pub fn tlf_id(&self) -> TlfId {
        self.tlf_id
    }

    pub async fn branch_id(&self) -> BranchId {
        self.inner.lock().await.branch_id
    }

    pub async fn len(&self) -> anyhow::Result<u64> {
        self.inner.lock().await.log.len().await
    }

    /// Sign `rmd` with this journal's identity and append it, or replace the
    /// head when the revision number matches it. Returns the new revision's
    /// md id.
    pub async fn put(
        &self,
        ctx: &CancellationToken,
        signer: &dyn Signer,
        mut rmd: RootMetadata,
    ) -> anyhow::Result<MdId> {
        let inner = self.inner.lock().await;
        check_context(ctx)?;
        anyhow::ensure!(
            rmd.tlf_id() == self.tlf_id,
            "revision for folder {} handed to the journal of {}",
            rmd.tlf_id(),
            self.tlf_id,
        );

        let head = read_head(&self.codec, inner.log.as_ref()).await?;

        // A forked journal stays forked even once drained, so a merged put is
        // rejected regardless of whether any entries are pending.
        if rmd.branch_id().is_null() && !inner.branch_id.is_null() {
            return Err(JournalConflictError {
                branch_id: inner.branch_id,
            }
            .into_anyhow());
        }
        rmd.stamp_branch(inner.branch_id);
        rmd.set_last_modified_by(self.uid);

        let mut replace_head = false;
        if let Some(ref head) = head {
            if rmd.revision() == head.revision() {
                // Replacing the head in place: the replacement must keep the
                // chain shape it is taking over.
                anyhow::ensure!(
                    head.rmds.merge_status() == rmd.merge_status(),
                    "head replacement changes merge status at revision {}",
                    rmd.revision(),
                );
                anyhow::ensure!(
                    rmd.prev_root() == head.rmds.prev_root(),
                    "head replacement changes prev root at revision {}",
                    rmd.revision(),
                );
                replace_head = true;
            } else if let Err(e) = head
                .rmds
                .root_metadata
                .check_valid_successor(head.md_id, &rmd)
            {
                return Err(anyhow::Error::new(e).context(ErrorMetadata::bad_request(
                    "RevisionChainBroken",
                    "revision does not chain onto the journal head",
                )));
            }
        }

        let rmds = rmd.sign(ctx, &self.codec, signer).await?;
        let entry = ImmutableRootMetadata::new(&self.codec, rmds)?;
        let data = self.codec.encode(&entry.rmds)?;
        if replace_head {
            let latest = inner
                .log
                .latest_index()
                .await?
                .ok_or_else(|| anyhow::anyhow!("journal emptied during head replacement"))?;
            inner.log.replace(latest, data).await?;
        } else {
            inner.log.append(data).await?;
            metrics::log_append();
        }
        tracing::debug!(
            "journaled revision {} for {} on branch {}",
            entry.revision(),
            self.tlf_id,
            entry.branch_id(),
        );
        Ok(entry.md_id)
    }

    /// The most recent journaled revision, if any.
    pub async fn head(
        &self,
        ctx: &CancellationToken,
    ) -> anyhow::Result<Option<ImmutableRootMetadata>> {
        let inner = self.inner.lock().await;
        check_context(ctx)?;
        read_head(&self.codec, inner.log.as_ref()).await
    }

    /// All journaled revisions with numbers in `[start, stop]`, ascending.
    pub async fn range(
        &self,
        ctx: &CancellationToken,
        start: MetadataRevision,
        stop: MetadataRevision,
    ) -> anyhow::Result<Vec<ImmutableRootMetadata>> {
        let inner = self.inner.lock().await;
        check_context(ctx)?;
        let Some(earliest) = inner.log.earliest_index().await? else {
            return Ok(Vec::new());
        };
        let latest = inner
            .log
            .latest_index()
            .await?
            .ok_or_else(|| anyhow::anyhow!("log window lost its upper bound"))?;
        let mut entries = Vec::new();
        for index in earliest..=latest {
            let entry = read_entry(&self.codec, inner.log.as_ref(), index).await?;
            let revision = entry.revision();
            if revision > stop {
                break;
            }
            if revision >= start {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Rewrite the whole journal onto a fresh unmerged branch. All-or-nothing:
    /// a failure partway through (eg the signer giving out) leaves the
    /// journal exactly as it was.
    pub async fn convert_to_branch(
        &self,
        ctx: &CancellationToken,
        signer: &dyn Signer,
    ) -> anyhow::Result<BranchId> {
        let mut inner = self.inner.lock().await;
        check_context(ctx)?;
        self.convert_locked(ctx, signer, &mut inner).await
    }

    async fn convert_locked(
        &self,
        ctx: &CancellationToken,
        signer: &dyn Signer,
        inner: &mut Inner,
    ) -> anyhow::Result<BranchId> {
        if !inner.branch_id.is_null() {
            anyhow::bail!(anyhow::anyhow!(
                "journal is already on branch {}",
                inner.branch_id
            )
            .context(ErrorMetadata::bad_request(
                "JournalAlreadyForked",
                "the journal has already been converted to a branch",
            )));
        }
        let Some(earliest) = inner.log.earliest_index().await? else {
            anyhow::bail!("cannot fork an empty journal");
        };
        let latest = inner
            .log
            .latest_index()
            .await?
            .ok_or_else(|| anyhow::anyhow!("log window lost its upper bound"))?;

        let branch_id = BranchId::generate(&self.rt);

        // Re-sign every entry into a shadow list first. The live log is only
        // touched by the final atomic install.
        let mut shadow = Vec::with_capacity((latest - earliest + 1) as usize);
        let mut prev_root = None;
        for index in earliest..=latest {
            let entry = read_entry(&self.codec, inner.log.as_ref(), index).await?;
            let mut rmd = entry.rmds.root_metadata;
            rmd.writer_signature = None;
            rmd.stamp_branch(branch_id);
            if let Some(prev) = prev_root {
                rmd.set_prev_root(prev);
            }
            let rmds = rmd.sign(ctx, &self.codec, signer).await?;
            prev_root = Some(rmds.md_id(&self.codec)?);
            shadow.push(self.codec.encode(&rmds)?);
        }

        inner.log.install(shadow, branch_id).await?;
        inner.branch_id = branch_id;
        metrics::log_branch_conversion();
        tracing::info!(
            "converted journal for {} onto branch {branch_id}",
            self.tlf_id
        );
        Ok(branch_id)
    }

    /// Submit the oldest pending revision to the server. Returns false when
    /// the journal is empty, true when progress was made. On a revision
    /// conflict against the master branch the journal forks and reports
    /// progress without consuming the entry; the caller drives again.
    ///
    /// Safe against canceled flushes that committed server-side: before
    /// re-forking, the server's entry at the local revision is compared by md
    /// id, and an identical one counts as a success.
    pub async fn flush_one(
        &self,
        ctx: &CancellationToken,
        signer: &dyn Signer,
        server: &dyn MdServerConnection,
    ) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(earliest) = inner.log.earliest_index().await? else {
            return Ok(false);
        };
        let entry = read_entry(&self.codec, inner.log.as_ref(), earliest).await?;

        let result = server.put(ctx, &entry.rmds).await;
        // The put may have landed even if the context was canceled while it
        // was in flight. Consume nothing; the next flush re-checks against
        // the server.
        check_context(ctx)?;

        match result {
            Ok(()) => {
                inner.log.remove_earliest().await?;
                metrics::log_flush();
                tracing::debug!(
                    "flushed revision {} of {} to the server",
                    entry.revision(),
                    self.tlf_id,
                );
                Ok(true)
            },
            Err(error) => match error.downcast_ref::<MetadataServerError>() {
                Some(MetadataServerError::ConflictRevision { .. }) => {
                    metrics::log_flush_conflict();
                    let revision = entry.revision();
                    let server_entries = server
                        .get_range(ctx, self.tlf_id, entry.branch_id(), revision, revision)
                        .await?;
                    if let Some(server_head) = server_entries.last() {
                        if server_head.md_id(&self.codec)? == entry.md_id {
                            tracing::info!(
                                "server already holds revision {revision} of {}; treating the \
                                 conflict as a committed put",
                                self.tlf_id,
                            );
                            inner.log.remove_earliest().await?;
                            metrics::log_flush();
                            return Ok(true);
                        }
                    }
                    if inner.branch_id.is_null() {
                        self.convert_locked(ctx, signer, &mut inner).await?;
                        return Ok(true);
                    }
                    // Conflicts on an already-forked journal mean the chain
                    // itself is wrong. Nothing to recover locally.
                    Err(error)
                },
                _ => Err(error),
            },
        }
    }

    /// Drop a fully flushed branch and return to master. Clearing master
    /// itself is disallowed, and clearing a branch the journal is not on is a
    /// no-op. Idempotent.
    pub async fn clear(
        &self,
        ctx: &CancellationToken,
        branch_id: BranchId,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        check_context(ctx)?;
        if branch_id.is_null() {
            anyhow::bail!(anyhow::anyhow!("refusing to clear the master branch").context(
                ErrorMetadata::bad_request(
                    "ClearMasterBranch",
                    "only unmerged branches can be cleared",
                )
            ));
        }
        if branch_id != inner.branch_id {
            return Ok(());
        }
        inner.log.clear_all().await?;
        inner.log.set_branch_id(BranchId::NULL).await?;
        inner.branch_id = BranchId::NULL;
        tracing::info!("cleared branch {branch_id} of {}", self.tlf_id);
        Ok(())
    }

    pub fn uid(&self) -> UserId {
        self.uid
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }
}

fn check_context(ctx: &CancellationToken) -> anyhow::Result<()> {
    if ctx.is_cancelled() {
        return Err(
            anyhow::anyhow!("journal operation canceled").context(ErrorMetadata::canceled())
        );
    }
    Ok(())
}

async fn read_entry<C: Codec>(
    codec: &C,
    log: &dyn LogPersistence,
    index: u64,
) -> anyhow::Result<ImmutableRootMetadata> {
    let data = log.get(index).await?;
    let rmds: RootMetadataSigned = codec.decode(&data)?;
    ImmutableRootMetadata::new(codec, rmds)
}

async fn read_head<C: Codec>(
    codec: &C,
    log: &dyn LogPersistence,
) -> anyhow::Result<Option<ImmutableRootMetadata>> {
    match log.latest_index().await? {
        None => Ok(None),
        Some(latest) => Ok(Some(read_entry(codec, log, latest).await?)),
    }
}
