use std::sync::Arc;

use errors::ErrorMetadataAnyhowExt;
use futures::StreamExt;
use journal::{
    flush_all,
    JournalConflictError,
    MetadataJournal,
    TestLogPersistence,
};
use metadata::{
    testing::{
        test_root_metadata_for,
        test_tlf_id,
        StaticKeyDirectory,
        TestDevice,
    },
    BincodeCodec,
    BranchId,
    Codec,
    MdId,
    MergeStatus,
    MetadataRevision,
    MetadataServerError,
    TlfHandle,
    TlfId,
};
use runtime::TestRuntime;
use tokio_util::sync::CancellationToken;

use crate::{
    memory_store::MemoryServerStore,
    server::{
        MetadataServer,
        ServerConnection,
    },
    sqlite_store::SqliteServerStore,
    store::ServerStore,
    testing::server_from_env,
};

type TestServer = MetadataServer<TestRuntime, BincodeCodec>;

fn test_server() -> Arc<TestServer> {
    Arc::new(MetadataServer::new(
        TestRuntime::new(),
        BincodeCodec::new(),
        Arc::new(StaticKeyDirectory::allow_all()),
        Box::new(MemoryServerStore::new()),
    ))
}

fn test_server_with_store(store: MemoryServerStore) -> Arc<TestServer> {
    Arc::new(MetadataServer::new(
        TestRuntime::new(),
        BincodeCodec::new(),
        Arc::new(StaticKeyDirectory::allow_all()),
        Box::new(store),
    ))
}

/// Sign and put a merged chain of `count` revisions starting at `start`,
/// returning the md id of the last one.
async fn seed_merged_chain(
    server: &TestServer,
    tlf_id: TlfId,
    handle: &TlfHandle,
    device: &TestDevice,
    start: u64,
    count: u64,
    mut prev: Option<MdId>,
) -> anyhow::Result<MdId> {
    let ctx = CancellationToken::new();
    let codec = BincodeCodec::new();
    for rev in start..start + count {
        let rmd = test_root_metadata_for(tlf_id, handle, device, MetadataRevision::new(rev), prev);
        let rmds = rmd.sign(&ctx, &codec, &device.signer).await?;
        prev = Some(rmds.md_id(&codec)?);
        server.put(&ctx, rmds).await?;
    }
    Ok(prev.expect("count is positive"))
}

async fn journal_for(
    device: &TestDevice,
    tlf_id: TlfId,
) -> anyhow::Result<MetadataJournal<TestRuntime, BincodeCodec>> {
    MetadataJournal::new(
        TestRuntime::new(),
        BincodeCodec::new(),
        tlf_id,
        device.uid,
        device.verifying_key(),
        Box::new(TestLogPersistence::new()),
    )
    .await
}

/// Journal `count` revisions for a shared folder, chaining md ids.
async fn journal_revisions(
    journal: &MetadataJournal<TestRuntime, BincodeCodec>,
    tlf_id: TlfId,
    handle: &TlfHandle,
    device: &TestDevice,
    start: u64,
    count: u64,
    mut prev: Option<MdId>,
) -> anyhow::Result<MdId> {
    let ctx = CancellationToken::new();
    for rev in start..start + count {
        let rmd = test_root_metadata_for(tlf_id, handle, device, MetadataRevision::new(rev), prev);
        prev = Some(journal.put(&ctx, &device.signer, rmd).await?);
    }
    Ok(prev.expect("count is positive"))
}

#[tokio::test]
async fn test_get_for_handle_mints_once() -> anyhow::Result<()> {
    let server = test_server();
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let handle = TlfHandle::new_private([device.uid], []);

    let (id, head) = server
        .get_for_handle(&ctx, device.uid, &handle, MergeStatus::Merged)
        .await?;
    assert!(!id.is_public());
    assert!(head.is_none());

    let (again, _) = server
        .get_for_handle(&ctx, device.uid, &handle, MergeStatus::Merged)
        .await?;
    assert_eq!(id, again);

    let public = TlfHandle::new_public([device.uid]);
    let (public_id, _) = server
        .get_for_handle(&ctx, device.uid, &public, MergeStatus::Merged)
        .await?;
    assert!(public_id.is_public());
    assert_ne!(id, public_id);
    Ok(())
}

#[tokio::test]
async fn test_get_for_handle_rejects_strangers_and_junk() -> anyhow::Result<()> {
    let server = test_server();
    let device = TestDevice::new(1);
    let stranger = TestDevice::new(2);
    let ctx = CancellationToken::new();
    let handle = TlfHandle::new_private([device.uid], []);

    let err = server
        .get_for_handle(&ctx, stranger.uid, &handle, MergeStatus::Merged)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MetadataServerError>(),
        Some(MetadataServerError::Unauthorized { .. })
    ));

    let empty = TlfHandle::new_private([], []);
    let err = server
        .get_for_handle(&ctx, device.uid, &empty, MergeStatus::Merged)
        .await
        .unwrap_err();
    assert!(err.is_bad_request());
    Ok(())
}

#[tokio::test]
async fn test_get_for_handle_conflicting_mapping() -> anyhow::Result<()> {
    let store = MemoryServerStore::new();
    let device = TestDevice::new(1);
    let handle = TlfHandle::new_public([device.uid]);

    // A mapping recorded for this handle that disagrees with its visibility.
    let codec = BincodeCodec::new();
    store
        .record_handle(codec.encode(&handle)?, test_tlf_id(3))
        .await?;

    let server = test_server_with_store(store);
    let ctx = CancellationToken::new();
    let err = server
        .get_for_handle(&ctx, device.uid, &handle, MergeStatus::Merged)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MetadataServerError>(),
        Some(MetadataServerError::ConflictFolderMapping)
    ));
    Ok(())
}

#[tokio::test]
async fn test_put_builds_serial_history() -> anyhow::Result<()> {
    let server = test_server();
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([device.uid], []);

    seed_merged_chain(&server, tlf_id, &handle, &device, 1, 4, None).await?;

    let head = server
        .get_for_tlf(&ctx, device.uid, tlf_id, BranchId::NULL, MergeStatus::Merged)
        .await?
        .expect("history is non-empty");
    assert_eq!(head.revision(), MetadataRevision::new(4));

    let entries = server
        .get_range(
            &ctx,
            device.uid,
            tlf_id,
            BranchId::NULL,
            MergeStatus::Merged,
            MetadataRevision::new(2),
            MetadataRevision::new(3),
        )
        .await?;
    let revisions: Vec<u64> = entries.iter().map(|e| e.revision().into()).collect();
    assert_eq!(revisions, vec![2, 3]);
    Ok(())
}

#[tokio::test]
async fn test_put_conflict_ladder() -> anyhow::Result<()> {
    let server = test_server();
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let codec = BincodeCodec::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([device.uid], []);

    let tail_id = seed_merged_chain(&server, tlf_id, &handle, &device, 1, 3, None).await?;

    // A stale revision number wins the ladder regardless of its chain
    // pointer.
    let stale =
        test_root_metadata_for(tlf_id, &handle, &device, MetadataRevision::new(2), Some(tail_id));
    let stale = stale.sign(&ctx, &codec, &device.signer).await?;
    let err = server.put(&ctx, stale).await.unwrap_err();
    match err.downcast_ref::<MetadataServerError>() {
        Some(MetadataServerError::ConflictRevision { expected, actual }) => {
            assert_eq!(*expected, MetadataRevision::new(4));
            assert_eq!(*actual, MetadataRevision::new(2));
        },
        other => panic!("expected ConflictRevision, got {other:?}"),
    }

    // The right revision number with the wrong chain pointer.
    let detached = test_root_metadata_for(
        tlf_id,
        &handle,
        &device,
        MetadataRevision::new(4),
        Some(MdId::from([9; 32])),
    );
    let detached = detached.sign(&ctx, &codec, &device.signer).await?;
    let err = server.put(&ctx, detached).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MetadataServerError>(),
        Some(MetadataServerError::ConflictPrevRoot { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_put_requires_initial_revision_on_fresh_merged_history() -> anyhow::Result<()> {
    let server = test_server();
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let codec = BincodeCodec::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([device.uid], []);

    let late = test_root_metadata_for(
        tlf_id,
        &handle,
        &device,
        MetadataRevision::new(10),
        Some(MdId::from([1; 32])),
    );
    let late = late.sign(&ctx, &codec, &device.signer).await?;
    let err = server.put(&ctx, late).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MetadataServerError>(),
        Some(MetadataServerError::BadRequest { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_fresh_unmerged_branch_accepts_any_start() -> anyhow::Result<()> {
    let server = test_server();
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let codec = BincodeCodec::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([device.uid], []);
    let branch_id = BranchId::from_bytes([4; 16]);

    // A fork that continues from some merged ancestor this server has never
    // seen. The ancestor is deliberately not resolved.
    let mut rmd = test_root_metadata_for(
        tlf_id,
        &handle,
        &device,
        MetadataRevision::new(7),
        Some(MdId::from([1; 32])),
    );
    rmd.stamp_branch(branch_id);
    let rmds = rmd.sign(&ctx, &codec, &device.signer).await?;
    server.put(&ctx, rmds).await?;

    let head = server
        .get_for_tlf(&ctx, device.uid, tlf_id, branch_id, MergeStatus::Unmerged)
        .await?
        .expect("branch has one entry");
    assert_eq!(head.revision(), MetadataRevision::new(7));
    Ok(())
}

#[tokio::test]
async fn test_put_write_access() -> anyhow::Result<()> {
    let server = test_server();
    let owner = TestDevice::new(1);
    let reader = TestDevice::new(2);
    let ctx = CancellationToken::new();
    let codec = BincodeCodec::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([owner.uid], [reader.uid]);

    // The reader signs a structurally valid revision naming itself as the
    // writer. The handle says otherwise.
    let rmd = test_root_metadata_for(tlf_id, &handle, &reader, MetadataRevision::INITIAL, None);
    let rmds = rmd.sign(&ctx, &codec, &reader.signer).await?;
    let err = server.put(&ctx, rmds).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MetadataServerError>(),
        Some(MetadataServerError::WriteAccess)
    ));
    Ok(())
}

#[tokio::test]
async fn test_put_ignores_self_authored_handle_on_existing_folder() -> anyhow::Result<()> {
    let server = test_server();
    let owner = TestDevice::new(1);
    let stranger = TestDevice::new(2);
    let ctx = CancellationToken::new();
    let codec = BincodeCodec::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([owner.uid], [stranger.uid]);

    let tail_id = seed_merged_chain(&server, tlf_id, &handle, &owner, 1, 3, None).await?;

    // The stranger forges a handle naming itself as writer, signs with its
    // own real device key, and chains correctly onto the tail it could read.
    // The stored handle, not the forged one, decides write access.
    let forged_handle = TlfHandle::new_private([stranger.uid], []);
    let forged = test_root_metadata_for(
        tlf_id,
        &forged_handle,
        &stranger,
        MetadataRevision::new(4),
        Some(tail_id),
    );
    let forged = forged.sign(&ctx, &codec, &stranger.signer).await?;
    forged.is_valid_and_signed(&codec)?;
    let err = server.put(&ctx, forged).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MetadataServerError>(),
        Some(MetadataServerError::WriteAccess)
    ));

    // The folder's history is untouched.
    let head = server
        .get_for_tlf(&ctx, owner.uid, tlf_id, BranchId::NULL, MergeStatus::Merged)
        .await?
        .expect("history is non-empty");
    assert_eq!(head.revision(), MetadataRevision::new(3));
    Ok(())
}

#[tokio::test]
async fn test_put_rejects_unknown_device_key() -> anyhow::Result<()> {
    let owner = TestDevice::new(1);
    let imposter = TestDevice::new(3);
    // Only the owner's real device key is registered.
    let key_directory = Arc::new(StaticKeyDirectory::with_devices([(
        owner.uid,
        owner.verifying_key(),
    )]));
    let server: Arc<TestServer> = Arc::new(MetadataServer::new(
        TestRuntime::new(),
        BincodeCodec::new(),
        key_directory,
        Box::new(MemoryServerStore::new()),
    ));
    let ctx = CancellationToken::new();
    let codec = BincodeCodec::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([owner.uid], []);

    // Signed with a key the directory does not know for this user.
    let mut rmd = test_root_metadata_for(tlf_id, &handle, &owner, MetadataRevision::INITIAL, None);
    rmd.set_last_modified_by(owner.uid);
    let rmds = rmd.sign(&ctx, &codec, &imposter.signer).await?;
    let err = server.put(&ctx, rmds).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MetadataServerError>(),
        Some(MetadataServerError::WriteAccess)
    ));
    Ok(())
}

#[tokio::test]
async fn test_read_authorization() -> anyhow::Result<()> {
    let server = test_server();
    let owner = TestDevice::new(1);
    let stranger = TestDevice::new(2);
    let ctx = CancellationToken::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([owner.uid], []);

    seed_merged_chain(&server, tlf_id, &handle, &owner, 1, 1, None).await?;

    let err = server
        .get_for_tlf(&ctx, stranger.uid, tlf_id, BranchId::NULL, MergeStatus::Merged)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MetadataServerError>(),
        Some(MetadataServerError::Unauthorized { .. })
    ));

    // Branch id and merge status must agree.
    let err = server
        .get_for_tlf(&ctx, owner.uid, tlf_id, BranchId::NULL, MergeStatus::Unmerged)
        .await
        .unwrap_err();
    assert!(err.is_bad_request());
    Ok(())
}

#[tokio::test]
async fn test_prune_branch() -> anyhow::Result<()> {
    let server = test_server();
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let codec = BincodeCodec::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([device.uid], []);
    let branch_id = BranchId::from_bytes([4; 16]);

    let mut rmd =
        test_root_metadata_for(tlf_id, &handle, &device, MetadataRevision::INITIAL, None);
    rmd.stamp_branch(branch_id);
    let rmds = rmd.sign(&ctx, &codec, &device.signer).await?;
    server.put(&ctx, rmds).await?;

    let err = server
        .prune_branch(&ctx, device.uid, tlf_id, BranchId::NULL)
        .await
        .unwrap_err();
    assert!(err.is_bad_request());

    server.prune_branch(&ctx, device.uid, tlf_id, branch_id).await?;
    assert!(server
        .get_for_tlf(&ctx, device.uid, tlf_id, branch_id, MergeStatus::Unmerged)
        .await?
        .is_none());
    // Pruning an absent branch stays fine.
    server.prune_branch(&ctx, device.uid, tlf_id, branch_id).await?;
    Ok(())
}

#[tokio::test]
async fn test_register_for_update() -> anyhow::Result<()> {
    let server = test_server();
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([device.uid], []);

    seed_merged_chain(&server, tlf_id, &handle, &device, 1, 2, None).await?;

    // The head is already past last_seen, so the stream fires immediately.
    let mut stream = server
        .register_for_update(&ctx, device.uid, tlf_id, MetadataRevision::new(1))
        .await?;
    assert_eq!(stream.next().await, Some(MetadataRevision::new(2)));

    // A registration at the head waits for the next merged commit.
    let mut waiting = server
        .register_for_update(&ctx, device.uid, tlf_id, MetadataRevision::new(2))
        .await?;
    let tail = server
        .get_for_tlf(&ctx, device.uid, tlf_id, BranchId::NULL, MergeStatus::Merged)
        .await?
        .unwrap();
    let tail_id = tail.md_id(&BincodeCodec::new())?;
    seed_merged_chain(&server, tlf_id, &handle, &device, 3, 1, Some(tail_id)).await?;
    assert_eq!(waiting.next().await, Some(MetadataRevision::new(3)));
    Ok(())
}

#[tokio::test]
async fn test_planted_failures_surface() -> anyhow::Result<()> {
    let server = test_server();
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let handle = TlfHandle::new_private([device.uid], []);

    server.plant_failure(MetadataServerError::Throttle {
        suggested_retry: std::time::Duration::from_millis(10),
    });
    let err = server
        .get_for_handle(&ctx, device.uid, &handle, MergeStatus::Merged)
        .await
        .unwrap_err();
    assert!(err.is_retriable());

    server.plant_failure(MetadataServerError::Locked);
    let err = server
        .get_for_handle(&ctx, device.uid, &handle, MergeStatus::Merged)
        .await
        .unwrap_err();
    assert!(err.is_retriable());

    // The failure is one-shot.
    server
        .get_for_handle(&ctx, device.uid, &handle, MergeStatus::Merged)
        .await?;
    Ok(())
}

#[tokio::test]
async fn test_sqlite_server_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([device.uid], []);

    let server: TestServer = MetadataServer::new(
        TestRuntime::new(),
        BincodeCodec::new(),
        Arc::new(StaticKeyDirectory::allow_all()),
        Box::new(SqliteServerStore::new(dir.path())?),
    );
    seed_merged_chain(&server, tlf_id, &handle, &device, 1, 3, None).await?;

    // The history survives a server restart over the same directory.
    let reopened: TestServer = MetadataServer::new(
        TestRuntime::new(),
        BincodeCodec::new(),
        Arc::new(StaticKeyDirectory::allow_all()),
        Box::new(SqliteServerStore::new(dir.path())?),
    );
    let head = reopened
        .get_for_tlf(&ctx, device.uid, tlf_id, BranchId::NULL, MergeStatus::Merged)
        .await?
        .expect("history persisted");
    assert_eq!(head.revision(), MetadataRevision::new(3));
    Ok(())
}

#[tokio::test]
async fn test_server_from_env_defaults_to_memory() -> anyhow::Result<()> {
    let server = server_from_env(TestRuntime::new())?;
    let device = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let handle = TlfHandle::new_private([device.uid], []);
    let (id, head) = server
        .get_for_handle(&ctx, device.uid, &handle, MergeStatus::Merged)
        .await?;
    assert!(!id.is_public());
    assert!(head.is_none());
    Ok(())
}

// End-to-end scenarios across the journal and the server.

#[tokio::test]
async fn test_flush_conflict_forks_and_drains() -> anyhow::Result<()> {
    let server = test_server();
    let writer = TestDevice::new(1);
    let other = TestDevice::new(2);
    let ctx = CancellationToken::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([writer.uid, other.uid], []);

    // The other device landed three merged revisions first.
    seed_merged_chain(&server, tlf_id, &handle, &other, 1, 3, None).await?;

    let journal = journal_for(&writer, tlf_id).await?;
    let _ = journal_revisions(&journal, tlf_id, &handle, &writer, 1, 5, None).await?;

    let connection = ServerConnection::new(server.clone(), writer.uid);
    let rt = TestRuntime::new();
    // Five entries plus the fork step triggered by the first conflict.
    let steps = flush_all(&ctx, &rt, &journal, &writer.signer, &connection).await?;
    assert_eq!(steps, 6);
    let branch_id = journal.branch_id().await;
    assert!(!branch_id.is_null());
    assert_eq!(journal.len().await?, 0);

    // Five more revisions continue the branch and drain too.
    let head = server
        .get_for_tlf(&ctx, writer.uid, tlf_id, branch_id, MergeStatus::Unmerged)
        .await?
        .expect("branch was flushed");
    assert_eq!(head.revision(), MetadataRevision::new(5));
    let mut prev = head.md_id(&BincodeCodec::new())?;
    for rev in 6..=10u64 {
        let mut rmd = test_root_metadata_for(
            tlf_id,
            &handle,
            &writer,
            MetadataRevision::new(rev),
            Some(prev),
        );
        rmd.stamp_branch(branch_id);
        prev = journal.put(&ctx, &writer.signer, rmd).await?;
    }
    let flushed = flush_all(&ctx, &rt, &journal, &writer.signer, &connection).await?;
    assert_eq!(flushed, 5);

    let entries = server
        .get_range(
            &ctx,
            writer.uid,
            tlf_id,
            branch_id,
            MergeStatus::Unmerged,
            MetadataRevision::new(1),
            MetadataRevision::new(100),
        )
        .await?;
    assert_eq!(entries.len(), 10);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.revision(), MetadataRevision::new(1 + i as u64));
        assert_eq!(entry.branch_id(), branch_id);
        assert_eq!(entry.merge_status(), MergeStatus::Unmerged);
    }
    Ok(())
}

#[tokio::test]
async fn test_double_flush_after_cancellation() -> anyhow::Result<()> {
    let server = test_server();
    let writer = TestDevice::new(1);
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([writer.uid], []);

    let journal = journal_for(&writer, tlf_id).await?;
    let _ = journal_revisions(&journal, tlf_id, &handle, &writer, 1, 1, None).await?;

    let connection = ServerConnection::new(server.clone(), writer.uid);

    // The canceled flush commits server-side but reports cancellation.
    let canceled = CancellationToken::new();
    canceled.cancel();
    let err = journal
        .flush_one(&canceled, &writer.signer, &connection)
        .await
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(journal.len().await?, 1);
    let ctx = CancellationToken::new();
    let committed = server
        .get_for_tlf(&ctx, writer.uid, tlf_id, BranchId::NULL, MergeStatus::Merged)
        .await?;
    assert!(committed.is_some());

    // The retry sees a conflict, recognizes its own revision on the server,
    // and treats the flush as done instead of forking.
    assert!(journal.flush_one(&ctx, &writer.signer, &connection).await?);
    assert_eq!(journal.len().await?, 0);
    assert!(journal.branch_id().await.is_null());
    Ok(())
}

#[tokio::test]
async fn test_branch_survives_journal_drain() -> anyhow::Result<()> {
    let server = test_server();
    let writer = TestDevice::new(1);
    let other = TestDevice::new(2);
    let ctx = CancellationToken::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([writer.uid, other.uid], []);

    // Enough merged history from the other device to conflict with ours.
    seed_merged_chain(&server, tlf_id, &handle, &other, 1, 2, None).await?;

    let journal = journal_for(&writer, tlf_id).await?;
    let _ = journal_revisions(&journal, tlf_id, &handle, &writer, 1, 9, None).await?;

    let connection = ServerConnection::new(server.clone(), writer.uid);
    let rt = TestRuntime::new();
    // Nine entries plus the fork step.
    let steps = flush_all(&ctx, &rt, &journal, &writer.signer, &connection).await?;
    assert_eq!(steps, 10);
    let branch_id = journal.branch_id().await;
    assert!(!branch_id.is_null());
    assert_eq!(journal.len().await?, 0);

    // A merged put still conflicts even though nothing is pending.
    let tenth = test_root_metadata_for(
        tlf_id,
        &handle,
        &writer,
        MetadataRevision::new(10),
        Some(MdId::from([1; 32])),
    );
    let err = journal
        .put(&ctx, &writer.signer, tenth.clone())
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<JournalConflictError>().is_some());

    // Retried on the journal's branch, chained onto the server's branch tail.
    let branch_head = server
        .get_for_tlf(&ctx, writer.uid, tlf_id, branch_id, MergeStatus::Unmerged)
        .await?
        .expect("branch was flushed");
    let mut retry = tenth;
    retry.stamp_branch(branch_id);
    retry.set_prev_root(branch_head.md_id(&BincodeCodec::new())?);
    journal.put(&ctx, &writer.signer, retry).await?;
    assert!(journal.flush_one(&ctx, &writer.signer, &connection).await?);

    let entries = server
        .get_range(
            &ctx,
            writer.uid,
            tlf_id,
            branch_id,
            MergeStatus::Unmerged,
            MetadataRevision::new(1),
            MetadataRevision::new(100),
        )
        .await?;
    assert_eq!(entries.len(), 10);
    assert!(entries.iter().all(|e| e.branch_id() == branch_id));
    assert_eq!(
        entries.last().unwrap().revision(),
        MetadataRevision::new(10)
    );
    Ok(())
}

#[tokio::test]
async fn test_flush_all_rides_out_throttling() -> anyhow::Result<()> {
    let server = test_server();
    let writer = TestDevice::new(1);
    let ctx = CancellationToken::new();
    let tlf_id = test_tlf_id(1);
    let handle = TlfHandle::new_private([writer.uid], []);

    let journal = journal_for(&writer, tlf_id).await?;
    let _ = journal_revisions(&journal, tlf_id, &handle, &writer, 1, 3, None).await?;

    server.plant_failure(MetadataServerError::Throttle {
        suggested_retry: std::time::Duration::from_millis(25),
    });

    let connection = ServerConnection::new(server.clone(), writer.uid);
    let rt = TestRuntime::new();
    let flushed = flush_all(&ctx, &rt, &journal, &writer.signer, &connection).await?;
    assert_eq!(flushed, 3);
    assert_eq!(journal.len().await?, 0);
    Ok(())
}
