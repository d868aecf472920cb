//! Session establishment, inventory sync and the worker lifecycle against a
//! coordinator over a real socket.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fixtures::{storage, ConfigBuilder};
use common::{eventually, TestCoordinator, TIMEOUT};
use tempfile::TempDir;
use tierlink_core::{StatusError, Transport};
use tierlink_proto::{Command, CommandType, RegisterWorkerChunk};
use tierlink_worker::{
    worker, BlockMasterClient, BlockMasterSync, CoordinatorSession, LocalBlockStore,
    RemoteBlockMaster, WorkerError,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_session_authenticates_with_plain() {
    let coordinator = TestCoordinator::with_auth().await;
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new(coordinator.transport(), dir.path()).build();

    let session = CoordinatorSession::establish(&config).await.unwrap();
    assert!(session.is_authenticated());

    let auth = coordinator.auth.clone().unwrap();
    eventually("server to record the channel", || auth.channels().len() == 1).await;

    session.close().await;
    eventually("server to release the channel", || auth.channels().is_empty()).await;
}

#[tokio::test]
async fn test_session_rejects_bad_credentials() {
    let coordinator = TestCoordinator::with_auth().await;
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new(coordinator.transport(), dir.path())
        .password("wrong")
        .build();

    let err = CoordinatorSession::establish(&config).await.unwrap_err();
    assert!(
        matches!(err, WorkerError::Rpc(StatusError::Unauthenticated(_))),
        "{err}"
    );
}

#[tokio::test]
async fn test_session_proceeds_when_coordinator_disables_auth() {
    let coordinator = TestCoordinator::without_auth().await;
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new(coordinator.transport(), dir.path()).build();

    let session = CoordinatorSession::establish(&config).await.unwrap();
    assert!(!session.is_authenticated());
    assert!(session.status().is_none());
    session.close().await;
}

#[tokio::test]
async fn test_session_fails_when_auth_disabled_is_not_allowed() {
    let coordinator = TestCoordinator::without_auth().await;
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new(coordinator.transport(), dir.path())
        .allow_disabled(false)
        .build();

    let err = CoordinatorSession::establish(&config).await.unwrap_err();
    assert!(matches!(err, WorkerError::Rpc(StatusError::AuthDisabled)), "{err}");
    assert_eq!(err.to_string(), "Authentication is disabled on target host");
}

#[tokio::test]
async fn test_session_skips_auth_when_disabled_locally() {
    let coordinator = TestCoordinator::with_auth().await;
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new(coordinator.transport(), dir.path())
        .auth_enabled(false)
        .build();

    let session = CoordinatorSession::establish(&config).await.unwrap();
    assert!(!session.is_authenticated());
    assert!(coordinator.auth.as_ref().unwrap().channels().is_empty());
    session.close().await;
}

#[tokio::test]
async fn test_unreachable_coordinator_is_transport_error() {
    let dir = TempDir::new().unwrap();
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let config = ConfigBuilder::new(Transport::tcp(addr), dir.path()).build();
    let err = CoordinatorSession::establish(&config).await.unwrap_err();
    assert!(matches!(err, WorkerError::Transport(_)), "{err}");
}

struct SyncHarness {
    coordinator: TestCoordinator,
    store: Arc<LocalBlockStore>,
    client: Arc<BlockMasterClient>,
    sync: BlockMasterSync,
    _dir: TempDir,
}

async fn sync_harness(seed_blocks: &[(u64, usize)]) -> SyncHarness {
    let coordinator = TestCoordinator::without_auth().await;
    let dir = TempDir::new().unwrap();
    let mem = dir.path().join("mem");
    std::fs::create_dir_all(&mem).unwrap();
    for (block_id, length) in seed_blocks {
        std::fs::write(mem.join(block_id.to_string()), vec![0u8; *length]).unwrap();
    }

    let store = Arc::new(LocalBlockStore::open(&storage(dir.path(), 1024 * 1024)).await.unwrap());
    let channel = coordinator.connect().await;
    let client = Arc::new(BlockMasterClient::new(Arc::new(RemoteBlockMaster::new(channel))));
    let sync = BlockMasterSync::new(Arc::clone(&client), Arc::clone(&store), 42, Duration::from_millis(20));

    SyncHarness {
        coordinator,
        store,
        client,
        sync,
        _dir: dir,
    }
}

fn registered_blocks(chunks: &[RegisterWorkerChunk]) -> Vec<u64> {
    let mut ids: Vec<u64> = chunks
        .iter()
        .filter_map(|chunk| match chunk {
            RegisterWorkerChunk::Blocks { entries, .. } => Some(entries),
            RegisterWorkerChunk::Metadata(_) => None,
        })
        .flatten()
        .flat_map(|entry| entry.block_ids.clone())
        .collect();
    ids.sort_unstable();
    ids
}

#[tokio::test]
async fn test_register_reports_existing_blocks() {
    let h = sync_harness(&[(7, 32), (9, 64)]).await;

    h.sync.register().await.unwrap();
    assert!(h.sync.is_registered());

    let registrations = h.coordinator.master.registrations();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registered_blocks(&registrations[0]), vec![7, 9]);
    match &registrations[0][0] {
        RegisterWorkerChunk::Metadata(metadata) => {
            assert_eq!(metadata.worker_id, 42);
            assert_eq!(metadata.used_bytes_on_tiers, vec![("MEM".to_owned(), 96)]);
        }
        other => panic!("expected metadata, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_reports_delta_once() {
    let h = sync_harness(&[]).await;
    h.sync.register().await.unwrap();

    let placement = h.store.write_block(100, &[1u8; 48]).await.unwrap();
    h.sync.commit(&placement).await.unwrap();

    h.sync.heartbeat().await.unwrap();
    h.sync.heartbeat().await.unwrap();

    let heartbeats = h.coordinator.master.heartbeats();
    assert_eq!(heartbeats.len(), 2);
    let added: Vec<u64> = heartbeats[0]
        .added_blocks
        .iter()
        .flat_map(|e| e.block_ids.clone())
        .collect();
    assert_eq!(added, vec![100]);
    assert!(heartbeats[1].added_blocks.is_empty());
    assert_eq!(heartbeats[1].used_bytes_on_tiers, vec![("MEM".to_owned(), 48)]);

    let commits = h.coordinator.master.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].block_id, 100);
    assert_eq!(commits[0].used_bytes_on_tier, 48);
}

#[tokio::test]
async fn test_failed_heartbeat_keeps_delta_pending() {
    let h = sync_harness(&[]).await;
    h.store.write_block(5, &[0u8; 8]).await.unwrap();
    h.coordinator.master.fail_heartbeats(100);

    let err = h.sync.heartbeat().await.unwrap_err();
    assert!(matches!(err, StatusError::Unavailable(_)), "{err}");
    assert!(!h.store.pending_changes().is_empty());

    h.coordinator.master.fail_heartbeats(0);
    h.sync.heartbeat().await.unwrap();
    assert!(h.store.pending_changes().is_empty());
}

#[tokio::test]
async fn test_large_delta_is_spread_over_heartbeats() {
    let h = sync_harness(&[]).await;
    let sync = BlockMasterSync::new(Arc::clone(&h.client), Arc::clone(&h.store), 42, Duration::from_millis(20))
        .with_max_report_blocks(2);
    for block_id in 1..=5 {
        h.store.write_block(block_id, &[0u8; 4]).await.unwrap();
    }

    for _ in 0..3 {
        sync.heartbeat().await.unwrap();
    }

    let sent: Vec<Vec<u64>> = h
        .coordinator
        .master
        .heartbeats()
        .iter()
        .map(|hb| hb.added_blocks.iter().flat_map(|e| e.block_ids.clone()).collect())
        .collect();
    assert_eq!(sent, vec![vec![1, 2], vec![3, 4], vec![5]]);
    assert!(h.store.pending_changes().is_empty());
}

#[tokio::test]
async fn test_block_freed_while_its_heartbeat_is_in_flight_is_reported_removed() {
    let h = sync_harness(&[]).await;
    h.store.write_block(11, &[0u8; 4]).await.unwrap();
    h.coordinator.master.delay_heartbeats(Duration::from_millis(100));

    let heartbeat = h.sync.heartbeat();
    let remove = async {
        eventually("heartbeat to be sent", || h.coordinator.master.heartbeat_attempts() == 1).await;
        h.store.remove_block(11).await.unwrap();
    };
    let (result, ()) = tokio::join!(heartbeat, remove);
    result.unwrap();

    h.coordinator.master.delay_heartbeats(Duration::ZERO);
    h.sync.heartbeat().await.unwrap();
    let heartbeats = h.coordinator.master.heartbeats();
    assert_eq!(heartbeats.len(), 2);
    assert_eq!(heartbeats[0].added_blocks[0].block_ids, vec![11]);
    assert_eq!(heartbeats[1].removed_block_ids, vec![11]);
}

#[tokio::test]
async fn test_free_command_removes_blocks_and_reports_them() {
    let h = sync_harness(&[(7, 32), (8, 32)]).await;
    h.sync.register().await.unwrap();
    h.coordinator
        .master
        .push_command(Command::new(CommandType::Free, vec![7, 1234]));

    let command = h.sync.heartbeat().await.unwrap();
    h.sync.execute(command).await.unwrap();

    assert!(!h.store.contains(7));
    assert!(h.store.contains(8));

    h.sync.heartbeat().await.unwrap();
    let heartbeats = h.coordinator.master.heartbeats();
    assert_eq!(heartbeats[1].removed_block_ids, vec![7]);
}

#[tokio::test]
async fn test_register_command_triggers_reregistration() {
    let h = sync_harness(&[(3, 16)]).await;
    h.sync.register().await.unwrap();
    h.coordinator
        .master
        .push_command(Command::new(CommandType::Register, Vec::new()));

    let command = h.sync.heartbeat().await.unwrap();
    h.sync.execute(command).await.unwrap();

    let registrations = h.coordinator.master.registrations();
    assert_eq!(registrations.len(), 2);
    assert_eq!(registered_blocks(&registrations[1]), vec![3]);
}

#[tokio::test]
async fn test_worker_runs_until_cancelled() {
    let coordinator = TestCoordinator::with_auth().await;
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new(coordinator.transport(), dir.path()).build();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker::run(config, shutdown.clone()));

    let master = Arc::clone(&coordinator.master);
    eventually("registration", || master.registrations().len() == 1).await;
    eventually("a few heartbeats", || master.heartbeats().len() >= 3).await;
    assert!(master.heartbeats().iter().all(|h| h.worker_id == 42));

    shutdown.cancel();
    tokio::time::timeout(TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let auth = coordinator.auth.clone().unwrap();
    eventually("server to release the channel", || auth.channels().is_empty()).await;
}

#[tokio::test]
async fn test_worker_stops_when_session_is_revoked() {
    let coordinator = TestCoordinator::with_auth().await;
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new(coordinator.transport(), dir.path()).build();

    let handle = tokio::spawn(worker::run(config, CancellationToken::new()));

    let master = Arc::clone(&coordinator.master);
    eventually("registration", || master.registrations().len() == 1).await;
    let auth = coordinator.auth.clone().unwrap();
    eventually("server to record the channel", || auth.channels().len() == 1).await;
    assert_eq!(coordinator.revoke_all(), 1);

    let err = tokio::time::timeout(TIMEOUT, handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, WorkerError::SessionLost), "{err}");
}

#[tokio::test]
async fn test_worker_fails_on_rejected_credentials() {
    let coordinator = TestCoordinator::with_auth().await;
    let dir = TempDir::new().unwrap();
    let config = ConfigBuilder::new(coordinator.transport(), dir.path())
        .password("nope")
        .build();

    let err = worker::run(config, CancellationToken::new()).await.unwrap_err();
    assert!(
        matches!(err, WorkerError::Rpc(StatusError::Unauthenticated(_))),
        "{err}"
    );
    assert!(coordinator.master.registrations().is_empty());
}
