//! Block master client against a coordinator over a real socket.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::fixtures::payload;
use common::{TestCoordinator, TIMEOUT};
use rstest::rstest;
use tierlink_core::StatusError;
use tierlink_proto::{Command, CommandType, RegisterWorkerChunk, WorkerNetAddress};
use tierlink_worker::{BlockMasterClient, RemoteBlockMaster, RetryPolicy, WorkerInventoryReport};

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
    }
}

async fn client(coordinator: &TestCoordinator) -> BlockMasterClient {
    let channel = coordinator.connect().await;
    BlockMasterClient::new(Arc::new(RemoteBlockMaster::new(channel).with_rpc_timeout(TIMEOUT)))
        .with_retry_policy(fast_retry(5))
        .with_heartbeat_timeout(TIMEOUT)
}

fn report(worker_id: u64, removed: Vec<u64>) -> WorkerInventoryReport {
    WorkerInventoryReport {
        worker_id,
        capacity_bytes_on_tiers: BTreeMap::from([("MEM".to_owned(), 1024)]),
        used_bytes_on_tiers: BTreeMap::from([("MEM".to_owned(), 0)]),
        removed_block_ids: removed,
        added_blocks: Vec::new(),
        lost_storage: BTreeMap::new(),
        metrics: Vec::new(),
    }
}

#[tokio::test]
async fn test_get_worker_id_and_commit() {
    let coordinator = TestCoordinator::without_auth().await;
    let client = client(&coordinator).await;

    let address = WorkerNetAddress {
        host: "worker-a".into(),
        rpc_port: 29998,
        data_port: 29999,
        web_port: 30000,
    };
    let worker_id = client.get_worker_id(&address).await.unwrap();
    assert_eq!(worker_id, 42);

    client
        .commit_block(worker_id, 4096, "SSD", "SSD", 77, 1024)
        .await
        .unwrap();
    client.commit_block_in_ufs(78, 2048).await.unwrap();

    let commits = coordinator.master.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].worker_id, 42);
    assert_eq!(commits[0].used_bytes_on_tier, 4096);
    assert_eq!(commits[0].tier_alias, "SSD");
    assert_eq!(commits[0].block_id, 77);
    assert_eq!(commits[0].length, 1024);

    let ufs = coordinator.master.ufs_commits();
    assert_eq!(ufs.len(), 1);
    assert_eq!((ufs[0].block_id, ufs[0].length), (78, 2048));
}

#[tokio::test]
async fn test_heartbeat_returns_queued_command() {
    let coordinator = TestCoordinator::without_auth().await;
    let client = client(&coordinator).await;
    coordinator
        .master
        .push_command(Command::new(CommandType::Free, vec![5, 6]));

    let command = client.heartbeat(report(42, Vec::new())).await.unwrap();
    assert_eq!(command.command_type, CommandType::Free);
    assert_eq!(command.data, vec![5, 6]);

    let command = client.heartbeat(report(42, Vec::new())).await.unwrap();
    assert_eq!(command.command_type, CommandType::Nothing);
}

#[tokio::test]
async fn test_heartbeat_retries_unavailable() {
    let coordinator = TestCoordinator::without_auth().await;
    let client = client(&coordinator).await;
    coordinator.master.fail_heartbeats(2);

    client.heartbeat(report(42, vec![9])).await.unwrap();

    assert_eq!(coordinator.master.heartbeat_attempts(), 3);
    let heartbeats = coordinator.master.heartbeats();
    assert_eq!(heartbeats.len(), 1);
    assert_eq!(heartbeats[0].removed_block_ids, vec![9]);
}

#[rstest]
#[case::single_attempt(1)]
#[case::three_attempts(3)]
#[tokio::test]
async fn test_heartbeat_gives_up_after_max_attempts(#[case] attempts: u32) {
    let coordinator = TestCoordinator::without_auth().await;
    let client = client(&coordinator).await.with_retry_policy(fast_retry(attempts));
    coordinator.master.fail_heartbeats(100);

    let err = client.heartbeat(report(42, Vec::new())).await.unwrap_err();

    assert!(matches!(err, StatusError::Unavailable(_)), "{err}");
    assert!(err.to_string().contains(&format!("after {attempts} attempts")), "{err}");
    assert_eq!(coordinator.master.heartbeat_attempts(), attempts);
    assert!(coordinator.master.heartbeats().is_empty());
}

#[tokio::test]
async fn test_concurrent_heartbeats_are_serialised_in_order() {
    let coordinator = TestCoordinator::without_auth().await;
    let client = Arc::new(client(&coordinator).await);
    coordinator.master.delay_heartbeats(Duration::from_millis(30));

    let mut handles = Vec::new();
    for i in 0..5u64 {
        let client = Arc::clone(&client);
        handles.push(tokio::spawn(async move {
            client.heartbeat(report(42, vec![i])).await
        }));
        // Let each submission reach the queue before the next one.
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(coordinator.master.max_in_flight(), 1);
    let order: Vec<u64> = coordinator
        .master
        .heartbeats()
        .iter()
        .flat_map(|h| h.removed_block_ids.clone())
        .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_register_streams_bounded_chunks() {
    let coordinator = TestCoordinator::without_auth().await;
    let client = client(&coordinator).await.with_chunk_size(1000);

    let response = client.register(&payload(42, 2500)).await.unwrap();
    assert_eq!(response.received_blocks, 2500);

    let registrations = coordinator.master.registrations();
    assert_eq!(registrations.len(), 1);
    let chunks = &registrations[0];
    assert_eq!(chunks.len(), 4);
    match &chunks[0] {
        RegisterWorkerChunk::Metadata(metadata) => {
            assert_eq!(metadata.worker_id, 42);
            assert_eq!(metadata.storage_tiers, vec!["MEM".to_owned()]);
        }
        other => panic!("first chunk must be metadata, got {other:?}"),
    }
    let sizes: Vec<usize> = chunks[1..].iter().map(RegisterWorkerChunk::block_count).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);
}

#[tokio::test]
async fn test_register_without_blocks_sends_metadata_only() {
    let coordinator = TestCoordinator::without_auth().await;
    let client = client(&coordinator).await;

    let response = client.register(&payload(42, 0)).await.unwrap();
    assert_eq!(response.received_blocks, 0);
    assert_eq!(coordinator.master.registrations()[0].len(), 1);
}

#[tokio::test]
async fn test_register_timeout_is_invalid_state() {
    let coordinator = TestCoordinator::without_auth().await;
    let client = client(&coordinator)
        .await
        .with_register_timeout(Duration::from_millis(100));
    coordinator.master.stall_registration();

    let err = client.register(&payload(42, 10)).await.unwrap_err();

    assert!(matches!(err, StatusError::InvalidState(_)), "{err}");
    // Not retryable: sent exactly once.
    assert_eq!(coordinator.master.registrations().len(), 1);
}

#[tokio::test]
async fn test_calls_fail_unavailable_once_coordinator_is_gone() {
    let coordinator = TestCoordinator::without_auth().await;
    let channel = coordinator.connect().await;
    let client = BlockMasterClient::new(Arc::new(RemoteBlockMaster::new(channel.clone())))
        .with_retry_policy(fast_retry(2));

    channel.close();
    tokio::time::timeout(TIMEOUT, channel.closed()).await.unwrap();

    let err = client.commit_block_in_ufs(1, 1).await.unwrap_err();
    assert!(matches!(err, StatusError::Unavailable(_)), "{err}");
}
