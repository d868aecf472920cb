use std::sync::Arc;
use std::time::Duration;

use tierlink_core::StatusError;
use tierlink_proto::{
    BlockId, Command, CommitBlockInUfsRequest, CommitBlockRequest, GetWorkerIdRequest,
    RegisterWorkerResponse, WorkerId, WorkerNetAddress,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::register::{registration_chunks, send_registration};
use super::{BlockMasterService, RegistrationPayload, WorkerInventoryReport};
use crate::config::WorkerConfig;
use crate::retry::{retry_rpc, RetryPolicy};

/// Retry-wrapped client for the coordinator's block master.
///
/// Heartbeats are serialised: the lock is taken before the first attempt and
/// held until the last one returns, so the coordinator never sees two
/// heartbeats from this client in flight and sees them in submission order.
pub struct BlockMasterClient {
    service: Arc<dyn BlockMasterService>,
    retry: RetryPolicy,
    heartbeat_timeout: Duration,
    register_timeout: Duration,
    chunk_size: usize,
    heartbeat_lock: Mutex<()>,
}

impl std::fmt::Debug for BlockMasterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockMasterClient")
            .field("retry", &self.retry)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("register_timeout", &self.register_timeout)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl BlockMasterClient {
    /// Creates a client with default timeouts and retry policy.
    #[must_use]
    pub fn new(service: Arc<dyn BlockMasterService>) -> Self {
        Self {
            service,
            retry: RetryPolicy::default(),
            heartbeat_timeout: Duration::from_secs(60),
            register_timeout: Duration::from_secs(600),
            chunk_size: 1_000,
            heartbeat_lock: Mutex::new(()),
        }
    }

    /// Creates a client configured from `config`.
    #[must_use]
    pub fn from_config(service: Arc<dyn BlockMasterService>, config: &WorkerConfig) -> Self {
        Self::new(service)
            .with_retry_policy(config.retry.policy())
            .with_heartbeat_timeout(config.heartbeat.rpc_timeout())
            .with_register_timeout(config.register.timeout())
            .with_chunk_size(config.register.chunk_size)
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Deadline of each heartbeat attempt.
    #[must_use]
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Bound on waiting for a registration acknowledgement.
    #[must_use]
    pub fn with_register_timeout(mut self, timeout: Duration) -> Self {
        self.register_timeout = timeout;
        self
    }

    /// Maximum block ids per registration chunk.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn service(&self) -> &dyn BlockMasterService {
        self.service.as_ref()
    }

    /// Reports a block committed on a tier.
    pub async fn commit_block(
        &self,
        worker_id: WorkerId,
        used_bytes_on_tier: u64,
        tier_alias: &str,
        medium_type: &str,
        block_id: BlockId,
        length: u64,
    ) -> Result<(), StatusError> {
        let request = &CommitBlockRequest {
            worker_id,
            used_bytes_on_tier,
            tier_alias: tier_alias.to_owned(),
            medium_type: medium_type.to_owned(),
            block_id,
            length,
        };
        let service = self.service();
        retry_rpc(&self.retry, "commit_block", move || {
            service.commit_block(request.clone())
        })
        .await?;
        debug!(worker_id, block_id, tier = tier_alias, "block committed");
        Ok(())
    }

    /// Reports a block committed to the under file system.
    pub async fn commit_block_in_ufs(&self, block_id: BlockId, length: u64) -> Result<(), StatusError> {
        let request = CommitBlockInUfsRequest { block_id, length };
        let service = self.service();
        retry_rpc(&self.retry, "commit_block_in_ufs", move || {
            service.commit_block_in_ufs(request.clone())
        })
        .await
    }

    /// Asks the coordinator for this worker's id.
    pub async fn get_worker_id(&self, address: &WorkerNetAddress) -> Result<WorkerId, StatusError> {
        let request = &GetWorkerIdRequest {
            address: address.clone(),
        };
        let service = self.service();
        let worker_id = retry_rpc(&self.retry, "get_worker_id", move || {
            service.get_worker_id(request.clone())
        })
        .await?;
        info!(worker_id, host = %address.host, "obtained worker id");
        Ok(worker_id)
    }

    /// Sends one heartbeat and returns the coordinator's command.
    pub async fn heartbeat(&self, report: WorkerInventoryReport) -> Result<Command, StatusError> {
        let request = &report.into_request();
        let deadline = self.heartbeat_timeout;
        let service = self.service();

        let _serialised = self.heartbeat_lock.lock().await;
        let command = retry_rpc(&self.retry, "block_heartbeat", move || {
            service.block_heartbeat(request.clone(), deadline)
        })
        .await?;
        debug!(
            worker_id = request.worker_id,
            added = request.added_blocks.len(),
            removed = request.removed_block_ids.len(),
            command = ?command.command_type,
            "heartbeat acknowledged"
        );
        Ok(command)
    }

    /// Sends the full registration snapshot.
    ///
    /// A transient failure resends the whole snapshot on a new stream. An
    /// acknowledgement that does not arrive in time is `InvalidState`.
    pub async fn register(&self, payload: &RegistrationPayload) -> Result<RegisterWorkerResponse, StatusError> {
        let chunks = registration_chunks(payload, self.chunk_size);
        let chunks = chunks.as_slice();
        let timeout = self.register_timeout;
        let service = self.service();

        let response = retry_rpc(&self.retry, "register_worker", move || {
            send_registration(service, chunks, timeout)
        })
        .await?;
        info!(
            worker_id = payload.worker_id,
            blocks = payload.block_count(),
            chunks = chunks.len(),
            "worker registered"
        );
        Ok(response)
    }
}
