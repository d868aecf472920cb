use std::time::Duration;

use async_trait::async_trait;
use tierlink_core::{RpcChannel, StatusError};
use tierlink_proto::{
    BlockHeartbeatRequest, Command, CommitBlockInUfsRequest, CommitBlockRequest,
    GetWorkerIdRequest, Method, RpcMessage, WorkerId,
};

use super::{BlockMasterService, RegistrationStream};

/// Default deadline for unary calls other than heartbeats.
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Block master reached over a multiplexed coordinator connection.
#[derive(Debug, Clone)]
pub struct RemoteBlockMaster {
    channel: RpcChannel,
    rpc_timeout: Duration,
}

impl RemoteBlockMaster {
    #[must_use]
    pub fn new(channel: RpcChannel) -> Self {
        Self {
            channel,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Sets the deadline for commit and worker id calls.
    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}

fn unexpected(method: Method, response: &RpcMessage) -> StatusError {
    StatusError::Internal(format!(
        "{method} answered with unexpected {}",
        response.name()
    ))
}

#[async_trait]
impl BlockMasterService for RemoteBlockMaster {
    async fn commit_block(&self, request: CommitBlockRequest) -> Result<(), StatusError> {
        let method = Method::CommitBlock;
        match self.channel.unary(method, request.into(), self.rpc_timeout).await? {
            RpcMessage::CommitBlockResponse => Ok(()),
            other => Err(unexpected(method, &other)),
        }
    }

    async fn commit_block_in_ufs(&self, request: CommitBlockInUfsRequest) -> Result<(), StatusError> {
        let method = Method::CommitBlockInUfs;
        match self.channel.unary(method, request.into(), self.rpc_timeout).await? {
            RpcMessage::CommitBlockInUfsResponse => Ok(()),
            other => Err(unexpected(method, &other)),
        }
    }

    async fn get_worker_id(&self, request: GetWorkerIdRequest) -> Result<WorkerId, StatusError> {
        let method = Method::GetWorkerId;
        match self.channel.unary(method, request.into(), self.rpc_timeout).await? {
            RpcMessage::GetWorkerIdResponse(response) => Ok(response.worker_id),
            other => Err(unexpected(method, &other)),
        }
    }

    async fn block_heartbeat(
        &self,
        request: BlockHeartbeatRequest,
        deadline: Duration,
    ) -> Result<Command, StatusError> {
        let method = Method::BlockHeartbeat;
        match self.channel.unary(method, request.into(), deadline).await? {
            RpcMessage::BlockHeartbeatResponse(response) => Ok(response.command),
            other => Err(unexpected(method, &other)),
        }
    }

    async fn register_worker(&self, deadline: Duration) -> Result<RegistrationStream, StatusError> {
        self.channel.open(Method::RegisterWorker, Some(deadline)).await
    }
}
