//! RPC frames multiplexed over one connection.
//!
//! A call is a sequence of frames sharing one correlation id. The client
//! sends `Open(method)` first, then any number of `Message` frames and a
//! `Complete` to half-close. The server answers with `Message` frames and
//! a `Complete`, or terminates the call with `Error`.

use rkyv::{Archive, Deserialize, Serialize};

use crate::auth::AuthMessage;
use crate::block_master::{
    BlockHeartbeatRequest, BlockHeartbeatResponse, CommitBlockInUfsRequest, CommitBlockRequest,
    GetWorkerIdRequest, GetWorkerIdResponse, RegisterWorkerChunk, RegisterWorkerResponse,
};
use crate::codec::MessageType;
use crate::error::Status;

/// Shape of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// One request, one response.
    Unary,
    /// Many requests, one response.
    ClientStreaming,
    /// Both sides stream.
    Bidi,
}

/// Remote methods exposed by the coordinator.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Authenticate,
    CommitBlock,
    CommitBlockInUfs,
    GetWorkerId,
    BlockHeartbeat,
    RegisterWorker,
}

impl Method {
    /// Call shape of this method.
    #[must_use]
    pub const fn kind(self) -> CallKind {
        match self {
            Self::Authenticate => CallKind::Bidi,
            Self::RegisterWorker => CallKind::ClientStreaming,
            Self::CommitBlock | Self::CommitBlockInUfs | Self::GetWorkerId | Self::BlockHeartbeat => {
                CallKind::Unary
            }
        }
    }

    /// Frame message type used for this method's traffic.
    #[must_use]
    pub const fn message_type(self) -> MessageType {
        match self {
            Self::Authenticate => MessageType::Auth,
            _ => MessageType::BlockMaster,
        }
    }

    /// Method name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Authenticate => "authenticate",
            Self::CommitBlock => "commit_block",
            Self::CommitBlockInUfs => "commit_block_in_ufs",
            Self::GetWorkerId => "get_worker_id",
            Self::BlockHeartbeat => "block_heartbeat",
            Self::RegisterWorker => "register_worker",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of a `Message` frame.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Auth(AuthMessage),
    CommitBlock(CommitBlockRequest),
    CommitBlockResponse,
    CommitBlockInUfs(CommitBlockInUfsRequest),
    CommitBlockInUfsResponse,
    GetWorkerId(GetWorkerIdRequest),
    GetWorkerIdResponse(GetWorkerIdResponse),
    BlockHeartbeat(BlockHeartbeatRequest),
    BlockHeartbeatResponse(BlockHeartbeatResponse),
    RegisterWorker(RegisterWorkerChunk),
    RegisterWorkerResponse(RegisterWorkerResponse),
}

impl RpcMessage {
    /// Variant name for logs and error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::CommitBlock(_) => "commit_block",
            Self::CommitBlockResponse => "commit_block_response",
            Self::CommitBlockInUfs(_) => "commit_block_in_ufs",
            Self::CommitBlockInUfsResponse => "commit_block_in_ufs_response",
            Self::GetWorkerId(_) => "get_worker_id",
            Self::GetWorkerIdResponse(_) => "get_worker_id_response",
            Self::BlockHeartbeat(_) => "block_heartbeat",
            Self::BlockHeartbeatResponse(_) => "block_heartbeat_response",
            Self::RegisterWorker(_) => "register_worker",
            Self::RegisterWorkerResponse(_) => "register_worker_response",
        }
    }
}

macro_rules! rpc_message_conversions {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for RpcMessage {
                fn from(message: $ty) -> Self {
                    Self::$variant(message)
                }
            }

            impl TryFrom<RpcMessage> for $ty {
                type Error = RpcMessage;

                fn try_from(message: RpcMessage) -> Result<Self, Self::Error> {
                    match message {
                        RpcMessage::$variant(inner) => Ok(inner),
                        other => Err(other),
                    }
                }
            }
        )*
    };
}

rpc_message_conversions! {
    Auth => AuthMessage,
    CommitBlock => CommitBlockRequest,
    CommitBlockInUfs => CommitBlockInUfsRequest,
    GetWorkerId => GetWorkerIdRequest,
    GetWorkerIdResponse => GetWorkerIdResponse,
    BlockHeartbeat => BlockHeartbeatRequest,
    BlockHeartbeatResponse => BlockHeartbeatResponse,
    RegisterWorker => RegisterWorkerChunk,
    RegisterWorkerResponse => RegisterWorkerResponse,
}

/// A frame of a multiplexed call.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RpcFrame {
    /// Starts a call.
    Open(Method),
    /// Carries one message in either direction.
    Message(RpcMessage),
    /// Terminates the call with a failure.
    Error(Status),
    /// Half-closes the sender's direction.
    Complete,
}
