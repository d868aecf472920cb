//! Wire protocol types for the tierlink worker control plane.
//!
//! Workers talk to the coordinator over a single multiplexed connection.
//! Every frame on that connection belongs to one call, identified by the
//! correlation id carried in the envelope header. This crate provides:
//!
//! - Authentication handshake messages (SASL-style challenge/response)
//! - Block-master messages (commit, heartbeat, registration, worker id)
//! - RPC frames that open, feed, fail and complete a call
//! - Status codes shared by both ends of the connection
//!
//! Frames are length-prefixed rkyv archives; see [`codec`] for the layout.
//!
//! # Example
//!
//! ```ignore
//! use tierlink_proto::{Envelope, Method, RpcFrame};
//!
//! let open = Envelope::new(RpcFrame::Open(Method::BlockHeartbeat));
//! let call_id = open.header.correlation_id;
//! ```

pub mod auth;
pub mod block_master;
pub mod codec;
mod envelope;
mod error;
pub mod rpc;
mod types;

pub use auth::{AuthMessage, AuthMessageType};
pub use block_master::{
    BlockHeartbeatOptions, BlockHeartbeatRequest, BlockHeartbeatResponse, Command, CommandType,
    CommitBlockInUfsRequest, CommitBlockRequest, ConfigProperty, GetWorkerIdRequest,
    GetWorkerIdResponse, LocationBlockIdListEntry, Metric, RegisterWorkerChunk,
    RegisterWorkerMetadata, RegisterWorkerResponse, WorkerNetAddress,
};
pub use codec::{Codec, FrameHeader, MessageType, CURRENT_VERSION, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use envelope::{Envelope, EnvelopeHeader};
pub use error::{ProtocolError, Status, StatusCode};
pub use rpc::{CallKind, Method, RpcFrame, RpcMessage};
pub use types::{BlockId, BlockStoreLocation, CorrelationId, WorkerId};

/// Versions a peer may stamp on its frames. Anything outside
/// `MIN_SUPPORTED..=CURRENT` is refused.
pub mod version {
    pub const CURRENT: u16 = 1;
    pub const MIN_SUPPORTED: u16 = 1;
}

/// Well-known ports.
pub mod ports {
    /// Where the coordinator's block master listens unless configured otherwise.
    pub const COORDINATOR: u16 = 19998;
}
