//! Inventory reporting to the coordinator's block master.
//!
//! [`BlockMasterService`] is the transport stub: one method per remote
//! call, no retries. [`BlockMasterClient`] layers the retry discipline,
//! heartbeat serialisation and registration chunking on top of it.

mod client;
mod location;
mod register;
mod remote;
mod report;

use std::time::Duration;

use async_trait::async_trait;
use tierlink_core::{BidiStream, StatusError};
use tierlink_proto::{
    BlockHeartbeatRequest, Command, CommitBlockInUfsRequest, CommitBlockRequest,
    GetWorkerIdRequest, RegisterWorkerChunk, RegisterWorkerResponse, WorkerId,
};

pub use client::BlockMasterClient;
pub use location::merge_block_locations;
pub use register::registration_chunks;
pub use remote::RemoteBlockMaster;
pub use report::{RegistrationPayload, WorkerInventoryReport};

/// Stream carrying a registration: chunks out, one acknowledgement in.
pub type RegistrationStream = BidiStream<RegisterWorkerChunk, RegisterWorkerResponse>;

/// Remote calls offered by the coordinator's block master.
#[async_trait]
pub trait BlockMasterService: Send + Sync {
    /// Marks a block as committed on a tier.
    async fn commit_block(&self, request: CommitBlockRequest) -> Result<(), StatusError>;

    /// Marks a block as committed to the under file system.
    async fn commit_block_in_ufs(&self, request: CommitBlockInUfsRequest) -> Result<(), StatusError>;

    /// Returns the id the coordinator assigns to the worker at `address`.
    async fn get_worker_id(&self, request: GetWorkerIdRequest) -> Result<WorkerId, StatusError>;

    /// Sends one heartbeat, bounded by `deadline`.
    async fn block_heartbeat(
        &self,
        request: BlockHeartbeatRequest,
        deadline: Duration,
    ) -> Result<Command, StatusError>;

    /// Opens a registration stream.
    ///
    /// The caller sends every chunk, completes its side and waits for a
    /// single acknowledgement.
    async fn register_worker(&self, deadline: Duration) -> Result<RegistrationStream, StatusError>;
}
