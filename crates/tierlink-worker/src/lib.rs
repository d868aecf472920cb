//! Worker side of the tierlink control plane.
//!
//! - **Session**: connect to the coordinator and authenticate the channel
//! - **Block master**: commit, heartbeat and registration calls with retries
//! - **Storage**: local tiered block inventory and placement
//! - **Reviewer**: probabilistic acceptance of blocks on nearly full directories
//! - **Sync**: periodic heartbeats and command execution
//!
//! # Example
//!
//! ```ignore
//! use tierlink_worker::{config::WorkerConfig, worker};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = WorkerConfig::load(Some("worker.toml"))?;
//! worker::run(config, CancellationToken::new()).await?;
//! ```

pub mod block_master;
pub mod config;
pub mod error;
pub mod retry;
pub mod reviewer;
pub mod session;
pub mod storage;
pub mod sync;
pub mod worker;

pub use block_master::{
    merge_block_locations, registration_chunks, BlockMasterClient, BlockMasterService,
    RegistrationPayload, RegistrationStream, RemoteBlockMaster, WorkerInventoryReport,
};
pub use config::{ConfigError, WorkerConfig};
pub use error::{Result, WorkerError};
pub use retry::{retry_rpc, RetryPolicy};
pub use reviewer::{AllocationReviewer, DirectorySnapshot};
pub use session::CoordinatorSession;
pub use storage::{BlockPlacement, InventoryDelta, LocalBlockStore};
pub use sync::BlockMasterSync;
