//! Block-master message types.
//!
//! These carry a worker's inventory to the coordinator: single block
//! commits, periodic heartbeats and the one-time registration snapshot.
//! Maps are encoded as ordered `(key, value)` vectors.

use rkyv::{Archive, Deserialize, Serialize};

use crate::types::{BlockId, BlockStoreLocation, WorkerId};

/// Network address a worker advertises to the coordinator.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct WorkerNetAddress {
    /// Hostname or IP address.
    pub host: String,
    /// RPC port.
    pub rpc_port: u16,
    /// Data transfer port.
    pub data_port: u16,
    /// Web UI port.
    pub web_port: u16,
}

/// Reports a block as committed on a cache tier.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommitBlockRequest {
    pub worker_id: WorkerId,
    /// Bytes used on the tier after the commit.
    pub used_bytes_on_tier: u64,
    pub tier_alias: String,
    pub medium_type: String,
    pub block_id: BlockId,
    pub length: u64,
}

/// Reports a block as committed to the under file system.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommitBlockInUfsRequest {
    pub block_id: BlockId,
    pub length: u64,
}

/// Asks the coordinator for the id of the worker at an address.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct GetWorkerIdRequest {
    pub address: WorkerNetAddress,
}

/// Worker id assigned by the coordinator.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetWorkerIdResponse {
    pub worker_id: WorkerId,
}

/// An opaque measurement reported with a heartbeat.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub tags: Vec<(String, String)>,
}

impl Metric {
    /// Creates an untagged metric.
    #[must_use]
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value,
            tags: Vec::new(),
        }
    }
}

/// Block ids stored at one location.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LocationBlockIdListEntry {
    pub location: BlockStoreLocation,
    pub block_ids: Vec<BlockId>,
}

/// Optional heartbeat fields.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct BlockHeartbeatOptions {
    pub metrics: Vec<Metric>,
    pub capacity_bytes_on_tiers: Vec<(String, u64)>,
}

/// Periodic inventory report.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BlockHeartbeatRequest {
    pub worker_id: WorkerId,
    pub used_bytes_on_tiers: Vec<(String, u64)>,
    pub removed_block_ids: Vec<BlockId>,
    /// At most one entry per location.
    pub added_blocks: Vec<LocationBlockIdListEntry>,
    /// Tier alias to paths that failed to initialise.
    pub lost_storage: Vec<(String, Vec<String>)>,
    pub options: BlockHeartbeatOptions,
}

/// Kind of directive the coordinator returns.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    Unknown,
    /// Nothing to do.
    Nothing,
    /// The coordinator lost track of the worker; register again.
    Register,
    /// Free the listed blocks.
    Free,
    /// Delete the listed blocks.
    Delete,
    /// Persist the listed blocks.
    Persist,
}

/// Directive returned in response to a heartbeat.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub command_type: CommandType,
    /// Block ids the command applies to.
    pub data: Vec<BlockId>,
}

impl Command {
    /// A command with no work attached.
    #[must_use]
    pub fn nothing() -> Self {
        Self {
            command_type: CommandType::Nothing,
            data: Vec::new(),
        }
    }

    /// Creates a command for the given blocks.
    #[must_use]
    pub fn new(command_type: CommandType, data: Vec<BlockId>) -> Self {
        Self { command_type, data }
    }
}

/// Response to a heartbeat.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockHeartbeatResponse {
    pub command: Command,
}

/// A configuration key reported at registration for diagnostics.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConfigProperty {
    pub name: String,
    /// Where the value came from (file, environment, default).
    pub source: String,
    pub value: Option<String>,
}

/// First chunk of a registration stream: everything except block lists.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RegisterWorkerMetadata {
    pub worker_id: WorkerId,
    /// Tier aliases in tier order.
    pub storage_tiers: Vec<String>,
    pub total_bytes_on_tiers: Vec<(String, u64)>,
    pub used_bytes_on_tiers: Vec<(String, u64)>,
    pub lost_storage: Vec<(String, Vec<String>)>,
    pub configs: Vec<ConfigProperty>,
}

/// One message of the client-streaming registration call.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RegisterWorkerChunk {
    /// Always the first chunk.
    Metadata(RegisterWorkerMetadata),
    /// A bounded slice of the current block inventory.
    Blocks {
        worker_id: WorkerId,
        entries: Vec<LocationBlockIdListEntry>,
    },
}

impl RegisterWorkerChunk {
    /// Number of block ids carried by this chunk.
    #[must_use]
    pub fn block_count(&self) -> usize {
        match self {
            Self::Metadata(_) => 0,
            Self::Blocks { entries, .. } => entries.iter().map(|e| e.block_ids.len()).sum(),
        }
    }
}

/// Acknowledgement of a completed registration.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWorkerResponse {
    /// Block ids the coordinator received across all chunks.
    pub received_blocks: u64,
}
