use std::collections::BTreeMap;

use tierlink_proto::{
    BlockHeartbeatOptions, BlockHeartbeatRequest, BlockId, ConfigProperty,
    LocationBlockIdListEntry, Metric, RegisterWorkerMetadata, WorkerId,
};

use super::merge_block_locations;

/// One heartbeat's view of the worker's inventory.
///
/// `added_blocks` may list the same location more than once (one entry per
/// storage directory); entries are merged when the request is built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerInventoryReport {
    pub worker_id: WorkerId,
    pub capacity_bytes_on_tiers: BTreeMap<String, u64>,
    pub used_bytes_on_tiers: BTreeMap<String, u64>,
    pub removed_block_ids: Vec<BlockId>,
    pub added_blocks: Vec<LocationBlockIdListEntry>,
    pub lost_storage: BTreeMap<String, Vec<String>>,
    pub metrics: Vec<Metric>,
}

impl WorkerInventoryReport {
    /// Builds the wire request.
    #[must_use]
    pub fn into_request(self) -> BlockHeartbeatRequest {
        BlockHeartbeatRequest {
            worker_id: self.worker_id,
            used_bytes_on_tiers: self.used_bytes_on_tiers.into_iter().collect(),
            removed_block_ids: self.removed_block_ids,
            added_blocks: merge_block_locations(self.added_blocks),
            lost_storage: self.lost_storage.into_iter().collect(),
            options: BlockHeartbeatOptions {
                metrics: self.metrics,
                capacity_bytes_on_tiers: self.capacity_bytes_on_tiers.into_iter().collect(),
            },
        }
    }
}

/// Snapshot sent once when the worker registers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationPayload {
    pub worker_id: WorkerId,
    /// Tier aliases, fastest first.
    pub storage_tiers: Vec<String>,
    pub total_bytes_on_tiers: BTreeMap<String, u64>,
    pub used_bytes_on_tiers: BTreeMap<String, u64>,
    /// Blocks per location; duplicates are merged before sending.
    pub current_blocks: Vec<LocationBlockIdListEntry>,
    pub lost_storage: BTreeMap<String, Vec<String>>,
    pub configs: Vec<ConfigProperty>,
}

impl RegistrationPayload {
    /// Everything except the block lists.
    #[must_use]
    pub fn metadata(&self) -> RegisterWorkerMetadata {
        RegisterWorkerMetadata {
            worker_id: self.worker_id,
            storage_tiers: self.storage_tiers.clone(),
            total_bytes_on_tiers: pairs(&self.total_bytes_on_tiers),
            used_bytes_on_tiers: pairs(&self.used_bytes_on_tiers),
            lost_storage: pairs(&self.lost_storage),
            configs: self.configs.clone(),
        }
    }

    /// Number of blocks in the snapshot.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.current_blocks.iter().map(|e| e.block_ids.len()).sum()
    }
}

fn pairs<V: Clone>(map: &BTreeMap<String, V>) -> Vec<(String, V)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}
