//! Local tiered block storage.
//!
//! Each configured tier owns one or more directories. A block is a file
//! named by its decimal id inside exactly one directory. The store tracks
//! used bytes per directory and the blocks added or removed since the last
//! heartbeat the coordinator acknowledged.
//!
//! A removal is reported whenever the coordinator may know the block: it was
//! acknowledged before, or it is part of a report still awaiting an answer.
//! Only blocks the coordinator cannot have heard of disappear silently.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tierlink_proto::{BlockId, BlockStoreLocation, LocationBlockIdListEntry};
use tracing::{debug, info, warn};

use crate::config::StorageSettings;
use crate::error::{Result, WorkerError};
use crate::reviewer::{AllocationReviewer, DirectorySnapshot};

#[derive(Debug)]
struct StorageDir {
    location: BlockStoreLocation,
    path: PathBuf,
    capacity_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct BlockMeta {
    dir: usize,
    length: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    blocks: HashMap<BlockId, BlockMeta>,
    used_bytes: Vec<u64>,
    added: BTreeMap<BlockId, usize>,
    removed: BTreeSet<BlockId>,
    /// Added blocks already sent in a report that is not acknowledged yet.
    in_flight: BTreeSet<BlockId>,
    /// Reserved blocks whose file is still being written.
    writing: BTreeSet<BlockId>,
}

impl StoreState {
    /// Records that `block_id` left the store.
    fn forget(&mut self, block_id: BlockId) {
        let unreported = self.added.remove(&block_id).is_some() && !self.in_flight.contains(&block_id);
        if !unreported {
            self.removed.insert(block_id);
        }
    }
}

/// Blocks added and removed since the last acknowledged heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryDelta {
    /// Added blocks, one entry per directory; locations may repeat.
    pub added: Vec<LocationBlockIdListEntry>,
    pub removed: Vec<BlockId>,
}

impl InventoryDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.iter().all(|e| e.block_ids.is_empty())
    }
}

/// Where a block was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPlacement {
    pub block_id: BlockId,
    pub location: BlockStoreLocation,
    pub path: PathBuf,
    pub length: u64,
    /// Used bytes on the block's tier after the write.
    pub used_bytes_on_tier: u64,
}

/// Block inventory over the configured tier directories.
#[derive(Debug)]
pub struct LocalBlockStore {
    tiers: Vec<String>,
    dirs: Vec<StorageDir>,
    lost_storage: BTreeMap<String, Vec<String>>,
    reviewer: AllocationReviewer,
    state: Mutex<StoreState>,
}

impl LocalBlockStore {
    /// Opens the configured directories and indexes the blocks already in
    /// them.
    ///
    /// A directory that cannot be created or read is reported as lost
    /// storage rather than failing the worker.
    pub async fn open(settings: &StorageSettings) -> Result<Self> {
        let reviewer = AllocationReviewer::new(settings.reviewer_cutoff, settings.block_size_bytes)?;
        Self::open_with_reviewer(settings, reviewer).await
    }

    /// Like [`open`](Self::open) with a caller-supplied reviewer.
    pub async fn open_with_reviewer(settings: &StorageSettings, reviewer: AllocationReviewer) -> Result<Self> {
        let mut tiers = Vec::new();
        let mut dirs = Vec::new();
        let mut lost_storage: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut state = StoreState::default();

        for tier in &settings.tiers {
            tiers.push(tier.alias.clone());
            for path in &tier.dirs {
                let existing = match index_dir(path).await {
                    Ok(blocks) => blocks,
                    Err(e) => {
                        warn!(tier = %tier.alias, path = %path.display(), error = %e, "storage directory unusable");
                        lost_storage
                            .entry(tier.alias.clone())
                            .or_default()
                            .push(path.display().to_string());
                        continue;
                    }
                };

                let index = dirs.len();
                let mut used = 0u64;
                for (block_id, length) in existing {
                    used = used.saturating_add(length);
                    state.blocks.insert(block_id, BlockMeta { dir: index, length });
                }
                state.used_bytes.push(used);
                dirs.push(StorageDir {
                    location: BlockStoreLocation::new(tier.alias.clone(), tier.medium_type.clone()),
                    path: path.clone(),
                    capacity_bytes: tier.dir_capacity_bytes,
                });
            }
        }

        info!(
            tiers = tiers.len(),
            dirs = dirs.len(),
            lost = lost_storage.values().map(Vec::len).sum::<usize>(),
            blocks = state.blocks.len(),
            "block store opened"
        );
        Ok(Self {
            tiers,
            dirs,
            lost_storage,
            reviewer,
            state: Mutex::new(state),
        })
    }

    /// Tier aliases, fastest first.
    #[must_use]
    pub fn storage_tiers(&self) -> &[String] {
        &self.tiers
    }

    /// Directories that failed to initialise, by tier.
    #[must_use]
    pub fn lost_storage(&self) -> &BTreeMap<String, Vec<String>> {
        &self.lost_storage
    }

    /// Capacity of the usable directories, by tier.
    #[must_use]
    pub fn capacity_bytes_on_tiers(&self) -> BTreeMap<String, u64> {
        let mut capacity: BTreeMap<String, u64> = self.tiers.iter().map(|t| (t.clone(), 0)).collect();
        for dir in &self.dirs {
            let total = capacity.entry(dir.location.tier_alias.clone()).or_default();
            *total = total.saturating_add(dir.capacity_bytes);
        }
        capacity
    }

    /// Bytes used, by tier.
    #[must_use]
    pub fn used_bytes_on_tiers(&self) -> BTreeMap<String, u64> {
        let state = self.state.lock();
        let mut used: BTreeMap<String, u64> = self.tiers.iter().map(|t| (t.clone(), 0)).collect();
        for (dir, bytes) in self.dirs.iter().zip(&state.used_bytes) {
            let total = used.entry(dir.location.tier_alias.clone()).or_default();
            *total = total.saturating_add(*bytes);
        }
        used
    }

    /// Number of stored blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        let state = self.state.lock();
        state.blocks.len().saturating_sub(state.writing.len())
    }

    #[must_use]
    pub fn contains(&self, block_id: BlockId) -> bool {
        let state = self.state.lock();
        state.blocks.contains_key(&block_id) && !state.writing.contains(&block_id)
    }

    /// Every stored block, one entry per directory.
    #[must_use]
    pub fn current_blocks(&self) -> Vec<LocationBlockIdListEntry> {
        self.stored_blocks(&self.state.lock())
    }

    /// Changes the coordinator has not acknowledged yet, marked as sent.
    #[must_use]
    pub fn pending_changes(&self) -> InventoryDelta {
        self.pending_changes_bounded(usize::MAX)
    }

    /// Like [`pending_changes`](Self::pending_changes), carrying at most
    /// `max_blocks` ids. Removals go first; whatever does not fit stays
    /// pending for a later report.
    #[must_use]
    pub fn pending_changes_bounded(&self, max_blocks: usize) -> InventoryDelta {
        let mut state = self.state.lock();
        self.take_delta(&mut state, max_blocks)
    }

    /// The full inventory plus every pending change, taken atomically for a
    /// registration. All pending additions are marked as sent.
    #[must_use]
    pub fn registration_snapshot(&self) -> (Vec<LocationBlockIdListEntry>, InventoryDelta) {
        let mut state = self.state.lock();
        let current = self.stored_blocks(&state);
        let delta = self.take_delta(&mut state, usize::MAX);
        (current, delta)
    }

    /// Records that the coordinator was told about `block_id` outside a
    /// heartbeat, e.g. by a commit.
    pub fn mark_reported(&self, block_id: BlockId) {
        let mut state = self.state.lock();
        if state.added.contains_key(&block_id) {
            state.in_flight.insert(block_id);
        }
    }

    /// Forgets changes the coordinator acknowledged. Changes made after
    /// `delta` was taken stay pending.
    pub fn acknowledge(&self, delta: &InventoryDelta) {
        let mut state = self.state.lock();
        for entry in &delta.added {
            for block_id in &entry.block_ids {
                let reported = state
                    .added
                    .get(block_id)
                    .and_then(|&dir| self.dirs.get(dir))
                    .is_some_and(|dir| dir.location == entry.location);
                // A block moved since the report keeps its in-flight mark:
                // the coordinator now knows its old location.
                if reported {
                    state.added.remove(block_id);
                    state.in_flight.remove(block_id);
                }
            }
        }
        for block_id in &delta.removed {
            if state.removed.remove(block_id) {
                state.in_flight.remove(block_id);
            }
        }
    }

    /// Capacity views of every directory, in tier order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<DirectorySnapshot> {
        let state = self.state.lock();
        self.dirs
            .iter()
            .zip(&state.used_bytes)
            .map(|(dir, used)| snapshot(dir, *used))
            .collect()
    }

    /// Writes a new block to the first directory, in tier order, that has
    /// room and that the allocation reviewer accepts.
    pub async fn write_block(&self, block_id: BlockId, data: &[u8]) -> Result<BlockPlacement> {
        let length = u64::try_from(data.len()).unwrap_or(u64::MAX);
        let dir_index = self.reserve(block_id, length)?;
        let Some(dir) = self.dirs.get(dir_index) else {
            return Err(WorkerError::NoSpace { block_id, length });
        };
        let path = block_path(&dir.path, block_id);

        if let Err(e) = tokio::fs::write(&path, data).await {
            self.release(block_id);
            return Err(WorkerError::storage(path, e));
        }

        let used_bytes_on_tier = {
            let mut state = self.state.lock();
            state.writing.remove(&block_id);
            state.added.insert(block_id, dir_index);
            // The new location supersedes a pending removal. The coordinator
            // may still know the block, so a later removal must be reported.
            if state.removed.remove(&block_id) {
                state.in_flight.insert(block_id);
            }
            self.tier_used(&state, &dir.location.tier_alias)
        };
        debug!(block_id, length, path = %path.display(), "block written");

        Ok(BlockPlacement {
            block_id,
            location: dir.location.clone(),
            path,
            length,
            used_bytes_on_tier,
        })
    }

    /// Reads a stored block.
    pub async fn read_block(&self, block_id: BlockId) -> Result<Vec<u8>> {
        let path = self.block_file(block_id)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| WorkerError::storage(path, e))
    }

    /// Removes a stored block.
    pub async fn remove_block(&self, block_id: BlockId) -> Result<()> {
        let path = {
            let mut state = self.state.lock();
            if state.writing.contains(&block_id) {
                return Err(WorkerError::BlockBusy(block_id));
            }
            let Some(meta) = state.blocks.remove(&block_id) else {
                return Err(WorkerError::BlockNotFound(block_id));
            };
            if let Some(used) = state.used_bytes.get_mut(meta.dir) {
                *used = used.saturating_sub(meta.length);
            }
            state.forget(block_id);
            self.dirs
                .get(meta.dir)
                .map(|dir| block_path(&dir.path, block_id))
        };

        if let Some(path) = path {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(block_id, path = %path.display(), "block file already gone");
                }
                Err(e) => return Err(WorkerError::storage(path, e)),
            }
        }
        debug!(block_id, "block removed");
        Ok(())
    }

    /// Picks a directory and books the block's bytes against it.
    fn reserve(&self, block_id: BlockId, length: u64) -> Result<usize> {
        let mut state = self.state.lock();
        if state.blocks.contains_key(&block_id) {
            return Err(WorkerError::BlockExists(block_id));
        }

        let chosen = self.dirs.iter().enumerate().find_map(|(index, dir)| {
            let used = state.used_bytes.get(index).copied().unwrap_or(0);
            let view = snapshot(dir, used);
            (view.available_bytes >= length && self.reviewer.review(&view)).then_some(index)
        });
        let Some(index) = chosen else {
            return Err(WorkerError::NoSpace { block_id, length });
        };

        if let Some(used) = state.used_bytes.get_mut(index) {
            *used = used.saturating_add(length);
        }
        state.blocks.insert(block_id, BlockMeta { dir: index, length });
        state.writing.insert(block_id);
        Ok(index)
    }

    fn release(&self, block_id: BlockId) {
        let mut state = self.state.lock();
        state.writing.remove(&block_id);
        if let Some(meta) = state.blocks.remove(&block_id) {
            if let Some(used) = state.used_bytes.get_mut(meta.dir) {
                *used = used.saturating_sub(meta.length);
            }
        }
    }

    fn block_file(&self, block_id: BlockId) -> Result<PathBuf> {
        let state = self.state.lock();
        if state.writing.contains(&block_id) {
            return Err(WorkerError::BlockNotFound(block_id));
        }
        state
            .blocks
            .get(&block_id)
            .and_then(|meta| self.dirs.get(meta.dir))
            .map(|dir| block_path(&dir.path, block_id))
            .ok_or(WorkerError::BlockNotFound(block_id))
    }

    fn stored_blocks(&self, state: &StoreState) -> Vec<LocationBlockIdListEntry> {
        let mut per_dir: Vec<Vec<BlockId>> = vec![Vec::new(); self.dirs.len()];
        for (&block_id, meta) in &state.blocks {
            if state.writing.contains(&block_id) {
                continue;
            }
            if let Some(ids) = per_dir.get_mut(meta.dir) {
                ids.push(block_id);
            }
        }
        self.entries(per_dir)
    }

    fn take_delta(&self, state: &mut StoreState, max_blocks: usize) -> InventoryDelta {
        let removed: Vec<BlockId> = state.removed.iter().copied().take(max_blocks).collect();
        let room = max_blocks.saturating_sub(removed.len());

        let mut per_dir: Vec<Vec<BlockId>> = vec![Vec::new(); self.dirs.len()];
        let mut sent = Vec::new();
        for (&block_id, &dir) in state.added.iter().take(room) {
            if let Some(ids) = per_dir.get_mut(dir) {
                ids.push(block_id);
                sent.push(block_id);
            }
        }
        state.in_flight.extend(sent);

        InventoryDelta {
            added: self.entries(per_dir),
            removed,
        }
    }

    fn tier_used(&self, state: &StoreState, tier_alias: &str) -> u64 {
        self.dirs
            .iter()
            .zip(&state.used_bytes)
            .filter(|(dir, _)| dir.location.tier_alias == tier_alias)
            .map(|(_, used)| *used)
            .fold(0, u64::saturating_add)
    }

    fn entries(&self, per_dir: Vec<Vec<BlockId>>) -> Vec<LocationBlockIdListEntry> {
        self.dirs
            .iter()
            .zip(per_dir)
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(dir, mut ids)| {
                ids.sort_unstable();
                LocationBlockIdListEntry {
                    location: dir.location.clone(),
                    block_ids: ids,
                }
            })
            .collect()
    }
}

fn snapshot(dir: &StorageDir, used: u64) -> DirectorySnapshot {
    DirectorySnapshot {
        tier_alias: dir.location.tier_alias.clone(),
        available_bytes: dir.capacity_bytes.saturating_sub(used),
        capacity_bytes: dir.capacity_bytes,
    }
}

fn block_path(dir: &Path, block_id: BlockId) -> PathBuf {
    dir.join(block_id.to_string())
}

/// Creates `path` if needed and returns the blocks already in it.
///
/// Files whose name is not a decimal block id are ignored.
async fn index_dir(path: &Path) -> std::io::Result<Vec<(BlockId, u64)>> {
    tokio::fs::create_dir_all(path).await?;
    let mut blocks = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let Some(block_id) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<BlockId>().ok())
        else {
            continue;
        };
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            blocks.push((block_id, metadata.len()));
        }
    }
    Ok(blocks)
}
