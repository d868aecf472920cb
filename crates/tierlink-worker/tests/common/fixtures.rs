//! Configuration and payload fixtures for worker integration tests.

use std::collections::BTreeMap;
use std::path::Path;

use tierlink_core::Transport;
use tierlink_proto::{BlockStoreLocation, LocationBlockIdListEntry, WorkerId};
use tierlink_worker::config::{StorageSettings, TierSettings, WorkerConfig};
use tierlink_worker::RegistrationPayload;

/// A single `MEM` tier with one directory under `root`.
pub fn storage(root: &Path, capacity_bytes: u64) -> StorageSettings {
    StorageSettings {
        block_size_bytes: 16,
        reviewer_cutoff: 0.1,
        tiers: vec![TierSettings {
            alias: "MEM".into(),
            medium_type: "MEM".into(),
            dirs: vec![root.join("mem")],
            dir_capacity_bytes: capacity_bytes,
        }],
    }
}

/// Builder for worker configurations pointed at a test coordinator.
pub struct ConfigBuilder {
    config: WorkerConfig,
}

impl ConfigBuilder {
    pub fn new(coordinator: Transport, root: &Path) -> Self {
        let mut config = WorkerConfig::default();
        config.coordinator.transport = coordinator;
        config.coordinator.connect_timeout_ms = 2_000;
        config.auth.username = super::WORKER_USER.into();
        config.auth.password = super::WORKER_PASSWORD.into();
        config.auth.handshake_timeout_ms = 2_000;
        config.heartbeat.interval_ms = 20;
        config.heartbeat.rpc_timeout_ms = 2_000;
        config.register.timeout_secs = 5;
        config.retry.initial_backoff_ms = 5;
        config.retry.max_backoff_ms = 20;
        config.storage = storage(root, 1024 * 1024);
        Self { config }
    }

    pub fn password(mut self, password: &str) -> Self {
        self.config.auth.password = password.into();
        self
    }

    pub fn auth_enabled(mut self, enabled: bool) -> Self {
        self.config.auth.enabled = enabled;
        self
    }

    pub fn allow_disabled(mut self, allow: bool) -> Self {
        self.config.auth.allow_disabled = allow;
        self
    }

    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

/// A registration snapshot with `count` consecutive block ids on `MEM`.
pub fn payload(worker_id: WorkerId, count: u64) -> RegistrationPayload {
    RegistrationPayload {
        worker_id,
        storage_tiers: vec!["MEM".into()],
        total_bytes_on_tiers: BTreeMap::from([("MEM".to_owned(), 1 << 30)]),
        used_bytes_on_tiers: BTreeMap::from([("MEM".to_owned(), count * 16)]),
        current_blocks: vec![LocationBlockIdListEntry {
            location: BlockStoreLocation::new("MEM", "MEM"),
            block_ids: (1..=count).collect(),
        }],
        lost_storage: BTreeMap::new(),
        configs: Vec::new(),
    }
}
