//! Periodic synchronisation of the local inventory with the coordinator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tierlink_core::StatusError;
use tierlink_proto::{Command, CommandType, ConfigProperty, LocationBlockIdListEntry, Metric, WorkerId};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::block_master::{BlockMasterClient, RegistrationPayload, WorkerInventoryReport};
use crate::error::{Result, WorkerError};
use crate::storage::{BlockPlacement, InventoryDelta, LocalBlockStore};

/// Keeps the coordinator's view of this worker current.
///
/// Registers once, then heartbeats on a fixed interval. Deltas are only
/// forgotten after the coordinator acknowledged the heartbeat carrying them.
#[derive(Debug)]
pub struct BlockMasterSync {
    client: Arc<BlockMasterClient>,
    store: Arc<LocalBlockStore>,
    worker_id: WorkerId,
    interval: Duration,
    configs: Vec<ConfigProperty>,
    max_report_blocks: usize,
    registered: AtomicBool,
}

impl BlockMasterSync {
    #[must_use]
    pub fn new(
        client: Arc<BlockMasterClient>,
        store: Arc<LocalBlockStore>,
        worker_id: WorkerId,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            worker_id,
            interval,
            configs: Vec::new(),
            max_report_blocks: usize::MAX,
            registered: AtomicBool::new(false),
        }
    }

    /// Configuration reported at registration.
    #[must_use]
    pub fn with_configs(mut self, configs: Vec<ConfigProperty>) -> Self {
        self.configs = configs;
        self
    }

    /// Caps the block ids one heartbeat carries.
    #[must_use]
    pub fn with_max_report_blocks(mut self, max_report_blocks: usize) -> Self {
        self.max_report_blocks = max_report_blocks.max(1);
        self
    }

    #[must_use]
    pub const fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Returns true once a registration was acknowledged.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Snapshot of the full inventory for registration.
    #[must_use]
    pub fn registration_payload(&self) -> RegistrationPayload {
        self.payload_with(self.store.current_blocks())
    }

    fn payload_with(&self, current_blocks: Vec<LocationBlockIdListEntry>) -> RegistrationPayload {
        RegistrationPayload {
            worker_id: self.worker_id,
            storage_tiers: self.store.storage_tiers().to_vec(),
            total_bytes_on_tiers: self.store.capacity_bytes_on_tiers(),
            used_bytes_on_tiers: self.store.used_bytes_on_tiers(),
            current_blocks,
            lost_storage: self.store.lost_storage().clone(),
            configs: self.configs.clone(),
        }
    }

    /// Builds a heartbeat report and the delta it carries.
    #[must_use]
    pub fn inventory_report(&self) -> (WorkerInventoryReport, InventoryDelta) {
        let delta = self.store.pending_changes_bounded(self.max_report_blocks);
        let report = WorkerInventoryReport {
            worker_id: self.worker_id,
            capacity_bytes_on_tiers: self.store.capacity_bytes_on_tiers(),
            used_bytes_on_tiers: self.store.used_bytes_on_tiers(),
            removed_block_ids: delta.removed.clone(),
            added_blocks: delta.added.clone(),
            lost_storage: self.store.lost_storage().clone(),
            metrics: self.metrics(),
        };
        (report, delta)
    }

    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    fn metrics(&self) -> Vec<Metric> {
        let used: u64 = self.store.used_bytes_on_tiers().values().sum();
        vec![
            Metric::new("worker.blocks.cached", self.store.block_count() as f64),
            Metric::new("worker.capacity.used", used as f64),
        ]
    }

    /// Sends the full inventory snapshot.
    pub async fn register(&self) -> std::result::Result<(), StatusError> {
        let (current_blocks, delta) = self.store.registration_snapshot();
        let payload = self.payload_with(current_blocks);
        let response = self.client.register(&payload).await?;
        self.store.acknowledge(&delta);
        self.registered.store(true, Ordering::Release);
        debug!(received = response.received_blocks, "registration acknowledged");
        Ok(())
    }

    /// Sends one heartbeat and returns the coordinator's command.
    pub async fn heartbeat(&self) -> std::result::Result<Command, StatusError> {
        let (report, delta) = self.inventory_report();
        let command = self.client.heartbeat(report).await?;
        self.store.acknowledge(&delta);
        Ok(command)
    }

    /// Reports a freshly written block to the coordinator.
    pub async fn commit(&self, placement: &BlockPlacement) -> std::result::Result<(), StatusError> {
        // The commit may land even if its answer is lost.
        self.store.mark_reported(placement.block_id);
        self.client
            .commit_block(
                self.worker_id,
                placement.used_bytes_on_tier,
                &placement.location.tier_alias,
                &placement.location.medium_type,
                placement.block_id,
                placement.length,
            )
            .await
    }

    /// Carries out a coordinator command.
    pub async fn execute(&self, command: Command) -> Result<()> {
        match command.command_type {
            CommandType::Nothing => Ok(()),
            CommandType::Register => {
                info!(worker_id = self.worker_id, "coordinator requested re-registration");
                self.registered.store(false, Ordering::Release);
                self.register().await?;
                Ok(())
            }
            CommandType::Free | CommandType::Delete => {
                for block_id in command.data {
                    match self.store.remove_block(block_id).await {
                        Ok(()) => {}
                        Err(WorkerError::BlockNotFound(_)) => {
                            debug!(block_id, "coordinator asked to remove an absent block");
                        }
                        Err(e) => warn!(block_id, error = %e, "failed to remove block"),
                    }
                }
                Ok(())
            }
            CommandType::Persist | CommandType::Unknown => {
                warn!(command = ?command.command_type, "ignoring unsupported command");
                Ok(())
            }
        }
    }

    /// Registers, then heartbeats until `shutdown` is cancelled.
    ///
    /// Transient failures are logged and retried on the next tick; losing
    /// authorisation ends the loop with an error.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(worker_id = self.worker_id, interval_ms = self.interval.as_millis(), "starting block master sync");

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!(worker_id = self.worker_id, "block master sync stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            if !self.is_registered() {
                if let Err(e) = self.register().await {
                    self.check(e, "registration")?;
                    continue;
                }
            }

            let command = match self.heartbeat().await {
                Ok(command) => command,
                Err(e) => {
                    self.check(e, "heartbeat")?;
                    continue;
                }
            };
            if let Err(e) = self.execute(command).await {
                match e {
                    WorkerError::Rpc(e) => self.check(e, "command")?,
                    other => warn!(error = %other, "failed to execute command"),
                }
            }
        }
    }

    /// Decides whether a failed call ends the sync loop.
    fn check(&self, e: StatusError, operation: &str) -> Result<()> {
        match e {
            StatusError::Unauthenticated(_) | StatusError::PermissionDenied(_) => {
                error!(worker_id = self.worker_id, operation, error = %e, "coordinator refused worker");
                Err(e.into())
            }
            _ => {
                warn!(worker_id = self.worker_id, operation, error = %e, "will retry on next tick");
                Ok(())
            }
        }
    }
}
