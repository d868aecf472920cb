//! Allocation reviewer: decides whether a storage directory should take a
//! new block.
//!
//! A directory with more than `cutoff * capacity` bytes available always
//! accepts. A directory that cannot fit one more default-sized block always
//! rejects. In between, acceptance probability falls linearly from 1 at
//! usage `1 - cutoff` to 0 at usage 1, so workers filling the same nearly
//! full tier do not all accept or reject in lockstep.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::config::ConfigError;

/// Cutoff fraction used when none is configured.
pub const DEFAULT_CUTOFF: f64 = 0.1;

/// Capacity view of one storage directory at decision time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySnapshot {
    pub tier_alias: String,
    pub available_bytes: u64,
    pub capacity_bytes: u64,
}

/// Capacity-aware, probabilistic placement policy.
pub struct AllocationReviewer {
    cutoff: f64,
    block_size_bytes: u64,
    rng: Mutex<SmallRng>,
}

impl std::fmt::Debug for AllocationReviewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationReviewer")
            .field("cutoff", &self.cutoff)
            .field("block_size_bytes", &self.block_size_bytes)
            .finish_non_exhaustive()
    }
}

impl AllocationReviewer {
    /// Creates a reviewer.
    ///
    /// The cutoff must lie in `(0, 1]` and the block size must be positive;
    /// anything else makes the acceptance curve undefined.
    pub fn new(cutoff: f64, block_size_bytes: u64) -> Result<Self, ConfigError> {
        if !(cutoff > 0.0 && cutoff <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "allocation cutoff must be in (0, 1], got {cutoff}"
            )));
        }
        if block_size_bytes == 0 {
            return Err(ConfigError::Invalid("block size must be positive".into()));
        }
        Ok(Self {
            cutoff,
            block_size_bytes,
            rng: Mutex::new(SmallRng::from_entropy()),
        })
    }

    /// Replaces the random source, e.g. with a seeded one.
    #[must_use]
    pub fn with_rng(mut self, rng: SmallRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    #[must_use]
    pub const fn block_size_bytes(&self) -> u64 {
        self.block_size_bytes
    }

    /// Returns true if `dir` should take a new block.
    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    pub fn review(&self, dir: &DirectorySnapshot) -> bool {
        let capacity = dir.capacity_bytes as f64;
        let available = dir.available_bytes as f64;

        let cutoff_bytes = (self.cutoff * capacity).floor();
        if available > cutoff_bytes {
            return true;
        }

        let usage = self.usage(dir);
        if usage >= 1.0 {
            return false;
        }

        let k = -1.0 / self.cutoff;
        let b = 1.0 / self.cutoff;
        let y = k * usage + b;
        let dice: f64 = self.rng.lock().gen();
        let accepted = dice < y;
        debug!(
            tier = %dir.tier_alias,
            usage,
            y,
            dice,
            accepted,
            "reviewed allocation near capacity"
        );
        accepted
    }

    /// Fraction of the directory in use, measured against the room left
    /// once one default block is reserved.
    ///
    /// A directory no larger than one block has no such room and counts as
    /// full.
    #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
    fn usage(&self, dir: &DirectorySnapshot) -> f64 {
        if dir.capacity_bytes <= self.block_size_bytes {
            return f64::INFINITY;
        }
        let used = dir.capacity_bytes.saturating_sub(dir.available_bytes) as f64;
        let room = (dir.capacity_bytes - self.block_size_bytes) as f64;
        (used + 0.01) / room
    }
}
