//! Worker configuration.
//!
//! Loaded from defaults, an optional TOML file and `TIERLINK_`-prefixed
//! environment variables, later sources overriding earlier ones. Nested keys
//! use a double underscore: `TIERLINK_HEARTBEAT__INTERVAL_MS=500`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;
use tierlink_core::Transport;
use tierlink_proto::{ConfigProperty, WorkerNetAddress};

use crate::retry::RetryPolicy;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration.
    #[error("configuration error: {0}")]
    Parse(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Complete worker configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the worker advertises.
    pub worker: WorkerSettings,
    /// Where the coordinator listens.
    pub coordinator: CoordinatorSettings,
    /// Authentication with the coordinator.
    pub auth: AuthSettings,
    /// Periodic inventory reports.
    pub heartbeat: HeartbeatSettings,
    /// One-time registration.
    pub register: RegisterSettings,
    /// Retry discipline for coordinator calls.
    pub retry: RetrySettings,
    /// Local block storage.
    pub storage: StorageSettings,
}

impl WorkerConfig {
    /// Loads configuration from file and environment.
    ///
    /// Sources in order (later overrides earlier):
    /// 1. Default values
    /// 2. `tierlink.toml` in the current directory (if present)
    /// 3. The given file (if provided)
    /// 4. Environment variables with the `TIERLINK_` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Toml::file("tierlink.toml"));
        if let Some(p) = path {
            figment = figment.merge(Toml::file(p));
        }
        Self::extract(figment.merge(Env::prefixed("TIERLINK_").split("__")))
    }

    /// Extracts and validates configuration from `figment`.
    pub fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values the worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cutoff = self.storage.reviewer_cutoff;
        if !(cutoff > 0.0 && cutoff <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "storage.reviewer_cutoff must be in (0, 1], got {cutoff}"
            )));
        }
        if self.storage.block_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "storage.block_size_bytes must be positive".into(),
            ));
        }
        if self.storage.tiers.is_empty() {
            return Err(ConfigError::Invalid(
                "storage.tiers must name at least one tier".into(),
            ));
        }
        for tier in &self.storage.tiers {
            if tier.alias.is_empty() {
                return Err(ConfigError::Invalid("storage tier without alias".into()));
            }
            if tier.dirs.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "storage tier {} has no directories",
                    tier.alias
                )));
            }
        }
        if self.register.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "register.chunk_size must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be positive".into(),
            ));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_ms must be positive".into(),
            ));
        }
        if self.heartbeat.max_report_blocks == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.max_report_blocks must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Properties reported to the coordinator at registration.
    ///
    /// The password is never reported.
    #[must_use]
    pub fn config_properties(&self) -> Vec<ConfigProperty> {
        let property = |name: &str, value: String| ConfigProperty {
            name: name.to_owned(),
            source: "worker".to_owned(),
            value: Some(value),
        };
        vec![
            property("worker.host", self.worker.host.clone()),
            property("coordinator.transport", self.coordinator.transport.to_string()),
            property("auth.enabled", self.auth.enabled.to_string()),
            property("auth.scheme", self.auth.scheme.clone()),
            property("heartbeat.interval_ms", self.heartbeat.interval_ms.to_string()),
            property("register.chunk_size", self.register.chunk_size.to_string()),
            property("storage.block_size_bytes", self.storage.block_size_bytes.to_string()),
            property("storage.reviewer_cutoff", self.storage.reviewer_cutoff.to_string()),
        ]
    }
}

/// Address the worker advertises to the coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub host: String,
    pub rpc_port: u16,
    pub data_port: u16,
    pub web_port: u16,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            rpc_port: 29998,
            data_port: 29999,
            web_port: 30000,
        }
    }
}

impl WorkerSettings {
    /// Wire form of the advertised address.
    #[must_use]
    pub fn address(&self) -> WorkerNetAddress {
        WorkerNetAddress {
            host: self.host.clone(),
            rpc_port: self.rpc_port,
            data_port: self.data_port,
            web_port: self.web_port,
        }
    }
}

/// Coordinator endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Transport to connect with.
    pub transport: Transport,
    /// Bound on establishing the connection.
    pub connect_timeout_ms: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            transport: Transport::tcp(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                tierlink_proto::ports::COORDINATOR,
            )),
            connect_timeout_ms: 5_000,
        }
    }
}

impl CoordinatorSettings {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Whether to authenticate at all.
    pub enabled: bool,
    /// Mechanism name.
    pub scheme: String,
    pub username: String,
    pub password: String,
    /// Bound on the handshake.
    pub handshake_timeout_ms: u64,
    /// Proceed unauthenticated if the coordinator has authentication disabled.
    pub allow_disabled: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            scheme: tierlink_auth::PLAIN.to_owned(),
            username: "tierlink".to_owned(),
            password: String::new(),
            handshake_timeout_ms: 30_000,
            allow_disabled: true,
        }
    }
}

impl AuthSettings {
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// Time between heartbeats.
    pub interval_ms: u64,
    /// Deadline of a single heartbeat call.
    pub rpc_timeout_ms: u64,
    /// Most added plus removed block ids one heartbeat carries. The rest
    /// wait for the next beat.
    pub max_report_blocks: usize,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            rpc_timeout_ms: 60_000,
            max_report_blocks: 100_000,
        }
    }
}

impl HeartbeatSettings {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Registration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegisterSettings {
    /// Bound on the whole registration stream.
    pub timeout_secs: u64,
    /// Maximum block ids per chunk.
    pub chunk_size: usize,
}

impl Default for RegisterSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            chunk_size: 1_000,
        }
    }
}

impl RegisterSettings {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retry settings for coordinator calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_ms: 50,
            max_backoff_ms: 3_000,
        }
    }
}

impl RetrySettings {
    /// Policy described by these settings.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Local block storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Default block size, used by the allocation reviewer.
    pub block_size_bytes: u64,
    /// Fraction of a directory's capacity below which placement becomes
    /// probabilistic.
    pub reviewer_cutoff: f64,
    /// Tiers from fastest to slowest.
    pub tiers: Vec<TierSettings>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            block_size_bytes: 64 * 1024 * 1024,
            reviewer_cutoff: 0.1,
            tiers: vec![TierSettings {
                alias: "MEM".to_owned(),
                medium_type: "MEM".to_owned(),
                dirs: vec![PathBuf::from("/tmp/tierlink/ramdisk")],
                dir_capacity_bytes: 1024 * 1024 * 1024,
            }],
        }
    }
}

/// One storage tier.
#[derive(Debug, Clone, Deserialize)]
pub struct TierSettings {
    /// Tier alias, e.g. `MEM` or `SSD`.
    pub alias: String,
    /// Medium type of the tier's directories.
    pub medium_type: String,
    /// Directories holding the tier's blocks.
    pub dirs: Vec<PathBuf>,
    /// Capacity of each directory.
    pub dir_capacity_bytes: u64,
}
