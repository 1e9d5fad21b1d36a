//! Controller manager configuration.
//!
//! Loaded once at start: built-in defaults, then an optional TOML file, then
//! environment overrides of the form `FLEETPLANE__SECTION__KEY`
//! (for example `FLEETPLANE__ALLOCATION__RETRY_BUDGET=16`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetplane_api::IntOrPercent;
use fleetplane_networking::PortRange;
use fleetplane_reconcile::BackoffPolicy;
use serde::Deserialize;

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "FLEETPLANE";

/// Separator for nested keys in environment variables.
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name this cluster answers to in allocation policies.
    pub cluster_name: String,

    pub listen_addr: SocketAddr,

    /// Fallback when `RUST_LOG` is unset.
    pub log_level: String,

    pub leader_election: LeaderElectionConfig,

    pub port_range: PortRange,

    pub allocation: AllocationConfig,

    pub autoscaler: AutoscalerConfig,

    pub rolling_update: RollingUpdateDefaults,

    /// Applied to templates that leave health settings at their defaults.
    pub health_check: HealthCheckDefaults,

    pub workers: WorkerConfig,

    pub sdk: SdkConfig,

    /// Failed pod creations before a game server is marked unhealthy.
    pub pod_create_retry_cap: u32,

    /// Time allowed for work queues to drain on shutdown.
    pub shutdown_grace_secs: u64,

    /// Period of the full resync that re-enqueues every object.
    pub resync_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: "local".to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            log_level: "info".to_string(),
            leader_election: LeaderElectionConfig::default(),
            port_range: PortRange::default(),
            allocation: AllocationConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            rolling_update: RollingUpdateDefaults::default(),
            health_check: HealthCheckDefaults::default(),
            workers: WorkerConfig::default(),
            sdk: SdkConfig::default(),
            pod_create_retry_cap: 5,
            shutdown_grace_secs: 10,
            resync_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub namespace: String,
    pub lease_name: String,
    /// Defaults to a fresh random identity per process.
    pub identity: Option<String>,
    pub lease_duration_secs: u32,
    pub renew_period_secs: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "fleetplane-system".to_string(),
            lease_name: "fleetplane-controller".to_string(),
            identity: None,
            lease_duration_secs: 15,
            renew_period_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Deadline for one allocation, local attempts and peers included.
    pub timeout_ms: u64,

    /// CAS conflicts tolerated before answering `Contention`.
    pub retry_budget: u32,

    pub peer_dial_timeout_ms: u64,

    /// Attempts per peer endpoint on transient transport errors.
    pub peer_retries: u32,

    /// Seed of the weighted shuffle inside a policy priority group. Unset
    /// means seeded from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_budget: 10,
            peer_dial_timeout_ms: 3_000,
            peer_retries: 3,
            rng_seed: None,
        }
    }
}

impl AllocationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn peer_dial_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_dial_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    /// Evaluation period when the autoscaler does not name one.
    pub sync_period_secs: u64,

    /// Minimum time between two writes to the same fleet's replicas.
    pub debounce_secs: u64,

    /// Minimum time between two event-driven evaluations of one autoscaler.
    pub min_kick_interval_ms: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            sync_period_secs: 30,
            debounce_secs: 0,
            min_kick_interval_ms: 1_000,
        }
    }
}

impl AutoscalerConfig {
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    pub fn min_kick_interval(&self) -> Duration {
        Duration::from_millis(self.min_kick_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RollingUpdateDefaults {
    pub max_surge: IntOrPercent,
    pub max_unavailable: IntOrPercent,
}

impl Default for RollingUpdateDefaults {
    fn default() -> Self {
        Self {
            max_surge: IntOrPercent::Percent(25),
            max_unavailable: IntOrPercent::Percent(25),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HealthCheckDefaults {
    pub initial_delay_secs: u32,
    pub period_secs: u32,
    pub failure_threshold: u32,
}

impl Default for HealthCheckDefaults {
    fn default() -> Self {
        Self {
            initial_delay_secs: 5,
            period_secs: 5,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub game_servers: usize,
    pub game_server_sets: usize,
    pub fleets: usize,
    pub autoscalers: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            game_servers: 8,
            game_server_sets: 4,
            fleets: 2,
            autoscalers: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub socket_path: PathBuf,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/fleetplane/sdk.sock"),
        }
    }
}

impl Config {
    /// Load defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Backoff between pod creation retries of one game server.
    pub fn pod_create_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(Duration::from_millis(500), Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_load_without_sources() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.cluster_name, "local");
        assert_eq!(config.port_range.min(), 7000);
        assert_eq!(config.allocation.retry_budget, 10);
        assert_eq!(config.rolling_update.max_surge, IntOrPercent::Percent(25));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = std::env::temp_dir().join(format!("fleetplane-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("controller.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
cluster_name = "eu-west"
port_range = "9000-9100"

[allocation]
retry_budget = 3
rng_seed = 42

[rolling_update]
max_surge = 2
max_unavailable = "10%"
"#
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.cluster_name, "eu-west");
        assert_eq!((config.port_range.min(), config.port_range.max()), (9000, 9100));
        assert_eq!(config.allocation.retry_budget, 3);
        assert_eq!(config.allocation.rng_seed, Some(42));
        assert_eq!(config.allocation.timeout_ms, 10_000);
        assert_eq!(config.rolling_update.max_surge, IntOrPercent::Int(2));
        assert_eq!(config.rolling_update.max_unavailable, IntOrPercent::Percent(10));
        std::fs::remove_dir_all(&dir).ok();
    }
}
