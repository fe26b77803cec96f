//! # Configuration
//!
//! TOML configuration for the mesh manager: the radio session endpoint,
//! the on-disk store location, the two schedulers, and the auto-reply
//! engines. Everything here maps onto the settings-store keys in spec
//! §6 — at startup the file seeds the settings store (see
//! [`crate::store::MeshStore::get_setting`]); runtime changes to the
//! scheduler keys go through [`crate::manager::ManagerHandle::update_scheduler_config`],
//! which restarts the affected scheduler tasks rather than mutating this
//! struct in place (§3 "Mutated only by configuration API; schedulers
//! restart on change").
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshmgrd::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshmgrd.toml").await?;
//!     println!("radio at {}:{}", config.session.host, config.session.port);
//!     Config::create_default("meshmgrd.toml").await?;
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub autoack: AutoAckConfig,
    pub autowelcome: AutoWelcomeConfig,
    pub limits: LimitsConfig,
    pub packet_log: PacketLogConfig,
    pub logging: LoggingConfig,
}

/// The radio TCP endpoint and the frame-level keepalive watchdog (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub stale_timeout_ms: u64,
}

/// Where the JSON store keeps its per-entity files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub traceroute: TracerouteSchedulerConfig,
    pub announce: AnnounceSchedulerConfig,
}

/// §4.11: minutes in 0..=60, 0 disables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerouteSchedulerConfig {
    pub interval_minutes: u32,
}

/// §4.12: interval mode (hours in [3,24]) or cron mode, mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnounceMode {
    Interval,
    Cron,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceSchedulerConfig {
    /// `autoAnnounceEnabled` (§6): the scheduler is otherwise fully
    /// configured (a valid mode/interval/cron) but stays dormant until
    /// this is set.
    pub enabled: bool,
    pub mode: AnnounceMode,
    pub interval_hours: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    pub message: String,
    pub channel_index: i32,
    pub on_start: bool,
}

/// §4.10 auto-acknowledge reply engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoAckConfig {
    pub enabled: bool,
    pub regex: String,
    pub channels: Vec<i32>,
    pub direct_messages: bool,
    pub message: String,
    pub use_dm: bool,
}

/// §4.10 auto-welcome reply engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoWelcomeConfig {
    pub enabled: bool,
    pub wait_for_name: bool,
    pub message: String,
    pub target: WelcomeTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WelcomeTarget {
    Dm,
    Channel,
}

/// `{NODECOUNT}`/`{DIRECTCOUNT}` window and distance rendering for traceroute/templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_node_age_hours: u32,
    pub distance_unit: DistanceUnit,
}

/// §4.3.3: "Every packet is logged to the packet-log store (when enabled)".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketLogConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceUnit {
    #[default]
    Km,
    Mi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file.
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Validate the ranges spec.md calls out explicitly (§4.11, §4.12).
    pub fn validate(&self) -> Result<()> {
        Config::validate_scheduler(&self.scheduler)
    }

    /// Same checks as [`Config::validate`], scoped to just the scheduler
    /// section — the part of the config the manager's configuration API
    /// (§3 "Mutated only by configuration API") can change at runtime.
    /// Rejected before applying; on rejection the active scheduler is
    /// left exactly as it was (§7 "invalid configuration... scheduler
    /// unchanged").
    pub fn validate_scheduler(scheduler: &SchedulerConfig) -> Result<()> {
        if scheduler.traceroute.interval_minutes > 60 {
            return Err(anyhow!("scheduler.traceroute.interval_minutes must be 0..=60"));
        }
        match scheduler.announce.mode {
            AnnounceMode::Interval => {
                let hours = scheduler.announce.interval_hours;
                if !(3..=24).contains(&hours) {
                    return Err(anyhow!("scheduler.announce.interval_hours must be 3..=24"));
                }
            }
            AnnounceMode::Cron => {
                let expr = scheduler
                    .announce
                    .cron
                    .as_deref()
                    .ok_or_else(|| anyhow!("scheduler.announce.cron is required in cron mode"))?;
                expr.parse::<cron::Schedule>()
                    .map_err(|e| anyhow!("invalid cron expression {:?}: {}", expr, e))?;
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            session: SessionConfig {
                host: "127.0.0.1".to_string(),
                port: 4403,
                stale_timeout_ms: 120_000,
            },
            store: StoreConfig {
                data_dir: "./data".to_string(),
            },
            scheduler: SchedulerConfig {
                traceroute: TracerouteSchedulerConfig {
                    interval_minutes: 30,
                },
                announce: AnnounceSchedulerConfig {
                    enabled: false,
                    mode: AnnounceMode::Interval,
                    interval_hours: 6,
                    cron: None,
                    message: "{FEATURES} {NODECOUNT} nodes seen, {DIRECTCOUNT} direct. Up {DURATION}.".to_string(),
                    channel_index: 0,
                    on_start: false,
                },
            },
            autoack: AutoAckConfig {
                enabled: false,
                regex: "^(test|ping)".to_string(),
                channels: vec![0],
                direct_messages: false,
                message: "Got it, {NODE_ID} — {NUMBER_HOPS} hops.".to_string(),
                use_dm: false,
            },
            autowelcome: AutoWelcomeConfig {
                enabled: false,
                wait_for_name: true,
                message: "Welcome to the mesh, {LONG_NAME}!".to_string(),
                target: WelcomeTarget::Channel,
            },
            limits: LimitsConfig {
                max_node_age_hours: 24,
                distance_unit: DistanceUnit::Km,
            },
            packet_log: PacketLogConfig { enabled: true },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().expect("default config must be valid");
    }

    #[test]
    fn rejects_out_of_range_traceroute_interval() {
        let mut config = Config::default();
        config.scheduler.traceroute.interval_minutes = 61;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_announce_interval_outside_3_24() {
        let mut config = Config::default();
        config.scheduler.announce.interval_hours = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_cron_expression() {
        let mut config = Config::default();
        config.scheduler.announce.mode = AnnounceMode::Cron;
        config.scheduler.announce.cron = Some("not a cron expr".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_valid_cron_expression() {
        let mut config = Config::default();
        config.scheduler.announce.mode = AnnounceMode::Cron;
        config.scheduler.announce.cron = Some("0 0 */6 * * *".to_string());
        assert!(config.validate().is_ok());
    }
}
