//! Agent configuration – reads the `fleetlink` TOML file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use fleetlink_middleware::{AgentConfig, Timeouts};
use fleetlink_types::Endpoint;
use serde::{Deserialize, Serialize};

/// Console log output style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other:?} (expected \"compact\" or \"json\")")),
        }
    }
}

/// One `[roster]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub address: String,
    pub port: u16,
}

/// One `[[subscriptions]]` entry: a topic this vehicle listens on, with an
/// optional payload to publish back whenever a message arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of this vehicle in the fleet.
    pub identity: String,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// `0` lets the OS choose.
    #[serde(default)]
    pub listen_port: u16,

    /// Seconds between self re-announces.  `0` disables them.
    #[serde(default)]
    pub reannounce_interval_secs: u64,

    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Known vehicles, by name.
    #[serde(default)]
    pub roster: BTreeMap<String, RosterEntry>,

    /// Known remote subscribers, by topic.
    #[serde(default)]
    pub topics: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}
fn default_timeout_ms() -> u64 {
    3000
}

impl Config {
    /// Parse a config document.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let cfg: Config = toml::from_str(raw).map_err(|e| format!("Failed to parse config: {}", e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), String> {
        if self.identity.trim().is_empty() {
            return Err("identity must not be empty".to_string());
        }
        if self.listen_address.trim().is_empty() {
            return Err("listen_address must not be empty".to_string());
        }
        if let Some(sub) = self.subscriptions.iter().find(|s| s.topic.trim().is_empty()) {
            return Err(format!("subscription with empty topic (reply = {:?})", sub.reply));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            send: Duration::from_millis(self.send_timeout_ms),
            ..Timeouts::default()
        }
    }

    pub fn reannounce_interval(&self) -> Option<Duration> {
        (self.reannounce_interval_secs > 0).then(|| Duration::from_secs(self.reannounce_interval_secs))
    }

    /// Agent settings for [`fleetlink_middleware::FleetAgent::start`].
    ///
    /// Subscriptions are left out: they are registered after startup so
    /// that peers hear about them.
    pub fn agent_config(&self) -> AgentConfig {
        let mut agent = AgentConfig::new(
            self.identity.clone(),
            Endpoint::new(self.listen_address.clone(), self.listen_port),
        )
        .with_timeouts(self.timeouts());
        for (name, entry) in &self.roster {
            agent = agent.with_vehicle(name.clone(), Endpoint::new(entry.address.clone(), entry.port));
        }
        for (topic, vehicles) in &self.topics {
            for vehicle in vehicles {
                agent = agent.with_subscriber(topic.clone(), vehicle.clone());
            }
        }
        agent
    }
}

/// Load the config at `path` and apply `FLEETLINK_*` overrides.
pub fn load(path: &Path) -> Result<Config, String> {
    let mut cfg = load_from(path)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Load the config from a specific path, without environment overrides.
pub(crate) fn load_from(path: &Path) -> Result<Config, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    Config::parse(&raw)
}

/// Apply `FLEETLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLEETLINK_IDENTITY` | `identity` |
/// | `FLEETLINK_LISTEN_ADDRESS` | `listen_address` |
/// | `FLEETLINK_LISTEN_PORT` | `listen_port` |
/// | `FLEETLINK_LOG_FORMAT` | `log_format` |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

/// Extracted for testability without mutating environment variables.
pub(crate) fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("FLEETLINK_IDENTITY") {
        cfg.identity = v;
    }
    if let Some(v) = lookup("FLEETLINK_LISTEN_ADDRESS") {
        cfg.listen_address = v;
    }
    if let Some(port) = lookup("FLEETLINK_LISTEN_PORT").and_then(|v| v.parse::<u16>().ok()) {
        cfg.listen_port = port;
    }
    if let Some(format) = lookup("FLEETLINK_LOG_FORMAT").and_then(|v| v.parse::<LogFormat>().ok()) {
        cfg.log_format = format;
    }
}
