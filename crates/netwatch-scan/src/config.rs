//! Configuration for the netwatch daemon.

use std::time::Duration;

use serde::Deserialize;

use netwatch_core::ChangeKind;
use netwatch_notify::DispatcherSettings;

/// Top-level watch configuration.
///
/// Loaded from the `netwatch.toml` `[watch]` section or `NETWATCH__`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// CIDR range to sweep. Empty means derive the local /24.
    #[serde(default)]
    pub range: String,

    /// Seconds between scan cycles.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Directory holding the device database.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// Maximum hosts enriched at once.
    #[serde(default = "default_max_enrichments")]
    pub max_concurrent_enrichments: usize,

    /// Maximum liveness probes in flight during discovery.
    #[serde(default = "default_discovery_concurrency")]
    pub discovery_concurrency: usize,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    #[serde(default)]
    pub notify: NotifyPolicy,

    #[serde(default = "default_notification_retention")]
    pub notification_retention_days: u32,

    #[serde(default = "default_history_retention")]
    pub history_retention_days: u32,

    /// Optional JSON file with extra vulnerability rules.
    #[serde(default)]
    pub vuln_rules_path: Option<String>,
}

/// Which change kinds are forwarded, and how the dispatcher behaves.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyPolicy {
    #[serde(default = "default_true")]
    pub new_devices: bool,

    #[serde(default = "default_true")]
    pub disconnected: bool,

    #[serde(default = "default_true")]
    pub port_changes: bool,

    /// Enables the webhook channel when set.
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_rate_limit")]
    pub rate_limit_secs: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl NotifyPolicy {
    pub fn allows(&self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::NewDevice => self.new_devices,
            ChangeKind::Disconnected => self.disconnected,
            ChangeKind::PortChange => self.port_changes,
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            min_interval: Duration::from_secs(self.rate_limit_secs),
            queue_capacity: self.queue_capacity,
        }
    }
}

impl WatchConfig {
    /// Load the `[watch]` section from `{file_prefix}.toml` (optional) and
    /// `NETWATCH__` environment variables. A missing section yields the
    /// defaults; a section that fails to deserialize is an error.
    pub fn load(file_prefix: &str) -> Result<Self, ::config::ConfigError> {
        let cfg = ::config::Config::builder()
            .add_source(::config::File::with_name(file_prefix).required(false))
            .add_source(
                ::config::Environment::with_prefix("NETWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        match cfg.get::<WatchConfig>("watch") {
            Ok(c) => Ok(c),
            Err(::config::ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

fn default_interval() -> u64 {
    60
}

fn default_store_dir() -> String {
    "./netwatch-data".to_string()
}

fn default_max_enrichments() -> usize {
    32
}

fn default_discovery_concurrency() -> usize {
    256
}

fn default_ping_timeout() -> u64 {
    1000
}

fn default_notification_retention() -> u32 {
    7
}

fn default_history_retention() -> u32 {
    90
}

fn default_rate_limit() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl Default for NotifyPolicy {
    fn default() -> Self {
        Self {
            new_devices: true,
            disconnected: true,
            port_changes: true,
            webhook_url: None,
            rate_limit_secs: default_rate_limit(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            range: String::new(),
            interval_secs: default_interval(),
            store_dir: default_store_dir(),
            max_concurrent_enrichments: default_max_enrichments(),
            discovery_concurrency: default_discovery_concurrency(),
            ping_timeout_ms: default_ping_timeout(),
            notify: NotifyPolicy::default(),
            notification_retention_days: default_notification_retention(),
            history_retention_days: default_history_retention(),
            vuln_rules_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WatchConfig::default();
        assert!(config.range.is_empty());
        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.max_concurrent_enrichments, 32);
        assert_eq!(config.discovery_concurrency, 256);
        assert_eq!(config.notification_retention_days, 7);
        assert_eq!(config.history_retention_days, 90);
        assert!(config.notify.port_changes);
        assert_eq!(config.notify.queue_capacity, 100);
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let json = r#"{"range": "10.0.0.0/24", "notify": {"disconnected": false}}"#;
        let config: WatchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.range, "10.0.0.0/24");
        assert_eq!(config.interval_secs, 60);
        assert!(!config.notify.disconnected);
        assert!(config.notify.new_devices);
        assert_eq!(config.notify.rate_limit_secs, 30);
    }

    #[test]
    fn test_policy_filters_by_kind() {
        let policy = NotifyPolicy {
            port_changes: false,
            ..Default::default()
        };
        assert!(policy.allows(ChangeKind::NewDevice));
        assert!(policy.allows(ChangeKind::Disconnected));
        assert!(!policy.allows(ChangeKind::PortChange));
    }

    #[test]
    fn test_dispatcher_settings() {
        let policy = NotifyPolicy {
            rate_limit_secs: 5,
            queue_capacity: 8,
            ..Default::default()
        };
        let settings = policy.dispatcher_settings();
        assert_eq!(settings.min_interval, Duration::from_secs(5));
        assert_eq!(settings.queue_capacity, 8);
    }

    #[test]
    fn test_load_reads_watch_section() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("netwatch.toml"),
            "[watch]\nrange = \"10.1.0.0/24\"\ninterval_secs = 15\n",
        )
        .unwrap();

        let prefix = dir.path().join("netwatch");
        let config = WatchConfig::load(prefix.to_str().unwrap()).unwrap();
        assert_eq!(config.range, "10.1.0.0/24");
        assert_eq!(config.interval_secs, 15);
        assert_eq!(config.max_concurrent_enrichments, 32);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("absent");
        let config = WatchConfig::load(prefix.to_str().unwrap()).unwrap();
        assert_eq!(config.interval_secs, 60);
        assert!(config.range.is_empty());
    }

    #[test]
    fn test_load_rejects_mistyped_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("netwatch.toml"),
            "[watch]\nrange = \"10.1.0.0/24\"\ninterval_secs = \"soon\"\n",
        )
        .unwrap();

        let prefix = dir.path().join("netwatch");
        assert!(WatchConfig::load(prefix.to_str().unwrap()).is_err());
    }
}
