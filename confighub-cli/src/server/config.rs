use std::env;
use std::time::Duration;

use chrono::{DateTime, Utc};
use confighub_lib::gray::validate_ip_pattern;
use confighub_lib::{AccessKey, Capability, Permissions};
use serde::Deserialize;

/// Top-level confighub.toml configuration
#[derive(Debug, Deserialize, Default)]
pub struct ConfigHubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub access_keys: Vec<AccessKeyConfig>,
    /// Problems found while loading, reported once logging is up.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage")]
    pub storage: StorageBackend,
    /// Accept requests that carry an access key but no signature.
    #[serde(default)]
    pub allow_unsigned: bool,
    /// Peers whose `X-Forwarded-For` header is believed: exact addresses,
    /// CIDR blocks or dotted wildcards. Empty means the header is ignored.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sled,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Sled => "sled",
            StorageBackend::Memory => "memory",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "sled" => Some(StorageBackend::Sled),
            "memory" => Some(StorageBackend::Memory),
            _ => None,
        }
    }
}

/// Long poll timeouts, in seconds.
#[derive(Debug, Deserialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_watch_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_watch_timeout")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_min_watch_timeout")]
    pub min_timeout_secs: u64,
}

impl WatchConfig {
    /// The wait to apply for a requested timeout.
    pub fn timeout_for(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs
            .unwrap_or(self.default_timeout_secs)
            .min(self.max_timeout_secs)
            .max(self.min_timeout_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// An `[[access_keys]]` entry seeded into the key registry at startup.
#[derive(Debug, Deserialize, Clone)]
pub struct AccessKeyConfig {
    pub access_key: String,
    pub secret: String,
    #[serde(default)]
    pub name: String,
    pub project: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl From<AccessKeyConfig> for AccessKey {
    fn from(c: AccessKeyConfig) -> Self {
        AccessKey {
            access_key: c.access_key,
            secret: c.secret,
            name: c.name,
            project: c.project,
            permissions: Permissions::from_capabilities(&c.capabilities),
            ip_whitelist: c.ip_whitelist,
            expires_at: c.expires_at,
            active: c.active,
        }
    }
}

// ── Default value functions ──────────────────────────

fn default_port() -> u16 {
    8080
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_storage() -> StorageBackend {
    StorageBackend::Sled
}

fn default_watch_timeout() -> u64 {
    30
}

fn default_max_watch_timeout() -> u64 {
    60
}

fn default_min_watch_timeout() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_active() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            hostname: default_hostname(),
            data_dir: default_data_dir(),
            storage: default_storage(),
            allow_unsigned: false,
            trusted_proxies: Vec::new(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_watch_timeout(),
            max_timeout_secs: default_max_watch_timeout(),
            min_timeout_secs: default_min_watch_timeout(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ConfigHubConfig {
    /// Load configuration from a TOML file, falling back to defaults if the file
    /// doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(path, &content),
            Err(_) => Self::default(),
        }
    }

    fn parse(path: &str, content: &str) -> Self {
        match toml::from_str::<Self>(content) {
            Ok(mut config) => {
                config.drop_bad_proxies();
                config
            }
            Err(e) => Self {
                warnings: vec![format!("failed to parse {}: {}", path, e)],
                ..Self::default()
            },
        }
    }

    /// Discard trusted proxy entries that are not valid address patterns.
    fn drop_bad_proxies(&mut self) {
        let warnings = &mut self.warnings;
        self.server.trusted_proxies.retain(|pattern| {
            match validate_ip_pattern(pattern) {
                Ok(()) => true,
                Err(e) => {
                    warnings.push(format!("ignoring trusted proxy {}: {}", pattern, e));
                    false
                }
            }
        });
    }

    /// Apply CONFIGHUB_* environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("CONFIGHUB_PORT") {
            match val.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => self
                    .warnings
                    .push(format!("invalid CONFIGHUB_PORT value: {}", val)),
            }
        }

        if let Some(val) = var("CONFIGHUB_HOSTNAME") {
            self.server.hostname = val;
        }

        if let Some(val) = var("CONFIGHUB_DATA_DIR") {
            self.server.data_dir = val;
        }

        if let Some(val) = var("CONFIGHUB_STORAGE") {
            match StorageBackend::parse(&val) {
                Some(storage) => self.server.storage = storage,
                None => self
                    .warnings
                    .push(format!("unknown CONFIGHUB_STORAGE value: {}", val)),
            }
        }

        if let Some(val) = var("CONFIGHUB_ALLOW_UNSIGNED") {
            self.server.allow_unsigned = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(val) = var("CONFIGHUB_TRUSTED_PROXIES") {
            self.server.trusted_proxies = val
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            self.drop_bad_proxies();
        }

        if let Some(val) = var("CONFIGHUB_LOG_LEVEL") {
            self.log.level = val;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let config = ConfigHubConfig::load("/nonexistent/confighub.toml");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.storage, StorageBackend::Sled);
        assert!(!config.server.allow_unsigned);
        assert_eq!(config.watch.default_timeout_secs, 30);
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn parses_full_file() {
        let config = ConfigHubConfig::parse(
            "confighub.toml",
            r#"
[server]
port = 9000
storage = "memory"
allow_unsigned = true

[watch]
default_timeout_secs = 20

[log]
level = "debug"

[[access_keys]]
access_key = "ak_ci"
secret = "s3cr3t"
project = "shop"
capabilities = ["read", "write"]
ip_whitelist = ["10.0.0.0/8"]
"#,
        );
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.storage, StorageBackend::Memory);
        assert!(config.server.allow_unsigned);
        assert_eq!(config.watch.default_timeout_secs, 20);
        assert_eq!(config.watch.max_timeout_secs, 60);
        assert_eq!(config.log.level, "debug");

        let key: AccessKey = config.access_keys[0].clone().into();
        assert!(key.permissions.read && key.permissions.write);
        assert!(!key.permissions.admin);
        assert!(key.active);
    }

    #[test]
    fn broken_file_falls_back_with_warning() {
        let config = ConfigHubConfig::parse("confighub.toml", "[server\nport = ");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.warnings.len(), 1);
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("CONFIGHUB_PORT", "7000"),
            ("CONFIGHUB_STORAGE", "memory"),
            ("CONFIGHUB_ALLOW_UNSIGNED", "true"),
            ("CONFIGHUB_LOG_LEVEL", "warn"),
        ]
        .into_iter()
        .collect();
        let mut config = ConfigHubConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.storage, StorageBackend::Memory);
        assert!(config.server.allow_unsigned);
        assert_eq!(config.log.level, "warn");
        assert_eq!(config.server.hostname, "0.0.0.0");
        assert!(config.server.trusted_proxies.is_empty());
    }

    #[test]
    fn trusted_proxies_from_file_and_env() {
        let mut config = ConfigHubConfig::parse(
            "confighub.toml",
            r#"
[server]
trusted_proxies = ["10.0.0.0/8", "not-an-address"]
"#,
        );
        assert_eq!(config.server.trusted_proxies, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(config.warnings.len(), 1);

        config.apply_overrides(|name| match name {
            "CONFIGHUB_TRUSTED_PROXIES" => Some("127.0.0.1, 172.16.0.0/12,".to_string()),
            _ => None,
        });
        assert_eq!(
            config.server.trusted_proxies,
            vec!["127.0.0.1".to_string(), "172.16.0.0/12".to_string()]
        );
    }

    #[test]
    fn bad_env_values_are_reported() {
        let mut config = ConfigHubConfig::default();
        config.apply_overrides(|name| match name {
            "CONFIGHUB_PORT" => Some("eighty".to_string()),
            "CONFIGHUB_STORAGE" => Some("postgres".to_string()),
            _ => None,
        });
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.warnings.len(), 2);
    }

    #[test]
    fn watch_timeout_is_clamped() {
        let watch = WatchConfig::default();
        assert_eq!(watch.timeout_for(None), Duration::from_secs(30));
        assert_eq!(watch.timeout_for(Some(600)), Duration::from_secs(60));
        assert_eq!(watch.timeout_for(Some(0)), Duration::from_secs(1));
        assert_eq!(watch.timeout_for(Some(5)), Duration::from_secs(5));
    }
}
