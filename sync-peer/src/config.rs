//! Configuration for a cardsync node.
//!
//! Configuration is loaded from a TOML file. Every field is optional and
//! falls back to the default shown in its documentation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cardsync_core::{ConflictPolicy, NameHints};
use cardsync_types::{Role, SERVICE_TYPE};
use serde::{Deserialize, Serialize};

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name shown to peers (default: "cardsync device").
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Whether this node advertises (`server`) or browses (`client`)
    /// (default: client).
    #[serde(default = "default_role")]
    pub role: Role,
    /// Discovery service type (default: "memoread-sync").
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Seconds an invitation stays open (default: 10).
    #[serde(default = "default_invite_timeout_secs")]
    pub invite_timeout_secs: u64,
    /// Milliseconds between health reconciliation passes (default: 2000).
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    /// Ordering of conflicting updates (default: arrival_order).
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Largest inline image accepted for sending, in bytes; 0 disables the
    /// check (default: 4 MiB).
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
    /// UI event channel capacity (default: 256).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Name fragments marking a legacy server (default: ["Mac"]).
    #[serde(default = "default_server_name_hints")]
    pub server_name_hints: Vec<String>,
    /// Name fragments marking a legacy client (default: ["iPhone", "iPad"]).
    #[serde(default = "default_client_name_hints")]
    pub client_name_hints: Vec<String>,
}

// Default value functions
fn default_device_name() -> String {
    "cardsync device".to_string()
}

fn default_role() -> Role {
    Role::Client
}

fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}

fn default_invite_timeout_secs() -> u64 {
    10
}

fn default_health_interval_ms() -> u64 {
    2000
}

fn default_max_image_bytes() -> usize {
    4 * 1024 * 1024 // 4 MiB
}

fn default_event_capacity() -> usize {
    256
}

fn default_server_name_hints() -> Vec<String> {
    NameHints::default().server
}

fn default_client_name_hints() -> Vec<String> {
    NameHints::default().client
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            role: default_role(),
            service_type: default_service_type(),
            invite_timeout_secs: default_invite_timeout_secs(),
            health_interval_ms: default_health_interval_ms(),
            conflict_policy: ConflictPolicy::default(),
            max_image_bytes: default_max_image_bytes(),
            event_capacity: default_event_capacity(),
            server_name_hints: default_server_name_hints(),
            client_name_hints: default_client_name_hints(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    /// Reject values the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.trim().is_empty() {
            return Err(ConfigError::Invalid("device_name must not be empty".into()));
        }
        if self.service_type.is_empty() {
            return Err(ConfigError::Invalid("service_type must not be empty".into()));
        }
        if self.invite_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "invite_timeout_secs must be positive".into(),
            ));
        }
        if self.health_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "health_interval_ms must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive".into()));
        }
        Ok(())
    }

    /// Set the device name.
    pub fn with_device_name(mut self, name: &str) -> Self {
        self.device_name = name.to_string();
        self
    }

    /// Set the role.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Set the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Set the health reconciliation interval.
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval_ms = interval.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    /// Set the invitation timeout.
    pub fn with_invite_timeout(mut self, timeout: Duration) -> Self {
        self.invite_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the inline image ceiling (0 disables it).
    pub fn with_max_image_bytes(mut self, bytes: usize) -> Self {
        self.max_image_bytes = bytes;
        self
    }

    /// Invitation timeout.
    pub fn invite_timeout(&self) -> Duration {
        Duration::from_secs(self.invite_timeout_secs)
    }

    /// Health reconciliation interval.
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    /// Inline image ceiling, if enabled.
    pub fn image_limit(&self) -> Option<usize> {
        (self.max_image_bytes > 0).then_some(self.max_image_bytes)
    }

    /// Display-name hints for legacy peers.
    pub fn name_hints(&self) -> NameHints {
        NameHints {
            server: self.server_name_hints.clone(),
            client: self.client_name_hints.clone(),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Failed to render configuration.
    #[error("failed to serialize config: {0}")]
    SerializeError(toml::ser::Error),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.service_type, "memoread-sync");
        assert_eq!(config.invite_timeout(), Duration::from_secs(10));
        assert_eq!(config.health_interval(), Duration::from_secs(2));
        assert_eq!(config.conflict_policy, ConflictPolicy::ArrivalOrder);
        assert_eq!(config.image_limit(), Some(4 * 1024 * 1024));
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
device_name = "Studio Mac"
role = "server"
invite_timeout_secs = 30
health_interval_ms = 500
conflict_policy = "newest_message"
max_image_bytes = 0
server_name_hints = ["Desk"]
"#;

        let config: NodeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.device_name, "Studio Mac");
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.invite_timeout_secs, 30);
        assert_eq!(config.health_interval(), Duration::from_millis(500));
        assert_eq!(config.conflict_policy, ConflictPolicy::NewestMessage);
        assert_eq!(config.image_limit(), None);
        assert_eq!(config.name_hints().server, vec!["Desk".to_string()]);
        assert_eq!(config.name_hints().client, NameHints::default().client);
    }

    #[test]
    fn config_missing_fields_use_defaults() {
        let config: NodeConfig = toml::from_str("").unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn unknown_role_is_parse_error() {
        let result: Result<NodeConfig, _> = toml::from_str(r#"role = "relay""#);
        assert!(result.is_err());
    }

    #[test]
    fn from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "device_name = \"Alice's iPhone\"").unwrap();
        writeln!(file, "role = \"client\"").unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.device_name, "Alice's iPhone");
        assert_eq!(config.role, Role::Client);
    }

    #[test]
    fn from_file_rejects_zero_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "health_interval_ms = 0").unwrap();

        let result = NodeConfig::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_invite_timeout_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "invite_timeout_secs = 0").unwrap();

        let result = NodeConfig::from_file(file.path());
        assert!(matches!(result, Err(ConfigError::Invalid(msg)) if msg.contains("invite_timeout_secs")));
        assert!(NodeConfig::default()
            .with_invite_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn from_file_missing_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = NodeConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn toml_output_round_trips() {
        let config = NodeConfig::default()
            .with_device_name("desk")
            .with_role(Role::Server)
            .with_conflict_policy(ConflictPolicy::NewestMessage);

        let rendered = config.to_toml().unwrap();
        let parsed: NodeConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn builders_set_durations() {
        let config = NodeConfig::default()
            .with_health_interval(Duration::from_millis(20))
            .with_invite_timeout(Duration::from_secs(3));
        assert_eq!(config.health_interval_ms, 20);
        assert_eq!(config.invite_timeout_secs, 3);
    }
}
