//! `ProxyConfig` / `ServerConfig`. JSON-sourced, with `#[serde(default)]`
//! field defaults in the shape of
//! `crates/codex/src/mcp/config.rs::McpServerDefinition` (that one is
//! TOML-backed; this config layer is JSON).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_response_timeout() -> DurationSecs {
    DurationSecs(Duration::from_secs(30))
}

fn default_startup_timeout() -> DurationSecs {
    DurationSecs(Duration::from_secs(20))
}

fn default_shutdown_grace() -> DurationSecs {
    DurationSecs(Duration::from_secs(3))
}

fn default_healthcheck_timeout() -> DurationSecs {
    DurationSecs(Duration::from_secs(5))
}

fn default_id_separator() -> String {
    "::".to_string()
}

/// Wrapper so `ServerConfig`/`ProxyConfig` can declare duration fields as
/// plain seconds in JSON while storing a `std::time::Duration` internally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DurationSecs(pub Duration);

impl Serialize for DurationSecs {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(self.0.as_secs())
    }
}

impl<'de> Deserialize<'de> for DurationSecs {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(DurationSecs(Duration::from_secs(secs)))
    }
}

/// Wire convention an upstream (or the proxy's own client connection)
/// expects over stdio.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioModeConfig {
    #[default]
    Auto,
    Header,
    Newline,
}

impl From<StdioModeConfig> for crate::frame::StdioMode {
    fn from(value: StdioModeConfig) -> Self {
        match value {
            StdioModeConfig::Auto => crate::frame::StdioMode::Auto,
            StdioModeConfig::Header => crate::frame::StdioMode::Header,
            StdioModeConfig::Newline => crate::frame::StdioMode::Newline,
        }
    }
}

/// One configured upstream MCP server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique namespace token. Must not contain `ProxyConfig.id_separator`.
    pub id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: DurationSecs,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: DurationSecs,
    #[serde(default)]
    pub stdio_mode: StdioModeConfig,
}

/// Top-level proxy configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_response_timeout")]
    pub response_timeout: DurationSecs,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
    #[serde(default)]
    pub structured_logging: bool,
    /// Seconds between health probes; 0 disables the health loop.
    #[serde(default)]
    pub healthcheck_interval: u64,
    #[serde(default = "default_healthcheck_timeout")]
    pub healthcheck_timeout: DurationSecs,
    /// Separator between `serverId` and the original tool/prompt name.
    /// A per-deployment setting: some clients' identifier grammars forbid
    /// `:`, so `__` is a common alternative to the `::` default.
    #[serde(default = "default_id_separator")]
    pub id_separator: String,
    #[serde(default)]
    pub stdio_mode: StdioModeConfig,
    pub servers: Vec<ServerConfig>,
}

impl ProxyConfig {
    /// Validate cross-field invariants: unique, non-empty, separator-free
    /// server IDs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id_separator.is_empty() || self.id_separator.contains('/') {
            return Err(ConfigError::Validation(format!(
                "id_separator `{}` must be non-empty and must not contain '/'",
                self.id_separator
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() {
                return Err(ConfigError::Validation(
                    "server id must not be empty".to_string(),
                ));
            }
            if server.id.contains(&self.id_separator) {
                return Err(ConfigError::Validation(format!(
                    "server id `{}` must not contain the configured separator `{}`",
                    server.id, self.id_separator
                )));
            }
            if server.command.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "server `{}` has an empty command",
                    server.id
                )));
            }
            if !seen.insert(server.id.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate server id `{}`",
                    server.id
                )));
            }
        }
        Ok(())
    }
}

/// Parse and validate a `ProxyConfig` from a JSON file on disk. Unknown
/// top-level keys are accepted and logged as a warning via [`load_from_str`].
pub fn load_from_path(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_from_str(&text, &path.display().to_string())
}

pub fn load_from_str(text: &str, path_label: &str) -> Result<ProxyConfig, ConfigError> {
    warn_on_unknown_keys(text, path_label);
    let config: ProxyConfig = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
        path: path_label.to_string(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "log_level",
    "response_timeout",
    "auth_token",
    "rate_limit_per_minute",
    "structured_logging",
    "healthcheck_interval",
    "healthcheck_timeout",
    "id_separator",
    "stdio_mode",
    "servers",
];

fn warn_on_unknown_keys(text: &str, path_label: &str) {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(text)
    else {
        return;
    };
    for key in map.keys() {
        if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
            tracing::warn!(config = %path_label, key = %key, "ignoring unknown configuration key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{"servers":[{"id":"echo","command":["echo-mcp"]}]}"#
    }

    #[test]
    fn defaults_are_applied() {
        let config = load_from_str(minimal_json(), "test").unwrap();
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.response_timeout.0, Duration::from_secs(30));
        assert_eq!(config.id_separator, "::");
        assert!(!config.structured_logging);
        assert_eq!(config.healthcheck_interval, 0);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let json = r#"{"servers":[
            {"id":"a","command":["x"]},
            {"id":"a","command":["y"]}
        ]}"#;
        assert!(matches!(
            load_from_str(json, "test"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn rejects_id_containing_separator() {
        let json = r#"{"servers":[{"id":"a::b","command":["x"]}]}"#;
        assert!(matches!(
            load_from_str(json, "test"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn rejects_empty_command() {
        let json = r#"{"servers":[{"id":"a","command":[]}]}"#;
        assert!(matches!(
            load_from_str(json, "test"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn accepts_custom_separator() {
        let json = r#"{"id_separator":"__","servers":[{"id":"a","command":["x"]}]}"#;
        let config = load_from_str(json, "test").unwrap();
        assert_eq!(config.id_separator, "__");
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            load_from_str("{not json", "test"),
            Err(ConfigError::Parse { .. })
        ));
    }
}
