//! chunkflow.toml configuration parser.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below. Durations are written as strings ("5s", "500ms", "2m").

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkflowConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub decoder: DecoderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Time allowed for a client to send a complete request head.
    pub header_read_timeout: String,
    /// Per-chunk write timeout; a peer that stops reading is disconnected.
    pub write_timeout: Option<String>,
    pub max_head_size: usize,
    pub max_request_body: usize,
    pub keep_alive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            header_read_timeout: "10s".to_string(),
            write_timeout: None,
            max_head_size: 16 * 1024,
            max_request_body: 1024 * 1024,
            keep_alive: true,
        }
    }
}

impl ServerConfig {
    pub fn header_read_timeout(&self) -> Duration {
        parse_duration(&self.header_read_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout.as_deref().and_then(parse_duration)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout: String,
    /// Maximum silence between body reads before the stream fails.
    pub read_timeout: Option<String>,
    pub write_timeout: Option<String>,
    /// Idle pooled connections older than this are closed instead of reused.
    pub idle_timeout: String,
    pub max_connections_per_host: usize,
    pub read_size: usize,
    pub max_head_size: usize,
    pub max_chunk_size: usize,
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: "5s".to_string(),
            read_timeout: Some("30s".to_string()),
            write_timeout: None,
            idle_timeout: "90s".to_string(),
            max_connections_per_host: 8,
            read_size: 16 * 1024,
            max_head_size: 16 * 1024,
            max_chunk_size: 1024 * 1024,
            user_agent: concat!("chunkflow/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(5))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout.as_deref().and_then(parse_duration)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout.as_deref().and_then(parse_duration)
    }

    pub fn idle_timeout(&self) -> Duration {
        parse_duration(&self.idle_timeout).unwrap_or(Duration::from_secs(90))
    }
}

/// What must appear between consecutive top-level JSON values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Separator {
    /// Values may follow each other directly: `{"a":1}{"b":2}`.
    #[default]
    Optional,
    /// At least one whitespace byte between values.
    Whitespace,
    /// A newline between values (NDJSON).
    Newline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub separator: Separator,
    pub max_depth: usize,
    pub max_value_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            separator: Separator::Optional,
            max_depth: 128,
            max_value_size: 16 * 1024 * 1024,
        }
    }
}

impl ChunkflowConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ChunkflowConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the typed accessors would silently replace.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_duration("server.header_read_timeout", Some(&self.server.header_read_timeout))?;
        check_duration("server.write_timeout", self.server.write_timeout.as_ref())?;
        check_duration("client.connect_timeout", Some(&self.client.connect_timeout))?;
        check_duration("client.read_timeout", self.client.read_timeout.as_ref())?;
        check_duration("client.write_timeout", self.client.write_timeout.as_ref())?;
        check_duration("client.idle_timeout", Some(&self.client.idle_timeout))?;

        check_positive("server.max_head_size", self.server.max_head_size)?;
        check_positive("client.max_connections_per_host", self.client.max_connections_per_host)?;
        check_positive("client.read_size", self.client.read_size)?;
        check_positive("client.max_chunk_size", self.client.max_chunk_size)?;
        check_positive("client.max_head_size", self.client.max_head_size)?;
        check_positive("decoder.max_depth", self.decoder.max_depth)?;
        check_positive("decoder.max_value_size", self.decoder.max_value_size)?;
        Ok(())
    }

    /// Scaffold a config with every default spelled out.
    pub fn scaffold(bind: &str) -> Self {
        ChunkflowConfig {
            server: ServerConfig {
                bind: bind.to_string(),
                write_timeout: Some("30s".to_string()),
                ..ServerConfig::default()
            },
            client: ClientConfig::default(),
            decoder: DecoderConfig::default(),
        }
    }
}

fn check_duration(field: &'static str, value: Option<&String>) -> Result<(), ConfigError> {
    match value {
        Some(v) if parse_duration(v).is_none() => Err(ConfigError::InvalidDuration {
            field,
            value: v.clone(),
        }),
        _ => Ok(()),
    }
}

fn check_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaffold_round_trips() {
        let config = ChunkflowConfig::scaffold("0.0.0.0:9000");
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("0.0.0.0:9000"));

        let parsed = ChunkflowConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = ChunkflowConfig::from_toml_str("").unwrap();
        assert_eq!(config, ChunkflowConfig::default());
        assert_eq!(config.server.header_read_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.read_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.server.write_timeout(), None);
    }

    #[test]
    fn test_parse_partial_sections() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:7000"
write_timeout = "250ms"

[decoder]
separator = "newline"
"#;
        let config = ChunkflowConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:7000");
        assert_eq!(config.server.write_timeout(), Some(Duration::from_millis(250)));
        assert!(config.server.keep_alive);
        assert_eq!(config.decoder.separator, Separator::Newline);
        assert_eq!(config.decoder.max_depth, 128);
    }

    #[test]
    fn test_invalid_duration_rejected() {
        let err = ChunkflowConfig::from_toml_str("[client]\nconnect_timeout = \"soon\"\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration { field: "client.connect_timeout", .. }
        ));
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let err =
            ChunkflowConfig::from_toml_str("[client]\nmax_connections_per_host = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_overflowing_duration_rejected() {
        let err = ChunkflowConfig::from_toml_str("[client]\nidle_timeout = \"307445734561825861m\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDuration { field: "client.idle_timeout", .. }));
    }

    #[test]
    fn test_unknown_separator_rejected() {
        let err = ChunkflowConfig::from_toml_str("[decoder]\nseparator = \"comma\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunkflow.toml");
        std::fs::write(&path, "[client]\nuser_agent = \"watcher/1.0\"\n").unwrap();

        let config = ChunkflowConfig::from_file(&path).unwrap();
        assert_eq!(config.client.user_agent, "watcher/1.0");
    }
}
