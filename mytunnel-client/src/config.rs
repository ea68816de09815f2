//! Configuration management
//!
//! Handles loading and validating client configuration from TOML files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub remote_addr: String,
    pub private_key: Option<String>,
    pub server_public_key: Option<String>,
    #[serde(default)]
    pub tls_mode: Option<String>,
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One local listener: protocol, bind address, and protocol-specific
/// parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundConfig {
    pub protocol: ProtocolTag,
    pub local_addr: String,
    #[serde(default)]
    pub enable_udp: Option<bool>,
    #[serde(default)]
    pub target_addr: Option<String>,
    #[serde(default)]
    pub auth: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolTag {
    Socks5,
    Shadowsocks,
    Ssh,
}

impl ProtocolTag {
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProtocolTag::Socks5 => "socks5",
            ProtocolTag::Shadowsocks => "shadowsocks",
            ProtocolTag::Ssh => "ssh",
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path:?}"))?;

        let config: Config =
            toml::from_str(&contents).with_context(|| "failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.remote_addr.is_empty() {
            anyhow::bail!("remote_addr must not be empty");
        }
        if self.inbounds.is_empty() {
            anyhow::bail!("at least one [[inbounds]] entry is required");
        }
        for inbound in &self.inbounds {
            if inbound.local_addr.is_empty() {
                anyhow::bail!("inbound local_addr must not be empty");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_remote_addr() {
        let config = Config {
            remote_addr: String::new(),
            private_key: None,
            server_public_key: None,
            tls_mode: None,
            inbounds: vec![InboundConfig {
                protocol: ProtocolTag::Socks5,
                local_addr: "127.0.0.1:1080".into(),
                enable_udp: Some(true),
                target_addr: None,
                auth: None,
            }],
            logging: LoggingConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn requires_at_least_one_inbound() {
        let config = Config {
            remote_addr: "example.com:8443".into(),
            private_key: None,
            server_public_key: None,
            tls_mode: None,
            inbounds: vec![],
            logging: LoggingConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
