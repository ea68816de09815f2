//! Configuration management
//!
//! Loads and validates server configuration from a TOML file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Transport/listen settings and identity material.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the HTTP/2 listener.
    pub listen_addr: SocketAddr,
    /// `plaintext` (h2c, for local testing), `server` (TLS, server cert
    /// only), or `mutual` (TLS with client certificate verification).
    #[serde(default = "default_tls_mode")]
    pub tls_mode: TlsMode,
    /// Path to the Ed25519 private key (PKCS#8 PEM). Generated by
    /// `--gen-keys` if absent and `tls_mode` requires it.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Base64-encoded raw Ed25519 public keys allowed to connect when
    /// `tls_mode = "mutual"`.
    #[serde(default)]
    pub authorized_clients: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    Plaintext,
    Server,
    Mutual,
}

fn default_tls_mode() -> TlsMode {
    TlsMode::Server
}

/// Which inbound protocols this server is willing to serve.
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub enable_socks5: bool,
    #[serde(default)]
    pub enable_udp: bool,
    #[serde(default)]
    pub enable_shadowsocks: bool,
    #[serde(default)]
    pub enable_ssh: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            enable_socks5: false,
            enable_udp: false,
            enable_shadowsocks: false,
            enable_ssh: false,
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: SocketAddr,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_metrics_addr() -> SocketAddr {
    "127.0.0.1:9090".parse().unwrap()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {:?}", path))?;

        let config: Config =
            toml::from_str(&contents).with_context(|| "failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.tls_mode != TlsMode::Plaintext && self.server.private_key.is_none() {
            anyhow::bail!("private_key is required unless tls_mode = \"plaintext\"");
        }
        if self.server.tls_mode == TlsMode::Mutual && self.server.authorized_clients.is_empty() {
            anyhow::bail!("authorized_clients must be non-empty when tls_mode = \"mutual\"");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_requires_no_key() {
        let cfg = Config {
            server: ServerConfig {
                listen_addr: "0.0.0.0:8443".parse().unwrap(),
                tls_mode: TlsMode::Plaintext,
                private_key: None,
                authorized_clients: vec![],
            },
            security: SecurityConfig::default(),
            metrics: MetricsConfig {
                enabled: false,
                bind_addr: default_metrics_addr(),
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
            },
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn mutual_requires_authorized_clients() {
        let mut cfg = Config {
            server: ServerConfig {
                listen_addr: "0.0.0.0:8443".parse().unwrap(),
                tls_mode: TlsMode::Mutual,
                private_key: Some("private.key".into()),
                authorized_clients: vec![],
            },
            security: SecurityConfig::default(),
            metrics: MetricsConfig {
                enabled: false,
                bind_addr: default_metrics_addr(),
            },
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
            },
        };
        assert!(cfg.validate().is_err());
        cfg.server.authorized_clients.push("AAAA".into());
        assert!(cfg.validate().is_ok());
    }
}
