//! Phoenix server - entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};

use phoenix_server::connection::ConnectionManager;
use phoenix_server::router::Router;
use phoenix_server::{identity, transport, Config, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path = PathBuf::from("config.toml");
    let mut gen_keys = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = args
                    .next()
                    .map(PathBuf::from)
                    .context("--config requires a path")?;
            }
            "--gen-keys" => gen_keys = true,
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
    }

    if gen_keys {
        return run_gen_keys();
    }

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path:?}"))?;

    phoenix_server::util::init_tracing(&config.logging)?;
    info!(version = VERSION, config_path = ?config_path, "starting phoenix server");

    if config.metrics.enabled {
        phoenix_server::metrics::init_metrics(&config.metrics)?;
        info!(bind_addr = %config.metrics.bind_addr, "metrics endpoint started");
    }

    let config = Arc::new(config);
    let connections = ConnectionManager::new();
    let router = Router::new(config.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::select! {
        result = transport::run(config, router, connections, shutdown_rx) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                return Err(e);
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    }

    info!("server stopped");
    Ok(())
}

/// `--gen-keys`: generate an Ed25519 keypair, write the private key to
/// `private.key` (mode 0600), and print the base64 public key to stdout.
fn run_gen_keys() -> Result<()> {
    let key = identity::generate_keypair();
    let path = PathBuf::from("private.key");
    write_private_key(&key, &path)?;
    println!("{}", identity::encode_public_key(&key.verifying_key()));
    Ok(())
}

#[cfg(unix)]
fn write_private_key(key: &ed25519_dalek::SigningKey, path: &PathBuf) -> Result<()> {
    use ed25519_dalek::pkcs8::EncodePrivateKey;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let der = key.to_pkcs8_der().context("encode private key")?;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.write_all(der.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_key(key: &ed25519_dalek::SigningKey, path: &PathBuf) -> Result<()> {
    use ed25519_dalek::pkcs8::EncodePrivateKey;
    let der = key.to_pkcs8_der().context("encode private key")?;
    std::fs::write(path, der.as_bytes())?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
