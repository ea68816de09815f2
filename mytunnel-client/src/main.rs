//! Phoenix client - entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use phoenix_client::config::ProtocolTag;
use phoenix_client::{identity, inbound, Config, PinningTransport, VERSION};

/// Phoenix tunnel client: SOCKS5, Shadowsocks, and SSH inbounds over a
/// pinned HTTP/2 tunnel.
#[derive(Parser)]
#[command(name = "phoenix-client")]
#[command(version = VERSION)]
struct Cli {
    /// Path to configuration file.
    #[arg(long, default_value = "client-config.toml")]
    config: PathBuf,

    /// Generate an Ed25519 keypair, write the private key, and print the
    /// base64 public key.
    #[arg(long)]
    gen_keys: bool,

    /// Print an `ss://` URL for each configured Shadowsocks inbound.
    #[arg(long)]
    get_ss: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();

    if cli.gen_keys {
        return run_gen_keys();
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {:?}", cli.config))?;

    if cli.get_ss {
        return run_get_ss(&config);
    }

    run_client(config, cli.config).await
}

async fn run_client(config: Config, config_path: PathBuf) -> Result<()> {
    init_tracing(&config.logging)?;
    info!(version = VERSION, config_path = ?config_path, "starting phoenix client");

    let config = Arc::new(config);
    let transport = Arc::new(PinningTransport::new(config.clone()).await?);
    let (ready_tx, _ready_rx) = tokio::sync::watch::channel(false);

    info!(remote = %config.remote_addr, inbounds = config.inbounds.len(), "client started");

    tokio::select! {
        _ = inbound::run(config.inbounds.clone(), transport, ready_tx) => {}
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    info!("client stopped");
    Ok(())
}

/// `--gen-keys`: generate an Ed25519 keypair, write `private.key` (0600 on
/// Unix), and print the base64 public key to stdout.
fn run_gen_keys() -> Result<()> {
    let key = identity::generate_keypair();
    let path = PathBuf::from("private.key");
    identity::persist_keypair(&key, &path)?;
    println!("{}", identity::encode_public_key(&key.verifying_key()));
    Ok(())
}

/// `--get-ss`: print one `ss://` URL per configured Shadowsocks inbound
/// with a non-empty `auth` string.
fn run_get_ss(config: &Config) -> Result<()> {
    use base64::Engine;
    let mut printed = 0;
    for inbound in &config.inbounds {
        if inbound.protocol != ProtocolTag::Shadowsocks {
            continue;
        }
        let Some(auth) = inbound.auth.as_deref().filter(|a| !a.is_empty()) else {
            continue;
        };
        let userinfo = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(auth.as_bytes());
        println!("ss://{userinfo}@{}", inbound.local_addr);
        printed += 1;
    }
    if printed == 0 {
        eprintln!("no shadowsocks inbounds with an `auth` entry configured");
    }
    Ok(())
}

fn init_tracing(logging_config: &phoenix_client::config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if logging_config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }

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
