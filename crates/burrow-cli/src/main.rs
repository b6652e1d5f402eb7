//! Burrow CLI
//!
//! `burrow serve` runs the relay; `burrow connect` runs a client that
//! exposes a local upstream under a domain, reconnecting with a fixed
//! backoff whenever the control channel is lost.

use anyhow::{Context, Result};
use burrow_client::{ClientConfig, TunnelClient};
use burrow_relay::{Credentials, Relay, RelayConfig};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Reverse tunnels for services behind NAT
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Reverse tunnels for services behind NAT")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server
    Serve(ServeArgs),
    /// Expose a local upstream through a relay
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address clients connect their control channels to
    #[arg(long, env = "BURROW_CONTROL_ADDR", default_value = "0.0.0.0:4443")]
    control_addr: SocketAddr,

    /// Public endpoint for ordinary traffic and reverse data legs
    #[arg(long, env = "BURROW_PUBLIC_ADDR", default_value = "0.0.0.0:8080")]
    public_addr: SocketAddr,

    /// Credential required from every client (none = open registration)
    #[arg(long, env = "BURROW_CREDENTIAL")]
    credential: Option<String>,

    /// Per-domain credential as domain=key (repeatable)
    #[arg(long = "domain-credential", value_parser = parse_key_val)]
    domain_credentials: Vec<(String, String)>,

    /// Seconds to wait for a reverse connection before failing a dial
    #[arg(long, default_value_t = 10)]
    dial_timeout_secs: u64,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Relay control endpoint (host:port)
    #[arg(long, env = "BURROW_RELAY")]
    relay: String,

    /// Relay public endpoint reverse connections dial back to (host:port)
    #[arg(long, env = "BURROW_ENDPOINT")]
    endpoint: String,

    /// Domain to register under
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: String,

    /// Local upstream URL requests are forwarded to
    #[arg(long, env = "BURROW_UPSTREAM")]
    upstream: String,

    /// Registration credential
    #[arg(long, env = "BURROW_CREDENTIAL")]
    credential: Option<String>,

    /// Seconds to wait before reconnecting after a lost channel
    #[arg(long, default_value_t = 5)]
    reconnect_delay_secs: u64,
}

/// Parse a key=value pair
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {log_level}"))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

/// Cancel the returned token on Ctrl+C
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C, shutting down");
                token.cancel();
            }
        });
    }
    token
}

async fn serve(args: ServeArgs) -> Result<()> {
    let mut credentials = Credentials::new();
    if let Some(key) = args.credential {
        credentials = credentials.with_default_key(key);
    }
    for (domain, key) in args.domain_credentials {
        credentials = credentials.with_domain_key(domain, key);
    }

    let config = RelayConfig {
        control_addr: args.control_addr,
        public_addr: args.public_addr,
        credentials,
        dial_timeout: Duration::from_secs(args.dial_timeout_secs),
        ..RelayConfig::default()
    };

    let relay = Relay::bind(config).await.context("Failed to bind relay")?;
    relay.run(shutdown_token()).await?;
    Ok(())
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let mut config = ClientConfig::new(args.relay, args.endpoint, args.domain, &args.upstream)
        .context("Invalid client configuration")?;
    if let Some(credential) = args.credential {
        config = config.with_credential(credential);
    }

    let backoff = Duration::from_secs(args.reconnect_delay_secs);
    let client = TunnelClient::new(config);
    let shutdown = shutdown_token();

    // One reconnect attempt per lost channel, spaced by the configured
    // backoff. The core never retries on its own.
    loop {
        match client.run(shutdown.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                error!("control channel lost: {}", e);
            }
        }

        warn!("reconnecting in {}s", backoff.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Connect(args) => connect(args).await,
    }
}
