//! ReWork RPC peer - hosts the correlation engine over TCP.
//!
//! In serve mode the binary accepts UI peers and answers the builtin calls.
//! With `--connect` it acts as a one-shot client: it sends a single call and
//! prints the response.

mod handler;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use rework_core::{EngineConfig, RpcEngine, TcpTransport};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "rework-rpc")]
#[command(about = "TCP peer for the ReWork RPC engine")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// JSON engine configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the call timeout, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Connect to a running peer instead of serving
    #[arg(long)]
    connect: Option<SocketAddr>,

    /// Event to call in client mode
    #[arg(long, default_value = "ping", requires = "connect")]
    call: String,

    /// JSON payload for the call
    #[arg(long, default_value = "null", requires = "connect")]
    data: String,

    /// Retries for a call that timed out or hit a transport error
    #[arg(long, default_value = "0", requires = "connect")]
    retries: u32,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(ms) = args.timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries RPC_PORT and client output
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = load_config(&args)?;

    if let Some(addr) = args.connect {
        return run_client(addr, &args.call, &args.data, args.retries, config).await;
    }

    info!("Starting ReWork RPC peer");

    let mut server = server::start_server(config, &args.host, args.port).await?;

    // Print port for the UI process to read (intentional stdout for IPC)
    println!("RPC_PORT={}", server.local_addr().port());

    info!("RPC peer running on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    server.shutdown().await;

    Ok(())
}

async fn run_client(
    addr: SocketAddr,
    event: &str,
    data: &str,
    retries: u32,
    config: EngineConfig,
) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(data).context("--data must be valid JSON")?;

    let transport = TcpTransport::connect(addr, &config).await?;
    let engine = RpcEngine::new(transport, config);
    let _listener = engine.listen();

    let mut attempt = 0;
    let response = loop {
        match engine.call(event, payload.clone()).await {
            Ok(response) => break response,
            Err(e) if e.is_retryable() && attempt < retries => {
                attempt += 1;
                warn!(attempt, "Call to '{}' failed, retrying: {}", event, e);
            }
            Err(e) => return Err(e.into()),
        }
    };
    println!("{}", serde_json::to_string_pretty(&response)?);

    engine.cleanup();
    Ok(())
}
