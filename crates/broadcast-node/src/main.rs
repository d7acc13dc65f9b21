//! broadcast-node: one member of a broadcast cluster.
//!
//! Speaks line-delimited JSON: requests arrive on stdin, replies and
//! forwards to other nodes leave on stdout. Logs go to stderr.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

use broadcast_core::AckMode;
use broadcast_node::{run, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "broadcast-node")]
#[command(about = "Broadcast cluster node over stdin/stdout")]
struct Args {
    /// Path to a JSON config file (defaults are used if it doesn't exist)
    #[arg(short, long, env = "BROADCAST_CONFIG", default_value = "broadcast-node.json")]
    config: PathBuf,

    /// When to acknowledge a submit: immediate or after-fanout
    #[arg(long, env = "BROADCAST_ACK_MODE")]
    ack_mode: Option<AckMode>,

    /// Store and re-forward every submit, even ones already seen
    #[arg(long)]
    no_dedup: bool,

    /// Per-attempt timeout for forwards, in milliseconds
    #[arg(long, env = "BROADCAST_RPC_TIMEOUT_MS")]
    rpc_timeout_ms: Option<u64>,

    /// Give up on a forward after this many attempts
    #[arg(long, env = "BROADCAST_MAX_ATTEMPTS")]
    max_attempts: Option<u32>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Command-line flags win over the config file.
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(ack_mode) = self.ack_mode {
            config.engine.ack_mode = ack_mode;
        }
        if self.no_dedup {
            config.engine.dedup = false;
        }
        if let Some(timeout_ms) = self.rpc_timeout_ms {
            config.rpc.timeout_ms = timeout_ms;
        }
        if self.max_attempts.is_some() {
            config.rpc.max_attempts = self.max_attempts;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose).
    // stdout carries protocol messages, so logs must go to stderr.
    let default_filter = if args.verbose {
        "debug,broadcast_core=debug,broadcast_node=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig::load(&args.config)?;
    args.apply(&mut config);

    info!("Starting broadcast-node");
    info!(
        "Ack mode: {:?}, dedup: {}, rpc timeout: {}ms",
        config.engine.ack_mode, config.engine.dedup, config.rpc.timeout_ms
    );

    run(config, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await?;

    info!("broadcast-node stopped");
    Ok(())
}
