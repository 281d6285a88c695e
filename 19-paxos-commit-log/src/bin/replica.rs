//! Runs one replica of the commit log with a line-based stdin console.
//!
//! # Example usage
//!
//! Start a 3-replica cluster, one terminal each:
//! ```bash
//! cargo run --bin paxos-replica -- --id 0 \
//!   --peer 127.0.0.1:7101,127.0.0.1:7102,127.0.0.1:7103 --no-catch-up
//! cargo run --bin paxos-replica -- --id 1 \
//!   --peer 127.0.0.1:7101,127.0.0.1:7102,127.0.0.1:7103 --no-catch-up
//! cargo run --bin paxos-replica -- --id 2 \
//!   --peer 127.0.0.1:7101,127.0.0.1:7102,127.0.0.1:7103 --no-catch-up
//! ```
//!
//! A replica restarted later (or added empty) should run with catch-up, the
//! default, so that it pulls what it missed before serving.

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{Parser, ValueHint};
use tracing::{info, warn};

use paxos_commit_log::bus::MessageBus;
use paxos_commit_log::config::{ReplicaConfig, Timeouts, parse_peers};
use paxos_commit_log::console::ConsoleCommand;
use paxos_commit_log::replica::{Replica, ReplicaHandle};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one replica of the Paxos commit log")]
struct Args {
    /// Index of this replica in --peer
    #[arg(long)]
    id: usize,

    /// Comma-separated host:port list of every replica, in id order (include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other, required = true)]
    peer: Vec<String>,

    /// Address to bind instead of this replica's --peer entry, e.g. 0.0.0.0:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: Option<String>,

    /// File the decided log is persisted to
    #[arg(long, value_hint = ValueHint::FilePath)]
    storage: Option<PathBuf>,

    /// Serve immediately instead of pulling missed commits from peers first
    #[arg(long)]
    no_catch_up: bool,

    /// How often handler loops recheck for shutdown, in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let topology = parse_peers(&args.peer)?;
    let mut timeouts = Timeouts::default();
    if let Some(ms) = args.poll_ms {
        ensure!(ms > 0, "--poll-ms must be positive");
        timeouts.poll = Duration::from_millis(ms);
    }
    let mut config = ReplicaConfig::new(args.id, topology)?
        .with_catch_up(!args.no_catch_up)
        .with_timeouts(timeouts);
    if let Some(path) = args.storage {
        config = config.with_storage(path);
    }

    let bind_addr = args
        .listen
        .unwrap_or_else(|| config.listen_addr().to_string());
    let bus = MessageBus::bind(bind_addr.as_str())?;
    let handle = Replica::start_with_bus(config, bus)?;
    info!(addr = %handle.local_addr(), "replica started, type 'help' for commands");

    run_console(&handle)?;
    handle.shutdown();
    Ok(())
}

/// Reads console commands until `quit` or end of input.
fn run_console(handle: &ReplicaHandle) -> Result<()> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match ConsoleCommand::parse(&line) {
            Ok(ConsoleCommand::Quit) => return Ok(()),
            Ok(ConsoleCommand::Status) => println!("{}", handle.status()),
            Ok(ConsoleCommand::Help) => println!("{}", ConsoleCommand::usage()),
            Err(err) => warn!("{err}"),
        }
    }
    info!("stdin closed");
    Ok(())
}
