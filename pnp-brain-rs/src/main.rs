//! PnP Brain - feeder network coordinator
//!
//! Reads M-code lines from stdin (as the pick-and-place host would send them)
//! and prints `ok` or `error: <reason>` for each.

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use pnp_core::{Coordinator, CoordinatorConfig, UdpLink};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Feeder network coordinator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local UDP address to bind
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Address every packet is sent to (repeatable); defaults to broadcast
    #[arg(short, long)]
    peer: Vec<SocketAddr>,

    /// Liveness threshold in milliseconds
    #[arg(long)]
    liveness_ms: Option<u64>,

    /// Start with motion enabled
    #[arg(long)]
    enable: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.link.bind = bind;
    }
    if !args.peer.is_empty() {
        config.link.fanout = args.peer.clone();
    }
    if let Some(ms) = args.liveness_ms {
        config.liveness_timeout_ms = ms;
    }
    if args.enable {
        config.start_enabled = true;
    }

    info!("PnP brain starting");

    let link = UdpLink::bind(config.link.bind, config.link.fanout.clone()).await?;
    info!("Listening on {}, sending to {:?}", link.local_addr()?, config.link.fanout);
    let inbound = link.start_receive();

    let (coordinator, handle) = Coordinator::new(config, Arc::new(link), inbound);
    let coordinator_task = tokio::spawn(coordinator.run());

    // Stdin reader on its own thread, lines forwarded to the loop
    let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        eprintln!("\nCommands:");
        eprintln!("  M610 [S0|S1]          - Query / set system enable");
        eprintln!("  M620                  - List nodes");
        eprintln!("  M600 Nf [Flen] [X1]   - Feed");
        eprintln!("  M601 Nf               - Post-pick retract");
        eprintln!("  M602 / M604 Nf        - Feeder / feedback status");
        eprintln!("  M603 Nf [A] [B] [C] [F] [U] - Update feeder settings");
        eprintln!("  M605 Nf S0|S1         - Disable / enable feedback");
        eprintln!("  M606 / M607 Nf        - Clear / report manual feed flag");
        eprintln!("  M280 Nf Aang          - Set servo angle");
        eprintln!("  discovery | status | clear_registration | unassigned");
        eprintln!("  assign <handle> <f>   - Give an unassigned node an identity");
        eprintln!("  quit                  - Exit\n");

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let line = line.trim().to_string();
            if line.is_empty() {
                continue;
            }
            if line == "quit" || line == "exit" {
                break;
            }
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        let reply = handle.execute(line).await;
        println!("{}", reply);
    }

    info!("PnP brain stopping");
    drop(handle);
    coordinator_task.abort();
    Ok(())
}
