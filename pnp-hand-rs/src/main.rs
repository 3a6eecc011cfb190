//! PnP Hand - simulated actuator node
//!
//! Runs one feeder node with a logging servo and a tape sensor controlled
//! from stdin. Two processes on one machine need distinct `--bind` ports and
//! `--peer` pointing at each other.

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use pnp_core::{ActuatorNode, FeederId, NodeConfig, NodeHandle, SimServo, SimTapeSensor, UdpLink};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Simulated feeder actuator node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; an assigned feeder id is written back to it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Feeder identity (0-49); omit to announce as unassigned
    #[arg(short, long)]
    feeder: Option<u8>,

    /// Node handle, e.g. 02:00:00:00:00:01
    #[arg(long)]
    handle: Option<NodeHandle>,

    /// Local UDP address to bind
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Address every packet is sent to (repeatable); defaults to broadcast
    #[arg(short, long)]
    peer: Vec<SocketAddr>,

    /// Servo settle time per stroke in milliseconds
    #[arg(long)]
    settle_ms: Option<u64>,

    /// Start with tape missing
    #[arg(long)]
    no_tape: bool,

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
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(raw) = args.feeder {
        config = config.with_feeder_id(FeederId::new(raw)?);
    }
    if let Some(handle) = args.handle {
        config.handle = handle;
    }
    if let Some(bind) = args.bind {
        config.link.bind = bind;
    }
    if !args.peer.is_empty() {
        config.link.fanout = args.peer.clone();
    }
    if let Some(ms) = args.settle_ms {
        config.settings.settle_time_ms = ms;
        config.settings.validate()?;
    }

    info!("PnP hand {} starting", config.handle);

    let link = UdpLink::bind(config.link.bind, config.link.fanout.clone()).await?;
    info!("Listening on {}", link.local_addr()?);
    let inbound = link.start_receive();

    let servo = SimServo::new();
    let sensor = SimTapeSensor::new(!args.no_tape);
    let node = ActuatorNode::new(
        config,
        Arc::new(link),
        inbound,
        Box::new(servo),
        Arc::new(sensor.clone()),
    );
    let mut trigger = node.manual_trigger();
    let status = node.subscribe();
    let node_task = tokio::spawn(node.run());

    // Spawn stdin handler for bench input
    let (quit_tx, quit_rx) = tokio::sync::oneshot::channel::<()>();
    std::thread::spawn(move || {
        println!("\nCommands:");
        println!("  press [ms]     - Simulated button pulse of the given width (default 20 ms)");
        println!("                   both edges are synthesized, not timed from the keyboard");
        println!("  tape on|off    - Set the tape sensor");
        println!("  state          - Show feeder state");
        println!("  quit           - Exit\n");

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.is_empty() {
                continue;
            }

            match parts[0] {
                "press" => {
                    let width = parts
                        .get(1)
                        .and_then(|ms| ms.parse::<u64>().ok())
                        .unwrap_or(20);
                    // Synthetic edges: release is stamped `width` after press
                    let t0 = Instant::now();
                    trigger.press(t0);
                    if trigger.release(t0 + Duration::from_millis(width)) {
                        println!("Manual feed latched");
                    } else {
                        println!("Pulse of {} ms ignored", width);
                    }
                }
                "tape" => match parts.get(1).copied() {
                    Some("on") => sensor.set_present(true),
                    Some("off") => sensor.set_present(false),
                    _ => println!("Usage: tape on|off"),
                },
                "state" => {
                    let current = *status.borrow();
                    match current.feeder {
                        Some(id) => println!("Feeder {}", id),
                        None => println!("Feeder unassigned"),
                    }
                    println!("{:?}", current.snapshot);
                }
                "quit" | "exit" => break,
                _ => println!("Unknown command. Try: press, tape on|off, state"),
            }
        }
        let _ = quit_tx.send(());
    });

    let _ = quit_rx.await;
    info!("PnP hand stopping");
    node_task.abort();
    Ok(())
}
