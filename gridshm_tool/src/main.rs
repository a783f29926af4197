//! # gridshm
//!
//! Command-line front end for shared-memory channels.
//!
//! # Usage
//!
//! ```bash
//! # Echo server (prints the bound address on stdout)
//! gridshm serve --config config/gridshm.toml --addr 127.0.0.1:7400
//!
//! # 100 round trips of 4 KiB
//! gridshm ping --addr 127.0.0.1:7400 --count 100 --size 4096
//!
//! # Remove regions left behind by crashed processes
//! gridshm sweep --prefix gridshm
//! ```

use clap::{Parser, Subcommand};
use gridshm::prelude::{ConfigLoader, LogLevel, SharedConfig, TransportConfig};
use gridshm_ipc::{Endpoint, LogFilePeerLostHandler, Transport, platform, reclaim_orphans};
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Shared-memory channel tool
#[derive(Parser, Debug)]
#[command(name = "gridshm")]
#[command(version)]
#[command(about = "Echo server, ping client and orphan sweeper for shared-memory channels")]
struct Args {
    /// TOML file with [shared] and [transport] tables
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo every byte back
    Serve {
        /// Loopback side-channel address
        #[arg(long, default_value = "127.0.0.1:7400")]
        addr: String,

        /// Append peer-lost events to this file as JSON lines
        #[arg(long, value_name = "FILE")]
        event_log: Option<PathBuf>,
    },
    /// Connect to a server and time round trips
    Ping {
        /// Server side-channel address
        #[arg(long, default_value = "127.0.0.1:7400")]
        addr: String,

        /// Number of round trips
        #[arg(long, default_value_t = 10)]
        count: usize,

        /// Payload bytes per round trip
        #[arg(long, default_value_t = 64)]
        size: usize,
    },
    /// Remove orphaned regions and semaphores
    Sweep {
        /// Name prefix, defaults to the configured one
        #[arg(long)]
        prefix: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct ToolConfig {
    shared: SharedConfig,
    #[serde(default)]
    transport: TransportConfig,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            shared: SharedConfig {
                log_level: LogLevel::Info,
                service_name: "gridshm".to_string(),
            },
            transport: TransportConfig::default(),
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ToolConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => ToolConfig::load(path)?,
        None => ToolConfig::default(),
    };
    config.shared.validate()?;
    config.transport = config.transport.with_env_overrides()?;
    config.transport.validate()?;
    Ok(config)
}

fn main() {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            setup_tracing(&args, LogLevel::Info);
            error!("Configuration failed: {}", e);
            std::process::exit(2);
        }
    };
    setup_tracing(&args, config.shared.log_level);

    if let Err(e) = run(args.command, config) {
        error!("gridshm failed: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Command, config: ToolConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        service = %config.shared.service_name,
        "gridshm v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    match command {
        Command::Serve { addr, event_log } => serve(config.transport, &addr, event_log),
        Command::Ping { addr, count, size } => ping(config.transport, &addr, count, size),
        Command::Sweep { prefix } => {
            let prefix = prefix.unwrap_or(config.transport.name_prefix);
            sweep(&prefix)
        }
    }
}

fn serve(
    config: TransportConfig,
    addr: &str,
    event_log: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = Transport::native(config)?;
    if let Some(path) = event_log {
        transport
            .monitor()
            .add_handler(Box::new(LogFilePeerLostHandler::new(path)));
    }

    let listener = transport.listen(addr)?;
    let bound = listener.local_addr()?;
    // Scripts and tests read the port from here when binding port 0.
    println!("listening on {bound}");
    std::io::stdout().flush()?;

    for (index, accepted) in listener.incoming().enumerate() {
        let endpoint = match accepted {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                continue;
            }
        };
        std::thread::Builder::new()
            .name(format!("gridshm-echo-{index}"))
            .spawn(move || echo(endpoint))?;
    }
    Ok(())
}

fn echo(endpoint: Endpoint) {
    let peer = endpoint.peer_pid();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0usize;

    loop {
        let received = match endpoint.receive(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(peer, error = %e, "Echo receive failed");
                break;
            }
        };
        if let Err(e) = endpoint.send(&buf[..received]) {
            warn!(peer, error = %e, "Echo send failed");
            break;
        }
        total += received;
    }
    info!(peer, bytes = total, "Echo connection finished");
}

/// Round-trip latency summary
#[derive(Debug, Clone, Copy, PartialEq)]
struct PingStats {
    count: usize,
    min: Duration,
    max: Duration,
    total: Duration,
}

impl PingStats {
    fn from_samples(samples: &[Duration]) -> Option<Self> {
        let min = samples.iter().min().copied()?;
        let max = samples.iter().max().copied()?;
        Some(Self {
            count: samples.len(),
            min,
            max,
            total: samples.iter().sum(),
        })
    }

    fn mean(&self) -> Duration {
        self.total / self.count as u32
    }
}

fn ping(
    config: TransportConfig,
    addr: &str,
    count: usize,
    size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    if size == 0 {
        return Err("payload size must be greater than zero".into());
    }

    let transport = Transport::native(config)?;
    let endpoint = transport.connect(addr)?;
    info!(peer = endpoint.peer_pid(), "Connected");

    let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let mut reply = vec![0u8; size];
    let mut samples = Vec::with_capacity(count);

    for _ in 0..count {
        let started = Instant::now();
        // Payloads larger than both rings need the reply drained while sending.
        std::thread::scope(|scope| {
            let sender = scope.spawn(|| (&endpoint).write_all(&payload));
            let received = (&endpoint).read_exact(&mut reply);
            match sender.join() {
                Ok(sent) => sent.and(received),
                Err(_) => Err(std::io::Error::other("sender thread panicked")),
            }
        })?;
        samples.push(started.elapsed());
        if reply != payload {
            return Err("echo reply differs from payload".into());
        }
    }
    endpoint.close();

    if let Some(stats) = PingStats::from_samples(&samples) {
        println!(
            "{} round trips of {} bytes: min {:?} avg {:?} max {:?}",
            stats.count,
            size,
            stats.min,
            stats.mean(),
            stats.max
        );
    }
    Ok(())
}

fn sweep(prefix: &str) -> Result<(), Box<dyn std::error::Error>> {
    let provider = platform::load()?;
    let removed = reclaim_orphans(&*provider, prefix)?;
    for name in &removed {
        println!("removed {name}");
    }
    println!("{} orphaned space(s) reclaimed", removed.len());
    Ok(())
}

/// Setup tracing subscriber; `RUST_LOG` wins over the configured level.
fn setup_tracing(args: &Args, level: LogLevel) {
    let directive = if args.verbose {
        LogLevel::Debug.as_directive()
    } else {
        level.as_directive()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);
    if args.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
