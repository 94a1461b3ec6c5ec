//! Command line driver for the tickprobe measurement channel
//!
//! Provides three subcommands:
//! - `measure`: drive measurement rounds against a remote responder
//! - `echo-server`: run a local echo responder for experiments
//! - `generate-config`: write the default channel configuration

use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tickprobe_channel::{Channel, ChannelConfig, TickClock};

/// Tickprobe CLI
#[derive(Parser, Debug)]
#[clap(name = "tickprobe", version, about, long_about = None)]
struct Cli {
    /// Path to a JSON channel configuration
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Sets log level
    #[clap(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    /// Subcommand to execute
    #[clap(subcommand)]
    command: Commands,
}

/// CLI commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Measure request/response latency against a host
    Measure {
        /// Host to connect to
        #[clap(long)]
        host: String,

        /// Port to connect to
        #[clap(long)]
        port: u16,

        /// Request payload sent each round
        #[clap(long, default_value = "PING")]
        payload: String,

        /// Number of measurement rounds
        #[clap(long, default_value_t = 1)]
        rounds: u32,

        /// Use the bounded-retry read instead of the blocking read
        #[clap(long)]
        bounded: bool,
    },

    /// Run a local echo responder
    EchoServer {
        /// Port to listen on
        #[clap(long, default_value_t = 9000)]
        port: u16,
    },

    /// Write the default configuration to a file
    GenerateConfig {
        /// Output file
        #[clap(short, long, value_name = "FILE")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Measure {
            host,
            port,
            payload,
            rounds,
            bounded,
        } => run_measure(config, &host, port, payload.as_bytes(), rounds, bounded),
        Commands::EchoServer { port } => run_echo_server(port),
        Commands::GenerateConfig { output } => generate_config(&output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<ChannelConfig> {
    match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))
        }
        None => Ok(ChannelConfig::default()),
    }
}

fn run_measure(
    config: ChannelConfig,
    host: &str,
    port: u16,
    payload: &[u8],
    rounds: u32,
    bounded: bool,
) -> Result<()> {
    let channel = Channel::create(config)?;
    channel.connect(host, port)?;
    info!(host, port, rounds, bounded, "connected, starting measurement");

    // One-off calibration so tick deltas can be reported in wall-clock
    // units as well; the measurement itself stays in ticks.
    let ticks_per_sec = TickClock::calibrate(Duration::from_millis(50)).max(1);

    for round in 0..rounds {
        channel.start_measurement();
        channel.enqueue(payload)?;

        let mut first = [0u8; 1];
        let n = if bounded {
            channel.measured_read_bounded(&mut first)?
        } else {
            channel.measured_read(&mut first)?
        };
        if n == 0 {
            warn!(round, "peer closed the connection before responding");
            break;
        }

        let ticks = channel.elapsed_ticks().get();
        let nanos = (ticks as u128).saturating_mul(1_000_000_000) / ticks_per_sec as u128;
        println!("round {round}: {ticks} ticks (~{nanos} ns)");

        drain_response(&channel, payload.len().saturating_sub(n))?;
    }

    channel.close();
    Ok(())
}

/// Read the unmeasured remainder of an echoed response.
fn drain_response(channel: &Channel, mut remaining: usize) -> Result<()> {
    let mut buf = [0u8; 4096];
    while remaining > 0 {
        let n = channel.read_passthrough(&mut buf)?;
        if n == 0 {
            warn!("peer closed the connection mid-response");
            break;
        }
        remaining = remaining.saturating_sub(n);
    }
    Ok(())
}

fn run_echo_server(port: u16) -> Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .with_context(|| format!("failed to bind echo responder on port {port}"))?;
    info!(port, "echo responder listening");

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        thread::spawn(move || {
            let peer = stream.peer_addr().ok();
            info!(?peer, "connection accepted");
            let mut buf = [0u8; 4096];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                }
            }
            info!(?peer, "connection closed");
        });
    }
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    let config = ChannelConfig::default();
    let json = serde_json::to_string_pretty(&config)?;
    fs::write(output, json)
        .with_context(|| format!("failed to write config to {}", output.display()))?;
    info!(path = %output.display(), "default configuration written");
    Ok(())
}
