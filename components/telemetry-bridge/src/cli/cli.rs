use crate::decoder::frame::{PAYLOAD_LEN, Payload};
use crate::helpers::converters::SensorSample;
use crate::helpers::load_config::Config;
use crate::runtime;
use crate::server::control::request_shutdown;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{ErrorKind, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

#[derive(Parser)]
#[command(
    name = "telemetry-bridge",
    long_about = "Telemetry Bridge reassembles framed sensor notifications from a single upstream source, validates them and fans the payloads out to every connected TCP consumer.",
    about = "Sensor frame decoder and TCP fan-out bridge",
    version,
    term_width = 100,
    color = clap::ColorChoice::Auto,
    after_help = "\
    EXAMPLES:
        telemetry-bridge run --config /etc/telemetry-bridge.toml
        telemetry-bridge validate --config ./bridge.toml
        telemetry-bridge tap --data-addr 127.0.0.1:12345 --count 10 --json
        telemetry-bridge shutdown --control-addr 127.0.0.1:12346"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge
    Run {
        #[arg(short, long, default_value = "config/telemetry-bridge.toml")]
        config: PathBuf,
    },

    /// Validate the configuration file and print the effective settings
    Validate {
        #[arg(short, long, default_value = "config/telemetry-bridge.toml")]
        config: PathBuf,
    },

    /// Display version information
    Version,

    /// Ask a running bridge to shut down through its control port
    Shutdown {
        #[arg(long, default_value = "127.0.0.1:12346")]
        control_addr: SocketAddr,
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },

    /// Connect to the data port and print received samples
    Tap {
        #[arg(long, default_value = "127.0.0.1:12345")]
        data_addr: SocketAddr,
        /// Stop after this many samples
        #[arg(short = 'n', long)]
        count: Option<u64>,
        /// Print one JSON object per sample
        #[arg(long)]
        json: bool,
    },
}

/// Entry function for CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => runtime::runtime::run_bridge(config).await?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Version => show_version(),
        Commands::Shutdown {
            control_addr,
            timeout_ms,
        } => send_shutdown(control_addr, Duration::from_millis(timeout_ms)).await?,
        Commands::Tap {
            data_addr,
            count,
            json,
        } => tap(data_addr, count, json).await?,
    }

    Ok(())
}

//
// ------------------------ Command Implementations ------------------------------
//

/// Validate configuration file
fn validate_config(config: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config);
    let cfg = Config::load(&config)?;
    println!("Configuration valid:\n\n{}", cfg.to_toml()?);
    Ok(())
}

/// Show version information
fn show_version() {
    println!("Telemetry Bridge {}", env!("CARGO_PKG_VERSION"));
}

async fn send_shutdown(addr: SocketAddr, timeout: Duration) -> Result<()> {
    let reply = request_shutdown(addr, timeout)
        .await
        .with_context(|| format!("Failed to reach control port at {addr}"))?;
    println!("{reply}");
    Ok(())
}

#[derive(Serialize)]
struct TapRecord {
    received_at: String,
    #[serde(flatten)]
    sample: SensorSample,
}

/// Read raw 16-byte payloads from the data port until the bridge closes
/// the connection or `count` samples were printed.
async fn tap(addr: SocketAddr, count: Option<u64>, json: bool) -> Result<()> {
    let mut stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to data port at {addr}"))?;

    let mut out = std::io::stdout();
    let mut buf = [0u8; PAYLOAD_LEN];
    let mut printed = 0u64;

    while count.is_none_or(|limit| printed < limit) {
        match stream.read_exact(&mut buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("Failed to read from data port"),
        }

        let sample = SensorSample::from(&Payload::new(buf));
        if json {
            let record = TapRecord {
                received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                sample,
            };
            writeln!(out, "{}", serde_json::to_string(&record)?)?;
        } else {
            writeln!(
                out,
                "bcg={:>6} ecg={:>6} ppg_red={:>8} ppg_ir={:>8} temp_a={:>5} temp_b={:>5}",
                sample.bcg, sample.ecg, sample.ppg_red, sample.ppg_ir, sample.temp_a, sample.temp_b
            )?;
        }
        printed += 1;
    }

    out.flush()?;
    Ok(())
}
