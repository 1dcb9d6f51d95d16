use anyhow::{Context, bail};
use chrono::Local;
use clap::{Parser, Subcommand};
use ftl_ingest::ingest::select_ingest;
use ftl_ingest::{IngestParams, IngestSession, StaticIngestDirectory, StatusMessage, TransportConfig};
use ftlcore::ingest::UNREACHABLE_RTT;
use log::{info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

// Command line front end for the ingest engine.
//
// Usage:
//   ftl-ingest probe ingest-a.example.net ingest-b.example.net
//   ftl-ingest speed-test --ingest auto --ingest-list ingests.json --stream-key 1234-abcd
//   ftl-ingest monitor --ingest ingest-a.example.net --stream-key 1234-abcd --seconds 60

#[derive(Debug, Parser)]
#[command(name = "ftl-ingest", version, about = "FTL ingest client tools")]
struct Cli {
    /// JSON file overriding transport defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct Target {
    /// Ingest hostname, or `auto` to pick the closest from --ingest-list
    #[arg(long, default_value = "auto")]
    ingest: String,

    /// Ingest list in `[{"name", "ip", "hostname"}]` format
    #[arg(long)]
    ingest_list: Option<PathBuf>,

    /// `<channel>-<key>`
    #[arg(long, env = "FTL_STREAM_KEY")]
    stream_key: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Measure RTT to each host and print the closest
    Probe {
        #[arg(required = true)]
        hosts: Vec<String>,
    },
    /// Connect, flood the media path, print the usable bitrate
    SpeedTest {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 10_000)]
        kbps: i64,
        #[arg(long, default_value_t = 5_000)]
        duration_ms: u64,
    },
    /// Connect and print status messages
    Monitor {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 30)]
        seconds: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<TransportConfig>(&raw).context("parsing transport config")?
        }
        None => TransportConfig::default(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async move {
        match cli.command {
            Command::Probe { hosts } => probe(hosts, &config).await,
            Command::SpeedTest {
                target,
                kbps,
                duration_ms,
            } => speed_test(target, config, kbps, duration_ms).await,
            Command::Monitor { target, seconds } => monitor(target, config, seconds).await,
        }
    })
}

async fn probe(hosts: Vec<String>, config: &TransportConfig) -> anyhow::Result<()> {
    let directory = StaticIngestDirectory::from_hosts(hosts);
    let best = select_ingest(&directory, config).await?;

    let rtt = best.rtt.unwrap_or(UNREACHABLE_RTT);
    if rtt >= UNREACHABLE_RTT {
        bail!("no ingest answered the probe");
    }
    println!("{} {} ms", best.hostname, rtt.as_millis());
    Ok(())
}

async fn open_session(target: Target, config: TransportConfig) -> anyhow::Result<IngestSession> {
    let params = IngestParams::new(target.ingest, target.stream_key);
    let session = IngestSession::with_config(params, config)?;

    if let Some(path) = target.ingest_list {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        session.set_ingest_directory(StaticIngestDirectory::from_json(&raw)?);
    }

    session.connect().await?;
    info!("Connected, media port {:?}", session.media_port());
    Ok(session)
}

async fn speed_test(
    target: Target,
    config: TransportConfig,
    kbps: i64,
    duration_ms: u64,
) -> anyhow::Result<()> {
    let session = open_session(target, config).await?;
    let result = session.speed_test(kbps, duration_ms).await;
    session.destroy().await?;

    let result = result?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn monitor(target: Target, config: TransportConfig, seconds: u64) -> anyhow::Result<()> {
    let session = open_session(target, config).await?;
    let deadline = Instant::now() + Duration::from_secs(seconds);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        tokio::select! {
            message = session.get_status(remaining) => match message {
                Ok(message) => {
                    print_status(&message)?;
                    if is_disconnect(&message) {
                        break;
                    }
                }
                Err(ftlcore::FtlError::StatusTimeout) => break,
                Err(e) => {
                    warn!("Status queue closed: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    session.destroy().await?;
    Ok(())
}

fn is_disconnect(message: &StatusMessage) -> bool {
    message
        .as_event()
        .is_some_and(|event| event.kind == ftlcore::status::EventKind::Disconnected)
}

fn print_status(message: &StatusMessage) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(message)?);
    Ok(())
}
