//! Relink - command line entry point
//!
//! Replays a JSONL stream of signals and reset events through the linkage
//! engine, and verifies or summarizes an evidence ledger.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use relink_core::ledger::store::read_ledger_file;
use relink_core::ledger::verify_bytes;
use relink_core::{
    summarize, LedgerSnapshot, LinkageService, RawSignal, RelinkConfig, RelinkError,
    ReportFilter, ResetEventId,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "relink")]
#[command(about = "Measure whether identifier resets break tracking continuity", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration file (TOML); RELINK__* environment variables override it
    #[arg(short, long, env = "RELINK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSONL event stream and report the outcome
    Run {
        /// Input file with one `{"kind": "signal"|"reset", ...}` object per line
        #[arg(short, long)]
        input: PathBuf,

        /// Evidence ledger file (overrides ledger_path from the config)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Keep decisions whose window has not closed open instead of finalizing them
        #[arg(long)]
        no_finalize: bool,
    },

    /// Verify the hash chain of a ledger file
    Verify {
        #[arg(long)]
        ledger: PathBuf,
    },

    /// Summarize a ledger file
    Report {
        #[arg(long)]
        ledger: PathBuf,

        /// Only decisions across this reset (the epoch it opened)
        #[arg(long)]
        reset: Option<u64>,

        /// Skip decisions that are still open
        #[arg(long)]
        finalized_only: bool,
    },

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

/// One line of the replay input
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StreamEvent {
    Signal(RawSignal),
    Reset {
        old_epoch: u64,
        new_epoch: u64,
        occurred_at: chrono::DateTime<chrono::Utc>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::new(format!(
        "relink={level},relink_core={level}",
        level = level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Relink v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Run {
            input,
            ledger,
            no_finalize,
        } => {
            let mut config = RelinkConfig::load(cli.config.as_deref())?;
            if ledger.is_some() {
                config.ledger_path = ledger;
            }
            run(config, &input, !no_finalize).await
        }
        Commands::Verify { ledger } => verify(&ledger).await,
        Commands::Report {
            ledger,
            reset,
            finalized_only,
        } => {
            let filter = ReportFilter {
                reset: reset.map(ResetEventId),
                finalized_only,
                ..Default::default()
            };
            report(&ledger, &filter).await
        }
        Commands::CheckConfig => {
            let config = RelinkConfig::load(cli.config.as_deref())?;
            let rendered = toml::to_string_pretty(&config)
                .context("failed to render configuration")?;
            println!("{}", rendered);
            Ok(())
        }
    }
}

async fn run(config: RelinkConfig, input: &Path, finalize: bool) -> anyhow::Result<()> {
    let service = LinkageService::new(config).await?;

    let file = tokio::fs::File::open(input)
        .await
        .with_context(|| format!("cannot open {}", input.display()))?;
    let mut lines = BufReader::new(file).lines();

    let (mut accepted, mut malformed, mut line_no) = (0usize, 0usize, 0usize);
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: StreamEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!("Line {}: skipping unparseable event: {}", line_no, e);
                malformed += 1;
                continue;
            }
        };

        match event {
            StreamEvent::Signal(raw) => loop {
                match service.submit_signal(&raw).await {
                    Ok(_) => {
                        accepted += 1;
                        break;
                    }
                    Err(RelinkError::Backpressure { .. }) => {
                        // Replay is the only producer, so drain and retry
                        service.process_pending().await?;
                    }
                    Err(e) => {
                        warn!("Line {}: {}", line_no, e);
                        malformed += 1;
                        break;
                    }
                }
            },
            StreamEvent::Reset {
                old_epoch,
                new_epoch,
                occurred_at,
            } => {
                service.process_pending().await?;
                if let Err(e) = service
                    .submit_reset_event(old_epoch, new_epoch, occurred_at)
                    .await
                {
                    if e.is_fatal() {
                        return Err(e.into());
                    }
                    warn!("Line {}: {}", line_no, e);
                }
            }
        }

        if service.queued().await >= service.config().queue_capacity / 2 {
            service.process_pending().await?;
            service.finalize_expired().await?;
        }
    }

    service.flush().await?;
    service.finalize_expired().await?;
    if finalize {
        service.finalize_all().await?;
    }

    info!("Replayed {} signals ({} lines skipped)", accepted, malformed);

    let stats = service.get_report(&ReportFilter::default()).await;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    match service.verify_ledger().await {
        Ok(report) => {
            info!("Ledger verified: {} records, head {}", report.records, report.head);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn load_snapshot(path: &Path) -> anyhow::Result<LedgerSnapshot> {
    let (header, records) = read_ledger_file(path)
        .await
        .with_context(|| format!("cannot read ledger {}", path.display()))?;
    debug!(
        "Ledger {} (format {} v{}, created {})",
        header.ledger_id, header.format, header.version, header.created_at
    );
    Ok(LedgerSnapshot::from_records(records))
}

async fn verify(path: &Path) -> anyhow::Result<()> {
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("cannot read ledger {}", path.display()))?;
    match verify_bytes(&contents) {
        Ok(report) => {
            println!("OK: {} records, head {}", report.records, report.head);
            Ok(())
        }
        Err(RelinkError::LedgerIntegrity {
            sequence_number,
            reason,
        }) => {
            println!("BROKEN at sequence {}: {}", sequence_number, reason);
            bail!("ledger integrity check failed at sequence {}", sequence_number)
        }
        Err(e) => Err(e.into()),
    }
}

async fn report(path: &Path, filter: &ReportFilter) -> anyhow::Result<()> {
    let snapshot = load_snapshot(path).await?;
    if let Err(e) = snapshot.verify() {
        warn!("Reporting over an unverified ledger: {}", e);
    }
    let stats = summarize(&snapshot, filter);
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
