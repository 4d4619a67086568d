//! # Cadence: routine scheduler daemon
//!
//! Usage:
//!   cadence run                          # Run the scheduler loop (Ctrl-C to stop)
//!   cadence run --db /tmp/cadence.db -v  # Custom database, debug logging
//!   cadence expand --start 2024-01-01T09:00 --tz Asia/Tehran --freq weekly --weekdays mon,wed --count 4
//!   cadence init-config                  # Write ~/.cadence/config.toml

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use cadence_core::CadenceConfig;
use cadence_core::types::{RecurrenceRule, Schedule, TimeWindow};
use cadence_scheduler::recurrence;
use cadence_scheduler::{SchedulerEngine, SqliteStore, sender_from_config, spawn_scheduler};
use chrono::{Duration, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence", version, about = "📅 Cadence: recurring routine scheduler")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the lifecycle tick and reminder scan loop
    Run {
        /// Config file (default: ~/.cadence/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Database path (overrides config)
        #[arg(long)]
        db: Option<String>,
    },
    /// Print the occurrences a schedule generates
    Expand {
        /// Local start, e.g. 2024-01-01T09:00
        #[arg(long)]
        start: String,

        /// IANA time zone
        #[arg(long, default_value = "UTC")]
        tz: String,

        /// daily | weekly | monthly (omit for a one-time schedule)
        #[arg(long)]
        freq: Option<String>,

        #[arg(long, default_value = "1")]
        interval: u32,

        /// Comma-separated weekdays, e.g. mon,wed
        #[arg(long)]
        weekdays: Option<String>,

        #[arg(long)]
        count: Option<u32>,

        /// Inclusive last local date, e.g. 2024-06-30
        #[arg(long)]
        until: Option<String>,

        /// Duration in minutes
        #[arg(long, default_value = "60")]
        duration: u32,

        /// Window start (UTC, RFC 3339). Defaults to the schedule start.
        #[arg(long)]
        from: Option<String>,

        /// Window end (UTC, RFC 3339). Defaults to one year after the window start.
        #[arg(long)]
        to: Option<String>,
    },
    /// Write the default config file
    InitConfig,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn parse_local(s: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .with_context(|| format!("invalid local date-time '{s}'"))
}

fn parse_utc(s: &str) -> Result<chrono::DateTime<Utc>> {
    Ok(chrono::DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid RFC 3339 instant '{s}'"))?
        .with_timezone(&Utc))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "cadence=debug,cadence_scheduler=debug"
    } else {
        "cadence=info,cadence_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match cli.command {
        Command::Run { config, db } => run(config.as_deref(), db).await,
        Command::Expand {
            start,
            tz,
            freq,
            interval,
            weekdays,
            count,
            until,
            duration,
            from,
            to,
        } => {
            let start_local = parse_local(&start)?;
            let schedule = match freq {
                None => Schedule::one_time(start_local, duration, &tz),
                Some(f) => {
                    let frequency = recurrence::parse_frequency(&f)
                        .with_context(|| format!("unknown frequency '{f}'"))?;
                    let mut rule = RecurrenceRule { frequency, ..RecurrenceRule::daily(interval) };
                    if let Some(list) = weekdays {
                        rule.weekdays = Some(recurrence::parse_weekdays(&list)?);
                    }
                    rule.count = count;
                    if let Some(u) = until {
                        rule.until = Some(
                            chrono::NaiveDate::parse_from_str(&u, "%Y-%m-%d")
                                .with_context(|| format!("invalid date '{u}'"))?,
                        );
                    }
                    Schedule::recurring(start_local, duration, &tz, rule)
                }
            };
            let zone = recurrence::validate(&schedule)?;
            let window_start = match from {
                Some(s) => parse_utc(&s)?,
                None => recurrence::to_utc(&zone, start_local),
            };
            let window_end = match to {
                Some(s) => parse_utc(&s)?,
                None => window_start + Duration::days(366),
            };

            let window = TimeWindow::new(window_start, window_end);
            let mut n = 0;
            for w in recurrence::expand(&schedule, window)? {
                n += 1;
                println!(
                    "{:>4}  {}  →  {}  ({} UTC)",
                    n,
                    w.start.with_timezone(&zone).format("%a %Y-%m-%d %H:%M %Z"),
                    w.end.with_timezone(&zone).format("%H:%M"),
                    w.start.format("%Y-%m-%d %H:%M"),
                );
            }
            if n == 0 {
                println!("(no occurrences in window)");
            }
            Ok(())
        }
        Command::InitConfig => {
            let path = CadenceConfig::default_path();
            if path.exists() {
                println!("⚠️  Config already exists: {}", path.display());
                return Ok(());
            }
            CadenceConfig::default().save_to(&path)?;
            println!("✅ Config written to {}", path.display());
            Ok(())
        }
    }
}

async fn run(config_path: Option<&Path>, db: Option<String>) -> Result<()> {
    let config = match config_path {
        Some(p) => CadenceConfig::load_from(p)?,
        None => CadenceConfig::load()?,
    };
    let db_path = expand_path(db.as_deref().unwrap_or(&config.database_path));
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let store = Arc::new(SqliteStore::open(Path::new(&db_path))?);
    let sender = sender_from_config(&config.notify);
    let engine = Arc::new(SchedulerEngine::new(store, sender, &config.scheduler));

    tracing::info!("📅 Cadence running (db: {})", db_path);
    tokio::select! {
        _ = spawn_scheduler(engine) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("👋 Shutting down");
        }
    }
    Ok(())
}
