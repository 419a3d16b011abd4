//! Command-line interface for lucid.
//!
//! Provides commands for running ticks (one-shot or on an interval),
//! inspecting referrals and their event history, and operator actions
//! like resending a test request.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::adapters::{
    FileIntakeSource, FileSignalSource, HttpAutomationService, HttpMailTransport,
    StructuredReportRenderer,
};
use crate::config::Config;
use crate::core::{Collaborators, RecordStore, Scheduler};
use crate::domain::Stage;

/// lucid - referral lifecycle orchestrator
#[derive(Parser, Debug)]
#[command(name = "lucid")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single tick over all records
    Tick,

    /// Run ticks continuously on an interval
    Run {
        /// Seconds between ticks
        #[arg(short, long, env = "LUCID_TICK_INTERVAL", default_value = "300")]
        interval: u64,
    },

    /// Show one referral and its current stage
    Status {
        /// Referral ID
        referral_id: String,
    },

    /// List referrals
    List {
        /// Filter by stage
        #[arg(short, long)]
        stage: Option<String>,

        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show the event history of a referral
    Events {
        /// Referral ID
        referral_id: String,
    },

    /// Re-dispatch a test request whose link went unused
    Resend {
        /// Referral ID
        referral_id: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = Config::load()?;
        match self.command {
            Commands::Tick => run_tick(config).await,
            Commands::Run { interval } => run_loop(config, interval).await,
            Commands::Status { referral_id } => show_status(config, &referral_id),
            Commands::List { stage, limit } => list_referrals(config, stage, limit),
            Commands::Events { referral_id } => show_events(config, &referral_id),
            Commands::Resend { referral_id } => resend(config, &referral_id).await,
            Commands::Config => show_config(config),
        }
    }
}

fn open_store(config: &Config) -> Result<Arc<RecordStore>> {
    if let Some(parent) = config.db_path().parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create state directory: {}", parent.display()))?;
    }
    let store = RecordStore::open(&config.db_path())
        .with_context(|| format!("failed to open database: {}", config.db_path().display()))?;
    Ok(Arc::new(store))
}

fn build_scheduler(config: Config) -> Result<Scheduler> {
    let store = open_store(&config)?;
    let timeout = config.call_timeout();
    let collaborators = Collaborators {
        intake: Arc::new(FileIntakeSource::new(config.inbox_path())),
        automation: Arc::new(HttpAutomationService::new(
            config.collaborators.automation_url.clone(),
            timeout,
        )?),
        signals: Arc::new(FileSignalSource::new(config.signals_path())),
        renderer: Arc::new(StructuredReportRenderer::new()),
        transport: Arc::new(HttpMailTransport::new(
            config.collaborators.mail_endpoint.clone(),
            timeout,
        )?),
    };
    Ok(Scheduler::new(config, store, collaborators))
}

/// Run one tick. Exits nonzero when any record failed terminally, so cron
/// and operators notice.
async fn run_tick(config: Config) -> Result<()> {
    let scheduler = build_scheduler(config)?;
    let report = scheduler.run_tick(Utc::now()).await?;

    println!(
        "examined {}  advanced {}  held {}  retried {}  denied {}  reminders {}",
        report.examined,
        report.advanced,
        report.held,
        report.retried,
        report.denied,
        report.reminders_sent
    );
    if report.had_terminal_failures() {
        anyhow::bail!(
            "{} record(s) reached a terminal failure state",
            report.failed + report.expired
        );
    }
    if report.store_errors > 0 {
        anyhow::bail!(
            "{} record update(s) failed on the store; no transitions were lost",
            report.store_errors
        );
    }
    Ok(())
}

/// Run ticks on an interval until interrupted. Individual terminal failures
/// are logged, not fatal; the loop keeps the rest of the records moving.
async fn run_loop(config: Config, interval_secs: u64) -> Result<()> {
    let scheduler = build_scheduler(config)?;
    let shutdown = scheduler.shutdown_flag();

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("shutdown requested, finishing current record");
                shutdown.store(true, Ordering::SeqCst);
            }
        }
    });

    let mut timer = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = scheduler.run_tick(Utc::now()).await {
            eprintln!("tick failed: {e:#}");
        }
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }
    Ok(())
}

fn show_status(config: Config, referral_id: &str) -> Result<()> {
    let store = open_store(&config)?;
    let referral = store
        .get(referral_id)?
        .with_context(|| format!("no referral with id {referral_id}"))?;

    println!("Referral: {}", referral.id);
    println!("Stage: {}", referral.stage.as_str());
    println!("Entered stage: {}", referral.stage_entered_at);
    println!("Attempts: {}", referral.attempt_count);
    if let Some(next) = referral.next_attempt_at {
        println!("Next attempt: {next}");
    }
    if let Some(error) = &referral.last_error {
        println!("Last error: {error}");
    }
    if let Some(link) = &referral.test_link {
        println!("Test link: {link}");
    }
    if let Some(path) = &referral.processed_report_path {
        println!("Processed report: {path}");
    }
    println!("Reminders sent: {}", referral.reminder_level);
    if referral.resend_count > 0 {
        println!("Resends: {}", referral.resend_count);
    }
    Ok(())
}

fn list_referrals(config: Config, stage: Option<String>, limit: usize) -> Result<()> {
    let stage = match stage {
        Some(name) => Some(
            Stage::parse(&name).with_context(|| format!("unknown stage: {name}"))?,
        ),
        None => None,
    };
    let store = open_store(&config)?;
    let referrals = store.list(stage, limit)?;
    if referrals.is_empty() {
        println!("No referrals found");
        return Ok(());
    }

    println!("{:<26} {:<17} {:<8} RECEIVED", "ID", "STAGE", "ATTEMPTS");
    for referral in referrals {
        println!(
            "{:<26} {:<17} {:<8} {}",
            referral.id,
            referral.stage.as_str(),
            referral.attempt_count,
            referral.received_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn show_events(config: Config, referral_id: &str) -> Result<()> {
    let store = open_store(&config)?;
    let events = store.events_for(referral_id)?;
    if events.is_empty() {
        println!("No events for {referral_id}");
        return Ok(());
    }

    for event in events {
        let transition = match (event.from_stage, event.to_stage) {
            (Some(from), Some(to)) => format!("{} -> {}", from.as_str(), to.as_str()),
            (Some(from), None) => from.as_str().to_string(),
            _ => String::new(),
        };
        print!(
            "{:>3}  {}  {:<20} {:<30}",
            event.seq,
            event.at.format("%Y-%m-%d %H:%M:%S"),
            event.outcome.as_str(),
            transition
        );
        println!("  {}", event.detail);
        if let Some(error) = event.error {
            println!("     error: {error}");
        }
    }
    Ok(())
}

async fn resend(config: Config, referral_id: &str) -> Result<()> {
    let scheduler = build_scheduler(config)?;
    let updated = scheduler.resend_test_request(referral_id, Utc::now()).await?;
    println!(
        "Resent test request for {} (resend #{}, reference {})",
        updated.id,
        updated.resend_count,
        updated.request_receipt.as_deref().unwrap_or("-")
    );
    Ok(())
}

fn show_config(config: Config) -> Result<()> {
    println!("home: {}", config.home.display());
    let rendered = serde_yaml::to_string(&config).context("failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
