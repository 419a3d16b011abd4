//! Configuration for the orchestrator.
//!
//! Sources (highest priority first):
//! 1. `LUCID_HOME` environment variable
//! 2. Config file (`$LUCID_HOME/config.yaml`)
//! 3. Defaults (`~/.lucid`)
//!
//! Every threshold is a configuration value with a default; none are
//! hard-coded in handlers. The loaded config is passed explicitly to the
//! scheduler and handlers — there is no process-wide config singleton.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::safety::SafetyLimits;
use crate::domain::Stage;

/// Reminder schedule for records stuck in monitored stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Stages whose dwell time is monitored
    #[serde(default = "default_reminder_stages")]
    pub stages: Vec<Stage>,

    /// Hours after stage entry at which each escalation fires, ascending
    #[serde(default = "default_reminder_thresholds")]
    pub thresholds_hours: Vec<u32>,

    /// Hours after stage entry at which the record expires
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u32,
}

fn default_reminder_stages() -> Vec<Stage> {
    vec![Stage::AwaitingTest, Stage::AwaitingReport]
}
fn default_reminder_thresholds() -> Vec<u32> {
    vec![72, 120, 144]
}
fn default_expiry_hours() -> u32 {
    168
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            stages: default_reminder_stages(),
            thresholds_hours: default_reminder_thresholds(),
            expiry_hours: default_expiry_hours(),
        }
    }
}

/// Endpoints and timeouts for the external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorConfig {
    #[serde(default = "default_automation_url")]
    pub automation_url: String,

    #[serde(default = "default_mail_endpoint")]
    pub mail_endpoint: String,

    /// Per external call, seconds; a timeout classifies as transient
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_automation_url() -> String {
    "http://127.0.0.1:9300".to_string()
}
fn default_mail_endpoint() -> String {
    "http://127.0.0.1:9301/messages".to_string()
}
fn default_call_timeout_secs() -> u64 {
    60
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            automation_url: default_automation_url(),
            mail_endpoint: default_mail_endpoint(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

/// Full orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// State directory; relative paths below resolve against it
    #[serde(skip)]
    pub home: PathBuf,

    #[serde(default = "default_db_file")]
    pub db_file: String,

    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: String,

    #[serde(default = "default_signals_dir")]
    pub signals_dir: String,

    #[serde(default = "default_reports_dir")]
    pub reports_dir: String,

    /// Max inbound payloads ingested per tick
    #[serde(default = "default_intake_batch")]
    pub intake_batch: usize,

    /// Max completion signals drained per tick
    #[serde(default = "default_signal_batch")]
    pub signal_batch: usize,

    /// Concurrent records processed per stage
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Stages skipped entirely (operational kill switch per stage)
    #[serde(default)]
    pub disabled_stages: Vec<Stage>,

    /// Minimum age of a test request before an operator resend is allowed,
    /// in hours
    #[serde(default = "default_resend_min_age_hours")]
    pub resend_min_age_hours: u32,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub safety: SafetyLimits,

    #[serde(default)]
    pub reminders: ReminderConfig,

    #[serde(default)]
    pub collaborators: CollaboratorConfig,
}

fn default_db_file() -> String {
    "lucid.db".to_string()
}
fn default_inbox_dir() -> String {
    "inbox".to_string()
}
fn default_signals_dir() -> String {
    "signals".to_string()
}
fn default_reports_dir() -> String {
    "reports".to_string()
}
fn default_intake_batch() -> usize {
    10
}
fn default_signal_batch() -> usize {
    10
}
fn default_parallelism() -> usize {
    4
}
fn default_resend_min_age_hours() -> u32 {
    168
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: PathBuf::new(),
            db_file: default_db_file(),
            inbox_dir: default_inbox_dir(),
            signals_dir: default_signals_dir(),
            reports_dir: default_reports_dir(),
            intake_batch: default_intake_batch(),
            signal_batch: default_signal_batch(),
            parallelism: default_parallelism(),
            disabled_stages: Vec::new(),
            resend_min_age_hours: default_resend_min_age_hours(),
            retry: RetryPolicy::default(),
            safety: SafetyLimits::default(),
            reminders: ReminderConfig::default(),
            collaborators: CollaboratorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration for the default home (`LUCID_HOME` or `~/.lucid`).
    pub fn load() -> Result<Self> {
        let home = match std::env::var("LUCID_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::home_dir()
                .context("failed to determine home directory")?
                .join(".lucid"),
        };
        Self::load_from(&home)
    }

    /// Load configuration rooted at an explicit home directory.
    pub fn load_from(home: &Path) -> Result<Self> {
        let config_path = home.join("config.yaml");

        let mut config: Config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read config: {}", config_path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config: {}", config_path.display()))?
        } else {
            Config::default()
        };

        config.home = home.to_path_buf();
        Ok(config)
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            self.home.join(path)
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.resolve(&self.db_file)
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.resolve(&self.inbox_dir)
    }

    pub fn signals_path(&self) -> PathBuf {
        self.resolve(&self.signals_dir)
    }

    pub fn reports_path(&self) -> PathBuf {
        self.resolve(&self.reports_dir)
    }

    pub fn stage_enabled(&self, stage: Stage) -> bool {
        !self.disabled_stages.contains(&stage)
    }

    pub fn call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.collaborators.call_timeout_secs)
    }
}
