//! lucid - referral lifecycle orchestrator
//!
//! A periodic tick controller that advances referral records through a
//! fixed pipeline: intake, test request, report monitoring, report
//! processing, and delivery, with reminder escalation and safety limits
//! on every outward dispatch.
//!
//! # Architecture
//!
//! The persisted stage is the single source of truth:
//! - Every transition goes through a compare-and-swap on the record store
//! - Every attempt is recorded in an append-only event log
//! - External dispatches are claimed before they fire, so a crash between
//!   dispatch and persist is recovered idempotently, never re-fired blind
//!
//! # Modules
//!
//! - `adapters`: External collaborators (intake, automation, mail, renderer)
//! - `core`: Orchestration logic (RecordStore, Scheduler, Governor)
//! - `domain`: Data structures (Referral, Stage, StageEvent)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run one tick
//! lucid tick
//!
//! # Run continuously, a tick every five minutes
//! lucid run --interval 300
//!
//! # Inspect a referral
//! lucid status <referral-id>
//! lucid events <referral-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::Config;
pub use core::{Collaborators, Governor, RecordStore, Scheduler, TickReport};
pub use domain::{EventOutcome, InboundReferral, Referral, Stage, StageEvent};
