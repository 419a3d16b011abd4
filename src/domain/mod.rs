//! Domain types for the referral orchestrator.
//!
//! - Referral: the central tracked entity and its lifecycle stages
//! - StageEvent: immutable audit records of every transition attempt

pub mod events;
pub mod referral;

pub use events::{EventOutcome, StageEvent};
pub use referral::{dispatch_token, hash_natural_key, InboundReferral, Referral, Stage};
