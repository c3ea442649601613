#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Spire Execution
//!
//! Execution-time concepts for the Spire durable execution core. This crate
//! does NOT contain the orchestrator; it defines the records and rules the
//! orchestrator and the store drivers agree on:
//!
//! - [`RunStatus`] and the state machine validated by the [`transition`] module
//! - [`Run`], [`Checkpoint`], [`Event`], [`Effect`], [`Ticket`] — durable records
//! - [`RunState`] — the versioned checkpoint payload
//! - [`TimelineEntry`] — typed timeline events
//! - [`idempotency`] — canonical parameter encoding and effect key derivation

pub mod checkpoint;
pub mod effect;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod run;
pub mod state;
pub mod status;
pub mod ticket;
pub mod transition;

pub use checkpoint::Checkpoint;
pub use effect::{Effect, EffectStatus};
pub use error::ExecutionError;
pub use event::{Event, EventKind, FailureKind, TimelineEntry};
pub use idempotency::{IdempotencyError, canonicalize, derive_effect_id};
pub use run::{Lease, Run};
pub use state::{DecisionRecord, Outcome, PendingCommit, RUN_STATE_SCHEMA_VERSION, RunState};
pub use status::RunStatus;
pub use ticket::{Decision, RiskLevel, Ticket, TicketStatus};
