#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Spire Ports
//!
//! Storage interface traits (ports) for the Spire durable execution core.
//!
//! This crate defines the **port** traits that store drivers implement,
//! following the Ports & Drivers (hexagonal) architecture pattern:
//!
//! - [`RunRepo`] -- runs, lease-based claims and fenced status changes
//! - [`CheckpointStore`] -- append-only run continuations
//! - [`EventTimeline`] -- append-only audit log
//! - [`EffectLedger`] -- exactly-once side-effect bookkeeping
//! - [`TicketStore`] -- human approval tickets with optimistic concurrency
//!
//! [`Store`] bundles all five; the engine holds an `Arc<dyn Store>`. All
//! traits are `async_trait` and object-safe.
//!
//! With the `test-util` feature, [`conformance`] exposes the contract suite
//! every driver runs against itself.

pub mod checkpoint;
pub mod effect;
pub mod error;
pub mod run;
pub mod ticket;
pub mod timeline;

#[cfg(any(test, feature = "test-util"))]
pub mod conformance;

pub use checkpoint::CheckpointStore;
pub use effect::{EffectLedger, NewEffect, PrepareOutcome};
pub use error::PortsError;
pub use run::{Claim, ClaimedRun, NewRun, RunRepo, lease_deadline};
pub use ticket::{DecideOutcome, NewTicket, TicketDecision, TicketFilter, TicketStore};
pub use timeline::EventTimeline;

/// Every port at once. Implemented for anything implementing all five.
pub trait Store: RunRepo + CheckpointStore + EventTimeline + EffectLedger + TicketStore {}

impl<T> Store for T where T: RunRepo + CheckpointStore + EventTimeline + EffectLedger + TicketStore + ?Sized {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: if this compiles, the traits are object-safe.
    #[test]
    fn traits_are_object_safe() {
        fn _assert_run_repo(_: &dyn RunRepo) {}
        fn _assert_checkpoint_store(_: &dyn CheckpointStore) {}
        fn _assert_event_timeline(_: &dyn EventTimeline) {}
        fn _assert_effect_ledger(_: &dyn EffectLedger) {}
        fn _assert_ticket_store(_: &dyn TicketStore) {}
        fn _assert_store(_: &dyn Store) {}
    }

    /// Verify the bundle can be shared the way the engine holds it.
    #[test]
    fn store_works_as_arc_dyn() {
        use std::sync::Arc;
        fn _takes_store(_: Arc<dyn Store>) {}
    }
}
