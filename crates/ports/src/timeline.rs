//! Event timeline port.

use async_trait::async_trait;
use serde_json::Value;
use spire_core::{RunId, Sequence};
use spire_execution::{Event, EventKind};

use crate::error::PortsError;

/// Append-only per-run event log.
#[async_trait]
pub trait EventTimeline: Send + Sync {
    /// Append an event, returning its sequence (1 for the first event).
    async fn append_event(
        &self,
        run_id: RunId,
        event_type: EventKind,
        payload: Value,
    ) -> Result<Sequence, PortsError>;

    /// Up to `limit` events with sequence greater than `after`, ascending.
    async fn read_events(
        &self,
        run_id: RunId,
        after: Sequence,
        limit: usize,
    ) -> Result<Vec<Event>, PortsError>;
}
