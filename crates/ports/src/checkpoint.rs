//! Durable checkpoint store port.

use async_trait::async_trait;
use serde_json::Value;
use spire_core::{CheckpointId, RunId};
use spire_execution::Checkpoint;

use crate::error::PortsError;

/// Append-only, per-run ordered checkpoint storage.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append the next checkpoint and advance `run.last_checkpoint_id` in the
    /// same atomic write. Unknown runs fail with `NotFound`.
    async fn append_checkpoint(
        &self,
        run_id: RunId,
        state_payload: Value,
    ) -> Result<CheckpointId, PortsError>;

    /// The newest checkpoint of a run.
    async fn latest_checkpoint(&self, run_id: RunId) -> Result<Option<Checkpoint>, PortsError>;

    /// One checkpoint by id.
    async fn get_checkpoint(
        &self,
        run_id: RunId,
        checkpoint_id: CheckpointId,
    ) -> Result<Option<Checkpoint>, PortsError>;

    /// Every checkpoint of a run, ascending.
    async fn checkpoint_history(&self, run_id: RunId) -> Result<Vec<Checkpoint>, PortsError>;
}
