//! Control surface: the tenant-scoped operations exposed to callers.
//!
//! Every call carries a [`Caller`] supplied by the auth layer in front of the
//! engine. Rows owned by another tenant are reported as not found, never as
//! forbidden, so ids do not leak across tenants.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use spire_core::{CheckpointId, RunId, Sequence, TenantId, TicketId, WorkflowId};
use spire_execution::{
    Checkpoint, Decision, Event, Outcome, Run, RunStatus, Ticket, TicketStatus, TimelineEntry,
};
use spire_ports::{DecideOutcome, NewRun, Store, TicketDecision, TicketFilter};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::workflow::WorkflowRegistry;

/// Largest page returned by [`ControlSurface::get_events`].
pub const MAX_EVENT_PAGE: usize = 1000;
/// Largest page returned by [`ControlSurface::list_inbox`].
pub const MAX_INBOX_PAGE: usize = 500;

/// Identity of whoever is calling, as established by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Tenant every read and write is scoped to.
    pub tenant_id: TenantId,
    /// Principal recorded as `decided_by` and `requested_by`.
    pub principal: String,
}

impl Caller {
    /// A caller acting for `tenant_id`.
    pub fn new(tenant_id: TenantId, principal: impl Into<String>) -> Self {
        Self {
            tenant_id,
            principal: principal.into(),
        }
    }
}

/// Options for [`ControlSurface::start_run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartOptions {
    /// Lower runs first.
    pub priority: i32,
    /// Spawning run; must belong to the caller's tenant.
    pub parent_run_id: Option<RunId>,
    /// Caller-chosen run id. Random when unset.
    pub run_id: Option<RunId>,
}

/// Where a run stands, for dashboards and reviewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// The run.
    pub run_id: RunId,
    /// Current status.
    pub status: RunStatus,
    /// Latest checkpoint.
    pub checkpoint_id: Option<CheckpointId>,
    /// Index of the next step.
    pub position: usize,
    /// Name of the next step, `None` once past the end.
    pub next_step: Option<String>,
    /// Ticket waiting for a decision, if any.
    pub pending_ticket: Option<Ticket>,
    /// Latest failure reason.
    pub last_error: Option<String>,
    /// Terminal outcome once finished.
    pub outcome: Option<Outcome>,
}

/// Tenant-scoped operations on runs and tickets.
#[derive(Clone)]
pub struct ControlSurface {
    store: Arc<dyn Store>,
    workflows: Arc<WorkflowRegistry>,
}

impl ControlSurface {
    /// Create a control surface.
    pub fn new(store: Arc<dyn Store>, workflows: Arc<WorkflowRegistry>) -> Self {
        Self { store, workflows }
    }

    /// Queue a new run of `workflow_id`.
    ///
    /// Rejects unknown workflows, non-object inputs and parents owned by
    /// another tenant before anything is written.
    pub async fn start_run(
        &self,
        caller: &Caller,
        workflow_id: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<RunId, EngineError> {
        let workflow_id =
            WorkflowId::new(workflow_id).map_err(|err| EngineError::Validation(err.to_string()))?;
        if !self.workflows.contains(&workflow_id) {
            return Err(EngineError::Validation(format!(
                "workflow {workflow_id} is not registered"
            )));
        }
        if !input.is_object() {
            return Err(EngineError::Validation("input must be a JSON object".to_owned()));
        }
        if let Some(parent) = options.parent_run_id {
            self.owned_run(caller, parent).await?;
        }

        let new = NewRun {
            run_id: options.run_id.unwrap_or_else(RunId::v4),
            tenant_id: caller.tenant_id,
            workflow_id,
            parent_run_id: options.parent_run_id,
            priority: options.priority,
            input,
        };
        let run = self.store.create_run(new.clone()).await?;
        // A caller-chosen id that already exists is only a retry when every
        // field matches. Foreign and mismatched rows get the same answer.
        if !started_by(&run, &new) {
            return Err(EngineError::Conflict(format!(
                "run {} already exists with different parameters",
                new.run_id
            )));
        }
        info!(run_id = %run.run_id, workflow = %run.workflow_id, tenant = %caller.tenant_id, "run queued");
        Ok(run.run_id)
    }

    /// Fetch a run.
    pub async fn get_run(&self, caller: &Caller, run_id: RunId) -> Result<Run, EngineError> {
        self.owned_run(caller, run_id).await
    }

    /// Timeline events after `after`, at most `limit` (capped at [`MAX_EVENT_PAGE`]).
    pub async fn get_events(
        &self,
        caller: &Caller,
        run_id: RunId,
        after: Sequence,
        limit: usize,
    ) -> Result<Vec<Event>, EngineError> {
        self.owned_run(caller, run_id).await?;
        let limit = limit.clamp(1, MAX_EVENT_PAGE);
        Ok(self.store.read_events(run_id, after, limit).await?)
    }

    /// Every checkpoint of a run, ascending.
    pub async fn get_checkpoints(
        &self,
        caller: &Caller,
        run_id: RunId,
    ) -> Result<Vec<Checkpoint>, EngineError> {
        self.owned_run(caller, run_id).await?;
        Ok(self.store.checkpoint_history(run_id).await?)
    }

    /// Status, position and pending ticket of a run.
    pub async fn get_snapshot(&self, caller: &Caller, run_id: RunId) -> Result<Snapshot, EngineError> {
        let run = self.owned_run(caller, run_id).await?;
        let state = match self.store.latest_checkpoint(run_id).await? {
            Some(checkpoint) => Some(
                checkpoint
                    .state()
                    .map_err(|err| EngineError::InvalidState(err.to_string()))?,
            ),
            None => None,
        };
        let position = state.as_ref().map_or(0, |state| state.position);
        let next_step = self
            .workflows
            .get(&run.workflow_id)
            .and_then(|workflow| workflow.step_at(position).map(|step| step.name().to_owned()));
        let pending_ticket = match run.last_ticket_id {
            Some(ticket_id) => self
                .store
                .get_ticket(ticket_id)
                .await?
                .filter(|ticket| ticket.status == TicketStatus::Pending),
            None => None,
        };

        Ok(Snapshot {
            run_id,
            status: run.status,
            checkpoint_id: run.last_checkpoint_id,
            position,
            next_step,
            pending_ticket,
            last_error: run.last_error,
            outcome: state.and_then(|state| state.outcome),
        })
    }

    /// Approve the run's latest ticket.
    pub async fn resume_run(
        &self,
        caller: &Caller,
        run_id: RunId,
        payload: Value,
        expected: CheckpointId,
    ) -> Result<DecideOutcome, EngineError> {
        let run = self.owned_run(caller, run_id).await?;
        let ticket_id = run
            .last_ticket_id
            .ok_or_else(|| EngineError::not_found("pending ticket", run_id))?;
        self.decide(caller, ticket_id, Decision::Approve, payload, expected)
            .await
    }

    /// Tickets matching `filter` within the caller's tenant, newest first.
    pub async fn list_inbox(
        &self,
        caller: &Caller,
        mut filter: TicketFilter,
    ) -> Result<Vec<Ticket>, EngineError> {
        filter.tenant_id = Some(caller.tenant_id);
        filter.limit = Some(filter.effective_limit().clamp(1, MAX_INBOX_PAGE));
        Ok(self.store.list_tickets(&filter).await?)
    }

    /// Fetch a ticket.
    pub async fn get_ticket(&self, caller: &Caller, ticket_id: TicketId) -> Result<Ticket, EngineError> {
        self.store
            .get_ticket(ticket_id)
            .await?
            .filter(|ticket| ticket.tenant_id == caller.tenant_id)
            .ok_or_else(|| EngineError::not_found("ticket", ticket_id))
    }

    /// Approve or reject a ticket bound to checkpoint `expected`.
    pub async fn decide_ticket(
        &self,
        caller: &Caller,
        ticket_id: TicketId,
        decision: Decision,
        payload: Value,
        expected: CheckpointId,
    ) -> Result<DecideOutcome, EngineError> {
        self.get_ticket(caller, ticket_id).await?;
        self.decide(caller, ticket_id, decision, payload, expected).await
    }

    /// Ask a run to stop at its next step boundary.
    pub async fn cancel_run(
        &self,
        caller: &Caller,
        run_id: RunId,
        reason: &str,
    ) -> Result<Run, EngineError> {
        self.owned_run(caller, run_id).await?;
        let run = self.store.request_cancel(run_id, Utc::now()).await?;
        let entry = TimelineEntry::CancelRequested {
            reason: reason.to_owned(),
            requested_by: caller.principal.clone(),
        };
        let appended = match entry.payload() {
            Ok(payload) => self
                .store
                .append_event(run_id, entry.kind(), payload)
                .await
                .map(drop),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = appended {
            warn!(%run_id, error = %err, "failed to append cancel request event");
        }
        info!(%run_id, principal = %caller.principal, %reason, "cancel requested");
        Ok(run)
    }

    async fn decide(
        &self,
        caller: &Caller,
        ticket_id: TicketId,
        decision: Decision,
        payload: Value,
        expected: CheckpointId,
    ) -> Result<DecideOutcome, EngineError> {
        let payload = if payload.is_null() { json!({}) } else { payload };
        let outcome = self
            .store
            .decide_ticket(
                ticket_id,
                TicketDecision {
                    decision,
                    payload,
                    decided_by: Some(caller.principal.clone()),
                },
                expected,
                Utc::now(),
            )
            .await?;
        if let DecideOutcome::Applied(ticket) = &outcome {
            info!(%ticket_id, run_id = %ticket.run_id, status = %ticket.status, principal = %caller.principal, "ticket decided");
        }
        Ok(outcome)
    }

    async fn owned_run(&self, caller: &Caller, run_id: RunId) -> Result<Run, EngineError> {
        self.store
            .get_run(run_id)
            .await?
            .filter(|run| run.tenant_id == caller.tenant_id)
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }
}

fn started_by(run: &Run, new: &NewRun) -> bool {
    run.tenant_id == new.tenant_id
        && run.workflow_id == new.workflow_id
        && run.parent_run_id == new.parent_run_id
        && run.priority == new.priority
        && run.input == new.input
}

impl std::fmt::Debug for ControlSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSurface").finish_non_exhaustive()
    }
}
