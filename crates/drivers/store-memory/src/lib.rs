#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Spire Memory Store
//!
//! In-memory driver implementing every Spire port behind one
//! [`parking_lot::Mutex`]. Each port call takes the lock once, so every call
//! is atomic with respect to every other call.
//!
//! Suitable for tests and single-process deployments where durability across
//! process restarts is not required.
//!
//! ```rust,ignore
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use spire_core::{CheckpointId, EffectId, RunId, Sequence, TicketId, WorkerId};
use spire_execution::transition::can_transition_run;
use spire_execution::{
    Checkpoint, Effect, EffectStatus, Event, EventKind, Lease, Run, RunStatus, Ticket,
    TicketStatus,
};
use spire_ports::{
    CheckpointStore, Claim, ClaimedRun, DecideOutcome, EffectLedger, EventTimeline, NewEffect,
    NewRun, NewTicket, PortsError, PrepareOutcome, RunRepo, TicketDecision, TicketFilter,
    TicketStore, lease_deadline,
};
use uuid::Uuid;

#[derive(Debug)]
struct RunRow {
    run: Run,
    /// Insertion order, the last claim tie-breaker.
    created_seq: u64,
}

#[derive(Debug, Default)]
struct State {
    runs: HashMap<RunId, RunRow>,
    checkpoints: HashMap<RunId, Vec<Checkpoint>>,
    events: HashMap<RunId, Vec<Event>>,
    effects: HashMap<EffectId, Effect>,
    effect_order: Vec<EffectId>,
    tickets: HashMap<TicketId, Ticket>,
    next_seq: u64,
}

impl State {
    fn run_mut(&mut self, run_id: RunId) -> Result<&mut Run, PortsError> {
        self.runs
            .get_mut(&run_id)
            .map(|row| &mut row.run)
            .ok_or_else(|| PortsError::not_found("run", run_id))
    }

    fn fenced_run_mut(&mut self, claim: &Claim) -> Result<&mut Run, PortsError> {
        let run = self.run_mut(claim.run_id)?;
        let held = run.lease.as_ref().is_some_and(|l| l.token == claim.token);
        if held {
            Ok(run)
        } else {
            Err(PortsError::lease_unavailable(claim.run_id))
        }
    }

    fn is_claimable(&self, run: &Run, now: DateTime<Utc>) -> bool {
        if run.status.is_terminal() || run.is_claimed(now) {
            return false;
        }
        match run.status {
            RunStatus::Queued | RunStatus::Running => true,
            RunStatus::WaitingApproval => {
                run.cancel_requested()
                    || run
                        .last_ticket_id
                        .and_then(|id| self.tickets.get(&id))
                        .is_some_and(|t| t.status.is_final())
            }
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled => false,
        }
    }

    fn effect_mut(&mut self, effect_id: &EffectId) -> Result<&mut Effect, PortsError> {
        self.effects
            .get_mut(effect_id)
            .ok_or_else(|| PortsError::not_found("effect", effect_id))
    }
}

/// In-memory implementation of every Spire port.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepo for MemoryStore {
    async fn create_run(&self, new: NewRun) -> Result<Run, PortsError> {
        let now = Utc::now();
        let mut state = self.state.lock();
        if let Some(existing) = state.runs.get(&new.run_id) {
            return Ok(existing.run.clone());
        }
        let run = Run {
            run_id: new.run_id,
            tenant_id: new.tenant_id,
            workflow_id: new.workflow_id,
            parent_run_id: new.parent_run_id,
            status: RunStatus::Queued,
            priority: new.priority,
            input: new.input,
            last_checkpoint_id: None,
            last_ticket_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            last_error: None,
            cancel_requested_at: None,
            lease: None,
        };
        state.next_seq += 1;
        let created_seq = state.next_seq;
        state.runs.insert(
            run.run_id,
            RunRow {
                run: run.clone(),
                created_seq,
            },
        );
        Ok(run)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, PortsError> {
        Ok(self.state.lock().runs.get(&run_id).map(|row| row.run.clone()))
    }

    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRun>, PortsError> {
        let mut state = self.state.lock();
        let best = state
            .runs
            .values()
            .filter(|row| state.is_claimable(&row.run, now))
            .min_by_key(|row| (row.run.priority, row.run.updated_at, row.created_seq))
            .map(|row| row.run.run_id);
        let Some(run_id) = best else {
            return Ok(None);
        };

        let lease = Lease {
            worker_id: worker_id.clone(),
            token: Uuid::new_v4(),
            expires_at: lease_deadline(now, ttl),
        };
        let run = state.run_mut(run_id)?;
        run.lease = Some(lease.clone());
        run.updated_at = now;
        tracing::debug!(%run_id, worker = %worker_id, "run claimed");
        Ok(Some(ClaimedRun {
            run: run.clone(),
            claim: Claim {
                run_id,
                worker_id: lease.worker_id,
                token: lease.token,
                expires_at: lease.expires_at,
            },
        }))
    }

    async fn renew_claim(
        &self,
        claim: &Claim,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Claim, PortsError> {
        let mut state = self.state.lock();
        let run = state.fenced_run_mut(claim)?;
        let expires_at = lease_deadline(now, ttl);
        if let Some(lease) = run.lease.as_mut() {
            lease.expires_at = expires_at;
        }
        Ok(Claim {
            expires_at,
            ..claim.clone()
        })
    }

    async fn release_claim(&self, claim: &Claim) -> Result<(), PortsError> {
        let mut state = self.state.lock();
        if let Ok(run) = state.fenced_run_mut(claim) {
            run.lease = None;
        }
        Ok(())
    }

    async fn transition(
        &self,
        claim: &Claim,
        to: RunStatus,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Run, PortsError> {
        let mut state = self.state.lock();
        let run = state.fenced_run_mut(claim)?;
        if !can_transition_run(run.status, to) {
            return Err(PortsError::InvalidTransition {
                run_id: run.run_id.to_string(),
                from: run.status.to_string(),
                to: to.to_string(),
            });
        }
        run.status = to;
        run.updated_at = now;
        if to == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if to.is_terminal() {
            run.finished_at = Some(now);
        }
        if to.is_terminal() || to.is_parked() {
            run.lease = None;
        }
        if last_error.is_some() {
            run.last_error = last_error;
        }
        Ok(run.clone())
    }

    async fn request_cancel(&self, run_id: RunId, now: DateTime<Utc>) -> Result<Run, PortsError> {
        let mut state = self.state.lock();
        let run = state.run_mut(run_id)?;
        if run.status.is_terminal() {
            return Err(PortsError::invalid_state("run", run_id, "non-terminal", run.status));
        }
        if run.cancel_requested_at.is_none() {
            run.cancel_requested_at = Some(now);
            run.updated_at = now;
        }
        Ok(run.clone())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn append_checkpoint(
        &self,
        run_id: RunId,
        state_payload: Value,
    ) -> Result<CheckpointId, PortsError> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let run = state.run_mut(run_id)?;
        let checkpoint_id = run
            .last_checkpoint_id
            .map_or(CheckpointId::FIRST, CheckpointId::next);
        run.last_checkpoint_id = Some(checkpoint_id);
        run.updated_at = now;
        state.checkpoints.entry(run_id).or_default().push(Checkpoint {
            run_id,
            checkpoint_id,
            state_payload,
            created_at: now,
        });
        Ok(checkpoint_id)
    }

    async fn latest_checkpoint(&self, run_id: RunId) -> Result<Option<Checkpoint>, PortsError> {
        Ok(self
            .state
            .lock()
            .checkpoints
            .get(&run_id)
            .and_then(|cps| cps.last().cloned()))
    }

    async fn get_checkpoint(
        &self,
        run_id: RunId,
        checkpoint_id: CheckpointId,
    ) -> Result<Option<Checkpoint>, PortsError> {
        Ok(self.state.lock().checkpoints.get(&run_id).and_then(|cps| {
            cps.iter()
                .find(|cp| cp.checkpoint_id == checkpoint_id)
                .cloned()
        }))
    }

    async fn checkpoint_history(&self, run_id: RunId) -> Result<Vec<Checkpoint>, PortsError> {
        Ok(self
            .state
            .lock()
            .checkpoints
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventTimeline for MemoryStore {
    async fn append_event(
        &self,
        run_id: RunId,
        event_type: EventKind,
        payload: Value,
    ) -> Result<Sequence, PortsError> {
        let mut state = self.state.lock();
        if !state.runs.contains_key(&run_id) {
            return Err(PortsError::not_found("run", run_id));
        }
        let events = state.events.entry(run_id).or_default();
        let sequence = events.last().map_or(Sequence::ZERO, |e| e.sequence).next();
        events.push(Event {
            run_id,
            sequence,
            event_type,
            payload,
            created_at: Utc::now(),
        });
        Ok(sequence)
    }

    async fn read_events(
        &self,
        run_id: RunId,
        after: Sequence,
        limit: usize,
    ) -> Result<Vec<Event>, PortsError> {
        Ok(self
            .state
            .lock()
            .events
            .get(&run_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl EffectLedger for MemoryStore {
    async fn prepare_effect(&self, new: NewEffect) -> Result<PrepareOutcome, PortsError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.effects.get(&new.effect_id) {
            return Ok(PrepareOutcome::AlreadyExists(existing.clone()));
        }
        let effect = Effect {
            effect_id: new.effect_id.clone(),
            run_id: new.run_id,
            action: new.action,
            status: EffectStatus::Prepared,
            prepared_payload: new.params,
            result_payload: None,
            ticket_id: new.ticket_id,
            created_at: Utc::now(),
            committed_at: None,
        };
        state.effect_order.push(new.effect_id.clone());
        state.effects.insert(new.effect_id, effect.clone());
        Ok(PrepareOutcome::Prepared(effect))
    }

    async fn commit_effect(&self, effect_id: &EffectId, result: Value) -> Result<Effect, PortsError> {
        let mut state = self.state.lock();
        let effect = state.effect_mut(effect_id)?;
        if effect.status != EffectStatus::Prepared {
            return Err(PortsError::invalid_state(
                "effect",
                effect_id,
                EffectStatus::Prepared,
                effect.status,
            ));
        }
        effect.status = EffectStatus::Committed;
        effect.result_payload = Some(result);
        effect.committed_at = Some(Utc::now());
        Ok(effect.clone())
    }

    async fn abort_effect(&self, effect_id: &EffectId) -> Result<Effect, PortsError> {
        let mut state = self.state.lock();
        let effect = state.effect_mut(effect_id)?;
        match effect.status {
            EffectStatus::Prepared => effect.status = EffectStatus::Aborted,
            EffectStatus::Aborted => {}
            EffectStatus::Committed => {
                return Err(PortsError::invalid_state(
                    "effect",
                    effect_id,
                    EffectStatus::Prepared,
                    effect.status,
                ));
            }
        }
        Ok(effect.clone())
    }

    async fn lookup_effect(&self, effect_id: &EffectId) -> Result<Option<Effect>, PortsError> {
        Ok(self.state.lock().effects.get(effect_id).cloned())
    }

    async fn effects_for_run(&self, run_id: RunId) -> Result<Vec<Effect>, PortsError> {
        let state = self.state.lock();
        Ok(state
            .effect_order
            .iter()
            .filter_map(|id| state.effects.get(id))
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    async fn create_ticket(&self, new: NewTicket, now: DateTime<Utc>) -> Result<Ticket, PortsError> {
        let mut state = self.state.lock();
        let run = state.run_mut(new.run_id)?;
        run.last_ticket_id = Some(new.ticket_id);
        run.updated_at = now;
        if let Some(existing) = state.tickets.get(&new.ticket_id) {
            return Ok(existing.clone());
        }
        let ticket = Ticket {
            ticket_id: new.ticket_id,
            tenant_id: new.tenant_id,
            run_id: new.run_id,
            checkpoint_id: new.checkpoint_id,
            interrupt_id: new.interrupt_id,
            status: TicketStatus::Pending,
            risk_level: new.risk_level,
            context_pack: new.context_pack,
            decision_payload: None,
            decided_by: None,
            effect_id: new.effect_id,
            expected_checkpoint_id: new.checkpoint_id,
            created_at: now,
            decided_at: None,
            expires_at: new.expires_at,
        };
        state.tickets.insert(ticket.ticket_id, ticket.clone());
        Ok(ticket)
    }

    async fn get_ticket(&self, ticket_id: TicketId) -> Result<Option<Ticket>, PortsError> {
        Ok(self.state.lock().tickets.get(&ticket_id).cloned())
    }

    async fn decide_ticket(
        &self,
        ticket_id: TicketId,
        decision: TicketDecision,
        expected: CheckpointId,
        now: DateTime<Utc>,
    ) -> Result<DecideOutcome, PortsError> {
        let mut state = self.state.lock();
        let ticket = state
            .tickets
            .get(&ticket_id)
            .ok_or_else(|| PortsError::not_found("ticket", ticket_id))?;

        if ticket.records(decision.decision, &decision.payload) {
            return Ok(DecideOutcome::Unchanged(ticket.clone()));
        }
        if expected != ticket.expected_checkpoint_id {
            return Err(PortsError::conflict(
                "ticket",
                ticket_id,
                expected.get(),
                ticket.expected_checkpoint_id.get(),
            ));
        }
        let current = state
            .runs
            .get(&ticket.run_id)
            .and_then(|row| row.run.last_checkpoint_id);
        if current != Some(expected) {
            return Err(PortsError::conflict(
                "ticket",
                ticket_id,
                expected.get(),
                current.map_or(0, CheckpointId::get),
            ));
        }
        if ticket.status.is_final() {
            return Err(PortsError::AlreadyDecided {
                ticket_id: ticket_id.to_string(),
                status: ticket.status.to_string(),
            });
        }

        let run_id = ticket.run_id;
        let Some(ticket) = state.tickets.get_mut(&ticket_id) else {
            return Err(PortsError::not_found("ticket", ticket_id));
        };
        ticket.status = decision.decision.resulting_status();
        ticket.decision_payload = Some(decision.payload);
        ticket.decided_by = decision.decided_by;
        ticket.decided_at = Some(now);
        let decided = ticket.clone();
        if let Ok(run) = state.run_mut(run_id) {
            run.updated_at = now;
        }
        Ok(DecideOutcome::Applied(decided))
    }

    async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, PortsError> {
        let state = self.state.lock();
        let mut tickets: Vec<Ticket> = state
            .tickets
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tickets.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.ticket_id.cmp(&a.ticket_id))
        });
        tickets.truncate(filter.effective_limit());
        Ok(tickets)
    }

    async fn expire_overdue_tickets(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>, PortsError> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        for ticket in state.tickets.values_mut().filter(|t| t.is_overdue(now)) {
            ticket.status = TicketStatus::Expired;
            ticket.decided_at = Some(now);
            expired.push(ticket.clone());
        }
        Ok(expired)
    }

    async fn expire_ticket(&self, ticket_id: TicketId, now: DateTime<Utc>) -> Result<Ticket, PortsError> {
        let mut state = self.state.lock();
        let ticket = state
            .tickets
            .get_mut(&ticket_id)
            .ok_or_else(|| PortsError::not_found("ticket", ticket_id))?;
        match ticket.status {
            TicketStatus::Pending => {
                ticket.status = TicketStatus::Expired;
                ticket.decided_at = Some(now);
            }
            TicketStatus::Expired => {}
            TicketStatus::Approved | TicketStatus::Rejected => {
                return Err(PortsError::AlreadyDecided {
                    ticket_id: ticket_id.to_string(),
                    status: ticket.status.to_string(),
                });
            }
        }
        Ok(ticket.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spire_ports::Store;
    use std::sync::Arc;

    #[test]
    fn is_a_store() {
        fn _takes_store(_: Arc<dyn Store>) {}
        _takes_store(Arc::new(MemoryStore::new()));
    }
}
