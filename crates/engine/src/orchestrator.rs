//! Run orchestrator.
//!
//! Drives one claimed run from its latest checkpoint until it parks on a
//! ticket, reaches a terminal status, or loses its claim. All progress is
//! persisted before it is acted upon:
//!
//! - a checkpoint is written after every step;
//! - an effect result is checkpointed (as `pending_commit`) **before** the
//!   ledger row is committed, so a crash in between is settled on recovery;
//! - a committed effect is never invoked again; its stored result is reused.
//!
//! Failures are split three ways. Transient store errors release the claim so
//! the run can be picked up again. Step and action failures fail the run with
//! a `step:` reason. Inconsistencies the engine cannot reason about fail the
//! run with a `fatal:` reason.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use spire_core::{CheckpointId, EffectId, TicketId, ticket_id_for};
use spire_execution::{
    Decision, DecisionRecord, EffectStatus, ExecutionError, FailureKind, Outcome, PendingCommit,
    Run, RunState, RunStatus, Ticket, TicketStatus, TimelineEntry, derive_effect_id,
};
use spire_ports::{Claim, ClaimedRun, NewEffect, NewTicket, PortsError, Store, lease_deadline};
use spire_telemetry::{RunNotification, Telemetry, names};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::action::{ActionCall, ActionError, ActionRegistry};
use crate::config::EngineConfig;
use crate::step::{ApprovalRequest, EffectRequest, Step, StepContext, StepError, StepOutcome};
use crate::workflow::{Workflow, WorkflowRegistry};

/// How a call to [`Orchestrator::drive`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Every step finished.
    Completed,
    /// The run failed.
    Failed,
    /// The run was canceled.
    Canceled,
    /// The run is waiting for a decision and holds no claim.
    Parked,
    /// The claim was given back without progress; the run is claimable again.
    Released,
    /// Another worker owns the run now.
    LeaseLost,
}

/// Why driving stopped early.
enum Halt {
    Fatal(String),
    Store(PortsError),
}

impl From<PortsError> for Halt {
    fn from(err: PortsError) -> Self {
        if err.is_retryable() || matches!(err, PortsError::LeaseUnavailable { .. }) {
            Self::Store(err)
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

impl From<ExecutionError> for Halt {
    fn from(err: ExecutionError) -> Self {
        Self::Fatal(err.to_string())
    }
}

/// Whether the step loop keeps going after a decision was applied.
enum Flow {
    Continue,
    Stop(Disposition),
}

struct Failure {
    kind: FailureKind,
    error: String,
    step: Option<String>,
}

impl Failure {
    fn at(kind: FailureKind, step: &str, error: String) -> Self {
        Self {
            kind,
            error,
            step: Some(step.to_owned()),
        }
    }
}

enum Ending {
    Completed,
    Failed(Failure),
    Canceled(String),
}

impl Ending {
    fn outcome(&self) -> Outcome {
        match self {
            Self::Completed => Outcome::Completed,
            Self::Failed(failure) => Outcome::Failed {
                reason: failure.error.clone(),
            },
            Self::Canceled(reason) => Outcome::Canceled {
                reason: reason.clone(),
            },
        }
    }

    /// Rebuild from a terminal checkpoint whose transition never landed.
    fn recovered(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Completed => Self::Completed,
            Outcome::Failed { reason } => Self::Failed(Failure {
                kind: if reason.starts_with("fatal:") {
                    FailureKind::Fatal
                } else {
                    FailureKind::Step
                },
                error: reason.clone(),
                step: None,
            }),
            Outcome::Canceled { reason } => Self::Canceled(reason.clone()),
        }
    }
}

enum Performed {
    Done(EffectDone),
    Failed(Failure),
}

struct EffectDone {
    effect_id: EffectId,
    action: String,
    result: Value,
    replayed: bool,
}

/// The run being driven and the claim fencing its writes.
struct Active {
    run: Run,
    claim: Claim,
    checkpoint: Option<CheckpointId>,
}

/// Executes claimed runs.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    workflows: Arc<WorkflowRegistry>,
    actions: Arc<ActionRegistry>,
    telemetry: Telemetry,
    config: Arc<EngineConfig>,
}

impl Orchestrator {
    /// Create an orchestrator over `store`.
    pub fn new(
        store: Arc<dyn Store>,
        workflows: Arc<WorkflowRegistry>,
        actions: Arc<ActionRegistry>,
        telemetry: Telemetry,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            workflows,
            actions,
            telemetry,
            config: Arc::new(config),
        }
    }

    /// Drive a claimed run as far as it can go.
    ///
    /// Never returns an error: every failure is either recorded on the run or
    /// turned into a released claim.
    pub async fn drive(&self, claimed: ClaimedRun) -> Disposition {
        let ClaimedRun { run, claim } = claimed;
        let span = info_span!(
            "drive",
            run_id = %run.run_id,
            workflow = %run.workflow_id,
            worker = %claim.worker_id,
        );
        let mut active = Active {
            checkpoint: run.last_checkpoint_id,
            run,
            claim,
        };
        async move {
            match self.advance(&mut active).await {
                Ok(disposition) => disposition,
                Err(Halt::Store(PortsError::LeaseUnavailable { .. })) => {
                    warn!("lease lost, abandoning run");
                    Disposition::LeaseLost
                }
                Err(Halt::Store(err)) => {
                    warn!(error = %err, "transient store failure, releasing run");
                    self.release(&active).await;
                    Disposition::Released
                }
                Err(Halt::Fatal(message)) => self.fail_fatal(&mut active, &message).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn advance(&self, active: &mut Active) -> Result<Disposition, Halt> {
        match active.run.status {
            RunStatus::Queued => {
                if active.run.cancel_requested() {
                    let state = self.load_state(active).await?;
                    return self.cancel(active, state).await;
                }
                let workflow = self.workflow(&active.run)?;
                active.run = self
                    .store
                    .transition(&active.claim, RunStatus::Running, None, Utc::now())
                    .await?;
                let state = self.load_state(active).await?;
                let checkpoint_id = current(active)?;
                self.record(
                    active,
                    TimelineEntry::Started {
                        workflow_id: active.run.workflow_id.to_string(),
                        checkpoint_id,
                    },
                )
                .await;
                self.telemetry.bus().emit(RunNotification::Started {
                    run_id: active.run.run_id,
                    tenant_id: active.run.tenant_id,
                    workflow_id: active.run.workflow_id.to_string(),
                });
                info!("run started");
                self.run_steps(active, &workflow, state).await
            }
            RunStatus::Running => {
                debug!("recovering running run");
                let workflow = self.workflow(&active.run)?;
                let state = self.load_state(active).await?;
                self.run_steps(active, &workflow, state).await
            }
            RunStatus::WaitingApproval => self.resume(active).await,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Canceled => {
                self.release(active).await;
                Ok(Disposition::Released)
            }
        }
    }

    fn workflow(&self, run: &Run) -> Result<Arc<Workflow>, Halt> {
        self.workflows
            .get(&run.workflow_id)
            .ok_or_else(|| Halt::Fatal(format!("workflow {} is not registered", run.workflow_id)))
    }

    async fn run_steps(
        &self,
        active: &mut Active,
        workflow: &Workflow,
        mut state: RunState,
    ) -> Result<Disposition, Halt> {
        if let Some(pending) = state.pending_commit.take() {
            self.settle(active, &pending).await?;
        }
        if let Some(outcome) = &state.outcome {
            debug!("terminal checkpoint found, concluding");
            return self.conclude(active, Ending::recovered(outcome)).await;
        }

        loop {
            let Some(step) = workflow.step_at(state.position).cloned() else {
                return self.finish(active, &state, Ending::Completed).await;
            };
            self.heartbeat(active).await?;
            if let Some(run) = self.store.get_run(active.run.run_id).await? {
                if run.cancel_requested() {
                    active.run.cancel_requested_at = run.cancel_requested_at;
                    return self.cancel(active, state).await;
                }
            }

            let name = step.name().to_owned();
            let outcome = match self.execute_step(active, step.as_ref(), &state).await? {
                Ok(outcome) => outcome,
                Err(err) => {
                    let failure = Failure::at(FailureKind::Step, &name, format!("step: {name}: {err}"));
                    return self.finish(active, &state, Ending::Failed(failure)).await;
                }
            };

            match outcome {
                StepOutcome::Next(data) => {
                    let position = state.position;
                    state.data = data;
                    state.position += 1;
                    let checkpoint_id = self.checkpoint(active, &state).await?;
                    debug!(step = %name, position, "step completed");
                    self.record(
                        active,
                        TimelineEntry::StepCompleted {
                            step: name,
                            position,
                            checkpoint_id,
                        },
                    )
                    .await;
                }
                StepOutcome::SideEffect(request) => {
                    match self.perform(active, &name, &request, None).await? {
                        Performed::Done(done) => {
                            self.checkpoint_effect(active, &mut state, &name, done).await?;
                        }
                        Performed::Failed(failure) => {
                            return self.finish(active, &state, Ending::Failed(failure)).await;
                        }
                    }
                }
                StepOutcome::NeedsApproval(request) => {
                    match self.request_approval(active, &mut state, &name, request).await? {
                        Flow::Continue => {}
                        Flow::Stop(disposition) => return Ok(disposition),
                    }
                }
            }
        }
    }

    async fn execute_step(
        &self,
        active: &mut Active,
        step: &dyn Step,
        state: &RunState,
    ) -> Result<Result<StepOutcome, StepError>, Halt> {
        let policy = step.retry_policy();
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let ctx = StepContext {
                run_id: active.run.run_id,
                tenant_id: active.run.tenant_id,
                workflow_id: active.run.workflow_id.clone(),
                step: step.name().to_owned(),
                position: state.position,
                attempt,
                input: active.run.input.clone(),
                data: state.data.clone(),
                outputs: state.outputs.clone(),
                decisions: state.decisions.clone(),
            };

            let started = Instant::now();
            let result = tokio::time::timeout(self.config.step_timeout, step.execute(&ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(StepError::retryable(format!(
                        "timed out after {:?}",
                        self.config.step_timeout
                    )))
                });
            let metrics = self.telemetry.metrics();
            metrics.counter(names::STEPS_EXECUTED).inc();
            metrics
                .histogram(names::STEP_DURATION_SECONDS)
                .observe_duration(started.elapsed());

            match result {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(step = step.name(), attempt, error = %err, "step failed, retrying");
                    self.record(
                        active,
                        TimelineEntry::StepRetrying {
                            step: step.name().to_owned(),
                            attempt,
                            error: err.to_string(),
                        },
                    )
                    .await;
                    tokio::time::sleep(policy.delay(attempt)).await;
                    self.heartbeat(active).await?;
                    attempt += 1;
                }
                other => return Ok(other),
            }
        }
    }

    /// Run an effect through the ledger: reuse a committed result, otherwise
    /// prepare and invoke.
    async fn perform(
        &self,
        active: &mut Active,
        step: &str,
        request: &EffectRequest,
        ticket_id: Option<TicketId>,
    ) -> Result<Performed, Halt> {
        let run_id = active.run.run_id;
        let effect_id = match derive_effect_id(run_id, &request.action, &request.params, step) {
            Ok(effect_id) => effect_id,
            Err(err) => {
                let error = format!("step: {step}: {err}");
                return Ok(Performed::Failed(Failure::at(FailureKind::Step, step, error)));
            }
        };

        let effect = self
            .store
            .prepare_effect(NewEffect {
                effect_id: effect_id.clone(),
                run_id,
                action: request.action.clone(),
                params: request.params.clone(),
                ticket_id,
            })
            .await?
            .into_effect();
        match effect.status {
            EffectStatus::Committed => {
                self.telemetry.metrics().counter(names::EFFECTS_REPLAYED).inc();
                debug!(step, action = %request.action, effect_id = %effect_id, "effect replayed from ledger");
                self.record(
                    active,
                    TimelineEntry::EffectReplayed {
                        step: step.to_owned(),
                        action: request.action.clone(),
                        effect_id: effect_id.clone(),
                    },
                )
                .await;
                return Ok(Performed::Done(EffectDone {
                    effect_id,
                    action: request.action.clone(),
                    result: effect.result_payload.unwrap_or(Value::Null),
                    replayed: true,
                }));
            }
            EffectStatus::Aborted => {
                return Err(Halt::Fatal(format!("effect {effect_id} was aborted")));
            }
            EffectStatus::Prepared => {}
        }

        let handler = self.actions.get(&request.action).ok_or_else(|| {
            Halt::Fatal(format!("no handler registered for action {}", request.action))
        })?;
        let call = ActionCall {
            run_id,
            tenant_id: active.run.tenant_id,
            action: request.action.clone(),
            params: request.params.clone(),
            effect_id: effect_id.clone(),
            ticket_id,
        };
        // The step may have used most of the lease; the action gets a fresh one.
        self.heartbeat(active).await?;
        let invoked = tokio::time::timeout(self.config.action_timeout, handler.invoke(&call)).await;
        let action = &request.action;
        match invoked {
            Ok(Ok(result)) => Ok(Performed::Done(EffectDone {
                effect_id,
                action: action.clone(),
                result,
                replayed: false,
            })),
            Ok(Err(ActionError::Rejected(reason))) => {
                self.store.abort_effect(&effect_id).await?;
                warn!(step, %action, %reason, "action rejected, effect aborted");
                let error = format!("step: {step}: action {action} rejected: {reason}");
                Ok(Performed::Failed(Failure::at(FailureKind::Action, step, error)))
            }
            Ok(Err(ActionError::Ambiguous(reason))) => {
                warn!(step, %action, %reason, "action outcome unknown, effect left prepared");
                let error = format!("step: {step}: action {action} outcome unknown: {reason}");
                Ok(Performed::Failed(Failure::at(FailureKind::Action, step, error)))
            }
            Err(_) => {
                warn!(step, %action, "action timed out, effect left prepared");
                let error = format!(
                    "step: {step}: action {action} outcome unknown: timed out after {:?}",
                    self.config.action_timeout
                );
                Ok(Performed::Failed(Failure::at(FailureKind::Action, step, error)))
            }
        }
    }

    /// Store an effect result in the next checkpoint, then commit the ledger row.
    async fn checkpoint_effect(
        &self,
        active: &mut Active,
        state: &mut RunState,
        step: &str,
        done: EffectDone,
    ) -> Result<(), Halt> {
        let position = state.position;
        state.outputs.insert(step.to_owned(), done.result.clone());
        state.position += 1;

        if done.replayed {
            state.pending_commit = None;
            let checkpoint_id = self.checkpoint(active, state).await?;
            self.record(
                active,
                TimelineEntry::StepCompleted {
                    step: step.to_owned(),
                    position,
                    checkpoint_id,
                },
            )
            .await;
            return Ok(());
        }

        state.pending_commit = Some(PendingCommit {
            effect_id: done.effect_id.clone(),
            step: step.to_owned(),
            action: done.action.clone(),
            result: done.result.clone(),
        });
        let checkpoint_id = self.checkpoint(active, state).await?;
        self.store.commit_effect(&done.effect_id, done.result).await?;
        state.pending_commit = None;
        self.telemetry.metrics().counter(names::EFFECTS_COMMITTED).inc();
        info!(step, action = %done.action, effect_id = %done.effect_id, "effect committed");
        self.record(
            active,
            TimelineEntry::EffectCommitted {
                step: step.to_owned(),
                action: done.action,
                effect_id: done.effect_id,
                checkpoint_id,
            },
        )
        .await;
        Ok(())
    }

    /// Commit an effect whose result a crashed worker already checkpointed.
    async fn settle(&self, active: &Active, pending: &PendingCommit) -> Result<(), Halt> {
        let effect = self.store.lookup_effect(&pending.effect_id).await?.ok_or_else(|| {
            Halt::Fatal(format!("pending effect {} is missing from the ledger", pending.effect_id))
        })?;
        match effect.status {
            EffectStatus::Prepared => {
                self.store
                    .commit_effect(&pending.effect_id, pending.result.clone())
                    .await?;
                self.telemetry.metrics().counter(names::EFFECTS_COMMITTED).inc();
                info!(effect_id = %pending.effect_id, "committed pending effect");
                self.record(
                    active,
                    TimelineEntry::EffectCommitted {
                        step: pending.step.clone(),
                        action: pending.action.clone(),
                        effect_id: pending.effect_id.clone(),
                        checkpoint_id: current(active)?,
                    },
                )
                .await;
                Ok(())
            }
            EffectStatus::Committed => Ok(()),
            EffectStatus::Aborted => Err(Halt::Fatal(format!(
                "pending effect {} was aborted",
                pending.effect_id
            ))),
        }
    }

    async fn request_approval(
        &self,
        active: &mut Active,
        state: &mut RunState,
        step: &str,
        request: ApprovalRequest,
    ) -> Result<Flow, Halt> {
        let run_id = active.run.run_id;
        let checkpoint_id = current(active)?;
        let ticket_id = ticket_id_for(run_id, checkpoint_id, &request.interrupt_id);

        let effect_id = match &request.action {
            Some(gated) => {
                let effect_id = match derive_effect_id(run_id, &gated.action, &gated.params, step) {
                    Ok(effect_id) => effect_id,
                    Err(err) => {
                        let failure =
                            Failure::at(FailureKind::Step, step, format!("step: {step}: {err}"));
                        let disposition = self.finish(active, state, Ending::Failed(failure)).await?;
                        return Ok(Flow::Stop(disposition));
                    }
                };
                self.store
                    .prepare_effect(NewEffect {
                        effect_id: effect_id.clone(),
                        run_id,
                        action: gated.action.clone(),
                        params: gated.params.clone(),
                        ticket_id: Some(ticket_id),
                    })
                    .await?;
                Some(effect_id)
            }
            None => None,
        };

        let now = Utc::now();
        let ttl = request.expires_in.or(self.config.default_ticket_ttl);
        let ticket = self
            .store
            .create_ticket(
                NewTicket {
                    ticket_id,
                    tenant_id: active.run.tenant_id,
                    run_id,
                    checkpoint_id,
                    interrupt_id: request.interrupt_id.clone(),
                    risk_level: request.risk_level,
                    context_pack: request.context_pack,
                    effect_id,
                    expires_at: ttl.map(|ttl| lease_deadline(now, ttl)),
                },
                now,
            )
            .await?;
        active.run.last_ticket_id = Some(ticket_id);

        if ticket.status.is_final() {
            info!(%ticket_id, status = %ticket.status, "ticket already decided");
            return self.apply_decision(active, state, step, &ticket).await;
        }

        active.run = self
            .store
            .transition(&active.claim, RunStatus::WaitingApproval, None, now)
            .await?;
        self.record(
            active,
            TimelineEntry::PausedForApproval {
                step: step.to_owned(),
                ticket_id,
                checkpoint_id,
                risk_level: request.risk_level,
            },
        )
        .await;
        self.telemetry.bus().emit(RunNotification::ApprovalRequested {
            run_id,
            tenant_id: active.run.tenant_id,
            ticket_id,
            risk_level: request.risk_level.as_str().to_owned(),
        });
        info!(%ticket_id, risk = request.risk_level.as_str(), "run parked for approval");
        Ok(Flow::Stop(Disposition::Parked))
    }

    async fn resume(&self, active: &mut Active) -> Result<Disposition, Halt> {
        let mut state = self.load_state(active).await?;
        if active.run.cancel_requested() {
            return self.cancel(active, state).await;
        }
        let workflow = self.workflow(&active.run)?;
        if let Some(pending) = state.pending_commit.take() {
            self.settle(active, &pending).await?;
        }

        let ticket_id = active
            .run
            .last_ticket_id
            .ok_or_else(|| Halt::Fatal("parked run has no ticket".to_owned()))?;
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| Halt::Fatal(format!("ticket {ticket_id} is missing")))?;
        if active.checkpoint != Some(ticket.expected_checkpoint_id) {
            return Err(Halt::Fatal(format!(
                "ticket {ticket_id} is bound to checkpoint {} but the run is at {}",
                ticket.expected_checkpoint_id,
                current(active)?
            )));
        }
        if ticket.status == TicketStatus::Pending {
            debug!(%ticket_id, "ticket still pending, parking again");
            self.release(active).await;
            return Ok(Disposition::Parked);
        }

        let step = workflow
            .step_at(state.position)
            .map(|step| step.name().to_owned())
            .ok_or_else(|| Halt::Fatal(format!("run parked past its last step at {}", state.position)))?;
        match self.apply_decision(active, &mut state, &step, &ticket).await? {
            Flow::Continue => self.run_steps(active, &workflow, state).await,
            Flow::Stop(disposition) => Ok(disposition),
        }
    }

    async fn apply_decision(
        &self,
        active: &mut Active,
        state: &mut RunState,
        step: &str,
        ticket: &Ticket,
    ) -> Result<Flow, Halt> {
        let ticket_id = ticket.ticket_id;
        let decided = |decision| DecisionRecord {
            ticket_id,
            decision,
            payload: ticket.decision_payload.clone().unwrap_or(Value::Null),
            decided_by: ticket.decided_by.clone(),
        };

        match ticket.status {
            TicketStatus::Approved => {
                if active.run.status == RunStatus::WaitingApproval {
                    active.run = self
                        .store
                        .transition(&active.claim, RunStatus::Running, None, Utc::now())
                        .await?;
                    self.record(
                        active,
                        TimelineEntry::Resumed {
                            ticket_id,
                            checkpoint_id: ticket.checkpoint_id,
                        },
                    )
                    .await;
                    self.telemetry.bus().emit(RunNotification::Resumed {
                        run_id: active.run.run_id,
                        tenant_id: active.run.tenant_id,
                    });
                    info!(%ticket_id, "run resumed");
                }
                state.decisions.insert(step.to_owned(), decided(Decision::Approve));

                let Some(effect_id) = &ticket.effect_id else {
                    let position = state.position;
                    state.position += 1;
                    let checkpoint_id = self.checkpoint(active, state).await?;
                    self.record(
                        active,
                        TimelineEntry::StepCompleted {
                            step: step.to_owned(),
                            position,
                            checkpoint_id,
                        },
                    )
                    .await;
                    return Ok(Flow::Continue);
                };
                let effect = self.store.lookup_effect(effect_id).await?.ok_or_else(|| {
                    Halt::Fatal(format!("gated effect {effect_id} is missing from the ledger"))
                })?;
                let request = EffectRequest::new(effect.action, effect.prepared_payload);
                match self.perform(active, step, &request, Some(ticket_id)).await? {
                    Performed::Done(done) => {
                        self.checkpoint_effect(active, state, step, done).await?;
                        Ok(Flow::Continue)
                    }
                    Performed::Failed(failure) => {
                        let disposition = self.finish(active, state, Ending::Failed(failure)).await?;
                        Ok(Flow::Stop(disposition))
                    }
                }
            }
            TicketStatus::Rejected => {
                self.abort_gated(ticket).await?;
                state.decisions.insert(step.to_owned(), decided(Decision::Reject));
                self.record(
                    active,
                    TimelineEntry::ApprovalRejected {
                        ticket_id,
                        decided_by: ticket.decided_by.clone(),
                    },
                )
                .await;
                let error = format!("step: {step}: approval {ticket_id} rejected");
                let failure = Failure::at(FailureKind::Rejected, step, error);
                let disposition = self.finish(active, state, Ending::Failed(failure)).await?;
                Ok(Flow::Stop(disposition))
            }
            TicketStatus::Expired => {
                self.abort_gated(ticket).await?;
                self.record(active, TimelineEntry::TicketExpired { ticket_id }).await;
                let error = format!("step: {step}: approval {ticket_id} expired");
                let failure = Failure::at(FailureKind::Expired, step, error);
                let disposition = self.finish(active, state, Ending::Failed(failure)).await?;
                Ok(Flow::Stop(disposition))
            }
            TicketStatus::Pending => Err(Halt::Fatal(format!("ticket {ticket_id} is still pending"))),
        }
    }

    async fn abort_gated(&self, ticket: &Ticket) -> Result<(), Halt> {
        let Some(effect_id) = &ticket.effect_id else {
            return Ok(());
        };
        match self.store.lookup_effect(effect_id).await? {
            Some(effect) if effect.status == EffectStatus::Prepared => {
                self.store.abort_effect(effect_id).await?;
                debug!(%effect_id, "gated effect aborted");
                Ok(())
            }
            Some(effect) if effect.status == EffectStatus::Committed => Err(Halt::Fatal(format!(
                "effect {effect_id} committed behind undecided ticket {}",
                ticket.ticket_id
            ))),
            _ => Ok(()),
        }
    }

    async fn cancel(&self, active: &mut Active, state: RunState) -> Result<Disposition, Halt> {
        if let Some(ticket_id) = active.run.last_ticket_id {
            if let Some(ticket) = self.store.get_ticket(ticket_id).await? {
                if ticket.status == TicketStatus::Pending {
                    match self.store.expire_ticket(ticket_id, Utc::now()).await {
                        Ok(_) | Err(PortsError::AlreadyDecided { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                    self.abort_gated(&ticket).await?;
                }
            }
        }
        self.finish(active, &state, Ending::Canceled("cancel requested".to_owned()))
            .await
    }

    /// Write the terminal checkpoint, then conclude.
    async fn finish(&self, active: &mut Active, state: &RunState, ending: Ending) -> Result<Disposition, Halt> {
        let terminal = state.finished(ending.outcome());
        self.checkpoint(active, &terminal).await?;
        self.conclude(active, ending).await
    }

    async fn conclude(&self, active: &mut Active, ending: Ending) -> Result<Disposition, Halt> {
        let now = Utc::now();
        let run_id = active.run.run_id;
        let tenant_id = active.run.tenant_id;
        match ending {
            Ending::Completed => {
                active.run = self
                    .store
                    .transition(&active.claim, RunStatus::Completed, None, now)
                    .await?;
                let checkpoint_id = current(active)?;
                self.record(active, TimelineEntry::Completed { checkpoint_id }).await;
                self.telemetry
                    .bus()
                    .emit(RunNotification::Completed { run_id, tenant_id });
                self.telemetry.metrics().counter(names::RUNS_COMPLETED).inc();
                info!(checkpoint = %checkpoint_id, "run completed");
                Ok(Disposition::Completed)
            }
            Ending::Failed(failure) => {
                active.run = self
                    .store
                    .transition(&active.claim, RunStatus::Failed, Some(failure.error.clone()), now)
                    .await?;
                info!(error = %failure.error, "run failed");
                self.record(
                    active,
                    TimelineEntry::Failed {
                        kind: failure.kind,
                        error: failure.error.clone(),
                        step: failure.step,
                    },
                )
                .await;
                self.telemetry.bus().emit(RunNotification::Failed {
                    run_id,
                    tenant_id,
                    error: failure.error,
                });
                self.telemetry.metrics().counter(names::RUNS_FAILED).inc();
                Ok(Disposition::Failed)
            }
            Ending::Canceled(reason) => {
                active.run = self
                    .store
                    .transition(&active.claim, RunStatus::Canceled, None, now)
                    .await?;
                info!(%reason, "run canceled");
                self.record(active, TimelineEntry::Canceled { reason }).await;
                self.telemetry
                    .bus()
                    .emit(RunNotification::Canceled { run_id, tenant_id });
                Ok(Disposition::Canceled)
            }
        }
    }

    async fn fail_fatal(&self, active: &mut Active, message: &str) -> Disposition {
        error!(error = %message, "fatal run failure");
        let reason = format!("fatal: {message}");
        match self.record_fatal(active, &reason).await {
            Ok(()) => Disposition::Failed,
            Err(err) => {
                error!(error = %err, "could not record fatal failure, releasing run");
                self.release(active).await;
                Disposition::Released
            }
        }
    }

    async fn record_fatal(&self, active: &mut Active, reason: &str) -> Result<(), PortsError> {
        let now = Utc::now();
        if active.run.status == RunStatus::Queued {
            active.run = self
                .store
                .transition(&active.claim, RunStatus::Running, None, now)
                .await?;
        }
        active.run = self
            .store
            .transition(&active.claim, RunStatus::Failed, Some(reason.to_owned()), now)
            .await?;
        self.record(
            active,
            TimelineEntry::Failed {
                kind: FailureKind::Fatal,
                error: reason.to_owned(),
                step: None,
            },
        )
        .await;
        self.telemetry.bus().emit(RunNotification::Failed {
            run_id: active.run.run_id,
            tenant_id: active.run.tenant_id,
            error: reason.to_owned(),
        });
        self.telemetry.metrics().counter(names::RUNS_FAILED).inc();
        Ok(())
    }

    /// Latest checkpoint as state, writing the initial one for a fresh run.
    async fn load_state(&self, active: &mut Active) -> Result<RunState, Halt> {
        if let Some(checkpoint) = self.store.latest_checkpoint(active.run.run_id).await? {
            active.checkpoint = Some(checkpoint.checkpoint_id);
            return Ok(checkpoint.state()?);
        }
        let state = RunState::initial(active.run.input.clone());
        self.checkpoint(active, &state).await?;
        Ok(state)
    }

    async fn checkpoint(&self, active: &mut Active, state: &RunState) -> Result<CheckpointId, Halt> {
        let payload = state.to_payload()?;
        let checkpoint_id = self
            .store
            .append_checkpoint(active.run.run_id, payload)
            .await
            .map_err(|err| {
                if err.is_retryable() {
                    Halt::Store(err)
                } else {
                    Halt::Fatal(format!("checkpoint write failed: {err}"))
                }
            })?;
        active.checkpoint = Some(checkpoint_id);
        debug!(checkpoint = %checkpoint_id, position = state.position, "checkpoint written");
        Ok(checkpoint_id)
    }

    async fn heartbeat(&self, active: &mut Active) -> Result<(), Halt> {
        active.claim = self
            .store
            .renew_claim(&active.claim, self.config.lease_ttl, Utc::now())
            .await?;
        Ok(())
    }

    async fn release(&self, active: &Active) {
        if let Err(err) = self.store.release_claim(&active.claim).await {
            warn!(error = %err, "failed to release claim");
        }
    }

    /// Append a timeline event. Loss is logged, not propagated.
    async fn record(&self, active: &Active, entry: TimelineEntry) {
        let kind = entry.kind();
        let appended = match entry.payload() {
            Ok(payload) => self
                .store
                .append_event(active.run.run_id, kind, payload)
                .await
                .map(drop),
            Err(err) => Err(PortsError::from(err)),
        };
        if let Err(err) = appended {
            warn!(event = kind.as_str(), error = %err, "failed to append timeline event");
        }
    }
}

fn current(active: &Active) -> Result<CheckpointId, Halt> {
    active
        .checkpoint
        .ok_or_else(|| Halt::Fatal("run has no checkpoint".to_owned()))
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("workflows", &self.workflows.ids())
            .field("actions", &self.actions)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
