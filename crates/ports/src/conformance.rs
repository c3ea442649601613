//! Contract suite shared by every store driver.
//!
//! Each function takes a fresh, empty store and panics on the first violated
//! contract. Drivers call them from their own `#[tokio::test]`s:
//!
//! ```ignore
//! #[tokio::test]
//! async fn claim_order() {
//!     spire_ports::conformance::claims_follow_priority_then_age(&MemoryStore::new()).await;
//! }
//! ```

use std::time::Duration;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use spire_core::{CheckpointId, EffectId, RunId, Sequence, TenantId, WorkerId, WorkflowId, ticket_id_for};
use spire_execution::{
    Decision, EffectStatus, EventKind, RiskLevel, Run, RunState, RunStatus, TicketStatus,
};

use crate::{
    Claim, DecideOutcome, NewEffect, NewRun, NewTicket, PortsError, PrepareOutcome, Store,
    TicketDecision, TicketFilter,
};

const TTL: Duration = Duration::from_secs(30);

/// Millisecond precision, the coarsest any driver stores.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn worker(name: &str) -> WorkerId {
    WorkerId::new(name).expect("valid worker id")
}

fn effect_key(byte: u8) -> EffectId {
    EffectId::from_digest([byte; 32])
}

async fn seed_run<S: Store + ?Sized>(store: &S, tenant_id: TenantId, priority: i32) -> Run {
    store
        .create_run(NewRun {
            run_id: RunId::v4(),
            tenant_id,
            workflow_id: WorkflowId::new("conformance").expect("valid workflow id"),
            parent_run_id: None,
            priority,
            input: json!({ "priority": priority }),
        })
        .await
        .expect("create run")
}

async fn claim_one<S: Store + ?Sized>(store: &S, name: &str, now: DateTime<Utc>) -> Option<(Run, Claim)> {
    store
        .claim_next(&worker(name), TTL, now)
        .await
        .expect("claim_next")
        .map(|claimed| (claimed.run, claimed.claim))
}

async fn checkpoint<S: Store + ?Sized>(store: &S, run_id: RunId) -> CheckpointId {
    let payload = RunState::initial(json!({})).to_payload().expect("payload");
    store.append_checkpoint(run_id, payload).await.expect("append checkpoint")
}

async fn park<S: Store + ?Sized>(store: &S, tenant_id: TenantId, now: DateTime<Utc>) -> (Run, CheckpointId) {
    let run = seed_run(store, tenant_id, 0).await;
    let (_, claim) = claim_one(store, "parker", now).await.expect("claimable");
    store
        .transition(&claim, RunStatus::Running, None, now)
        .await
        .expect("queued -> running");
    let cp = checkpoint(store, run.run_id).await;
    store
        .transition(&claim, RunStatus::WaitingApproval, None, now)
        .await
        .expect("running -> waiting_approval");
    (run, cp)
}

fn new_ticket(run: &Run, checkpoint_id: CheckpointId, interrupt: &str) -> NewTicket {
    NewTicket {
        ticket_id: ticket_id_for(run.run_id, checkpoint_id, interrupt),
        tenant_id: run.tenant_id,
        run_id: run.run_id,
        checkpoint_id,
        interrupt_id: interrupt.to_owned(),
        risk_level: RiskLevel::High,
        context_pack: json!({ "why": "conformance" }),
        effect_id: None,
        expires_at: None,
    }
}

fn approve(payload: serde_json::Value) -> TicketDecision {
    TicketDecision {
        decision: Decision::Approve,
        payload,
        decided_by: Some("reviewer".into()),
    }
}

/// Created runs are queued, readable and unclaimed.
pub async fn runs_start_queued<S: Store + ?Sized>(store: &S) {
    let run = seed_run(store, TenantId::v4(), 3).await;
    assert_eq!(run.status, RunStatus::Queued);
    assert_eq!(run.last_checkpoint_id, None);
    assert!(run.lease.is_none());

    let read = store.get_run(run.run_id).await.expect("get").expect("exists");
    assert_eq!(read.run_id, run.run_id);
    assert_eq!(read.priority, 3);
    assert_eq!(read.input, json!({ "priority": 3 }));

    assert!(store.get_run(RunId::v4()).await.expect("get").is_none());
}

/// Checkpoint ids start at 1, grow by one and move `last_checkpoint_id`.
pub async fn checkpoints_are_monotonic<S: Store + ?Sized>(store: &S) {
    let run = seed_run(store, TenantId::v4(), 0).await;
    assert!(store.latest_checkpoint(run.run_id).await.expect("latest").is_none());

    let first = checkpoint(store, run.run_id).await;
    let second = checkpoint(store, run.run_id).await;
    let third = checkpoint(store, run.run_id).await;
    assert_eq!(first, CheckpointId::FIRST);
    assert_eq!(second, first.next());
    assert_eq!(third, second.next());

    let stored = store.get_run(run.run_id).await.expect("get").expect("exists");
    assert_eq!(stored.last_checkpoint_id, Some(third));

    let latest = store.latest_checkpoint(run.run_id).await.expect("latest").expect("some");
    assert_eq!(latest.checkpoint_id, third);
    latest.state().expect("decodes");

    let ids: Vec<_> = store
        .checkpoint_history(run.run_id)
        .await
        .expect("history")
        .into_iter()
        .map(|cp| cp.checkpoint_id)
        .collect();
    assert_eq!(ids, vec![first, second, third]);

    let got = store.get_checkpoint(run.run_id, second).await.expect("get").expect("some");
    assert_eq!(got.checkpoint_id, second);
    assert!(store.get_checkpoint(run.run_id, CheckpointId::new(99)).await.expect("get").is_none());
}

/// Appending a checkpoint for an unknown run is `NotFound`.
pub async fn checkpoint_for_unknown_run_fails<S: Store + ?Sized>(store: &S) {
    let err = store.append_checkpoint(RunId::v4(), json!({})).await.unwrap_err();
    assert!(matches!(err, PortsError::NotFound { .. }), "got {err:?}");
}

/// Sequences start at 1 per run and pages are ascending and bounded.
pub async fn timeline_pages_in_order<S: Store + ?Sized>(store: &S) {
    let run = seed_run(store, TenantId::v4(), 0).await;
    let other = seed_run(store, TenantId::v4(), 0).await;

    for n in 1..=5u64 {
        let seq = store
            .append_event(run.run_id, EventKind::StepCompleted, json!({ "n": n }))
            .await
            .expect("append");
        assert_eq!(seq, Sequence::new(n));
    }
    let seq = store
        .append_event(other.run_id, EventKind::Started, json!({}))
        .await
        .expect("append");
    assert_eq!(seq, Sequence::new(1));

    let page = store.read_events(run.run_id, Sequence::ZERO, 2).await.expect("read");
    assert_eq!(page.iter().map(|e| e.sequence.get()).collect::<Vec<_>>(), vec![1, 2]);

    let page = store.read_events(run.run_id, Sequence::new(2), 10).await.expect("read");
    assert_eq!(page.iter().map(|e| e.sequence.get()).collect::<Vec<_>>(), vec![3, 4, 5]);
    assert_eq!(page[0].payload, json!({ "n": 3 }));
    assert_eq!(page[0].event_type, EventKind::StepCompleted);

    assert!(store.read_events(run.run_id, Sequence::new(5), 10).await.expect("read").is_empty());
}

/// Prepare is idempotent; commit and abort follow the ledger rules.
pub async fn effects_commit_exactly_once<S: Store + ?Sized>(store: &S) {
    let run = seed_run(store, TenantId::v4(), 0).await;
    let key = effect_key(1);
    let new = NewEffect {
        effect_id: key.clone(),
        run_id: run.run_id,
        action: "issue_refund".into(),
        params: json!({ "amount_cents": 4200 }),
        ticket_id: None,
    };

    let first = store.prepare_effect(new.clone()).await.expect("prepare");
    assert!(matches!(first, PrepareOutcome::Prepared(ref e) if e.status == EffectStatus::Prepared));
    let again = store.prepare_effect(new).await.expect("prepare again");
    assert!(matches!(again, PrepareOutcome::AlreadyExists(_)));

    let committed = store
        .commit_effect(&key, json!({ "refund_id": "r-1" }))
        .await
        .expect("commit");
    assert_eq!(committed.status, EffectStatus::Committed);
    assert!(committed.committed_at.is_some());

    let err = store.commit_effect(&key, json!({ "refund_id": "r-2" })).await.unwrap_err();
    assert!(matches!(err, PortsError::InvalidState { .. }), "got {err:?}");
    let err = store.abort_effect(&key).await.unwrap_err();
    assert!(matches!(err, PortsError::InvalidState { .. }), "got {err:?}");

    let stored = store.lookup_effect(&key).await.expect("lookup").expect("exists");
    assert_eq!(stored.committed_result(), Some(&json!({ "refund_id": "r-1" })));
    assert_eq!(stored.prepared_payload, json!({ "amount_cents": 4200 }));

    assert!(store.lookup_effect(&effect_key(2)).await.expect("lookup").is_none());
    let err = store.commit_effect(&effect_key(2), json!(null)).await.unwrap_err();
    assert!(matches!(err, PortsError::NotFound { .. }), "got {err:?}");
}

/// Abort is idempotent and blocks a later commit.
pub async fn aborted_effects_never_commit<S: Store + ?Sized>(store: &S) {
    let run = seed_run(store, TenantId::v4(), 0).await;
    let key = effect_key(7);
    store
        .prepare_effect(NewEffect {
            effect_id: key.clone(),
            run_id: run.run_id,
            action: "send_email".into(),
            params: json!({}),
            ticket_id: None,
        })
        .await
        .expect("prepare");

    assert_eq!(store.abort_effect(&key).await.expect("abort").status, EffectStatus::Aborted);
    assert_eq!(store.abort_effect(&key).await.expect("abort again").status, EffectStatus::Aborted);
    let err = store.commit_effect(&key, json!({})).await.unwrap_err();
    assert!(matches!(err, PortsError::InvalidState { .. }), "got {err:?}");

    let listed = store.effects_for_run(run.run_id).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].effect_id, key);
}

/// Ticket creation is idempotent and points the run at the ticket.
pub async fn tickets_create_idempotently<S: Store + ?Sized>(store: &S) {
    let now = now();
    let (run, cp) = park(store, TenantId::v4(), now).await;
    let new = new_ticket(&run, cp, "approve_refund");

    let created = store.create_ticket(new.clone(), now).await.expect("create");
    assert_eq!(created.status, TicketStatus::Pending);
    assert_eq!(created.expected_checkpoint_id, cp);
    let again = store.create_ticket(new, now).await.expect("create again");
    assert_eq!(again, created);

    let stored_run = store.get_run(run.run_id).await.expect("get").expect("exists");
    assert_eq!(stored_run.last_ticket_id, Some(created.ticket_id));
    assert_eq!(
        store.get_ticket(created.ticket_id).await.expect("get").expect("exists"),
        created
    );
}

/// The decide precedence: unchanged, conflict, already decided, applied.
pub async fn ticket_decisions_are_optimistic<S: Store + ?Sized>(store: &S) {
    let now = now();
    let (run, cp) = park(store, TenantId::v4(), now).await;
    let ticket = store
        .create_ticket(new_ticket(&run, cp, "approve"), now)
        .await
        .expect("create");

    let err = store
        .decide_ticket(ticket.ticket_id, approve(json!({})), cp.next(), now)
        .await
        .unwrap_err();
    assert!(matches!(err, PortsError::Conflict { .. }), "got {err:?}");

    let applied = store
        .decide_ticket(ticket.ticket_id, approve(json!({ "note": "ok" })), cp, now)
        .await
        .expect("decide");
    assert!(matches!(applied, DecideOutcome::Applied(_)));
    assert_eq!(applied.ticket().status, TicketStatus::Approved);
    assert_eq!(applied.ticket().decided_by.as_deref(), Some("reviewer"));
    assert!(applied.ticket().decided_at.is_some());

    let repeat = store
        .decide_ticket(ticket.ticket_id, approve(json!({ "note": "ok" })), cp, now)
        .await
        .expect("repeat");
    assert!(matches!(repeat, DecideOutcome::Unchanged(_)));

    let err = store
        .decide_ticket(
            ticket.ticket_id,
            TicketDecision {
                decision: Decision::Reject,
                payload: json!({}),
                decided_by: None,
            },
            cp,
            now,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PortsError::AlreadyDecided { .. }), "got {err:?}");

    let err = store
        .decide_ticket(spire_core::TicketId::v4(), approve(json!({})), cp, now)
        .await
        .unwrap_err();
    assert!(matches!(err, PortsError::NotFound { .. }), "got {err:?}");
}

/// A decision is stale once the run has checkpointed past the ticket.
pub async fn stale_decisions_conflict<S: Store + ?Sized>(store: &S) {
    let now = now();
    let (run, cp) = park(store, TenantId::v4(), now).await;
    let ticket = store
        .create_ticket(new_ticket(&run, cp, "approve"), now)
        .await
        .expect("create");

    let advanced = checkpoint(store, run.run_id).await;
    assert!(advanced > cp);

    let err = store
        .decide_ticket(ticket.ticket_id, approve(json!({})), cp, now)
        .await
        .unwrap_err();
    match err {
        PortsError::Conflict { expected, actual, .. } => {
            assert_eq!(expected, cp.get());
            assert_eq!(actual, advanced.get());
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    let stored = store.get_ticket(ticket.ticket_id).await.expect("get").expect("exists");
    assert_eq!(stored.status, TicketStatus::Pending);
}

/// Overdue pending tickets expire once; explicit expiry is idempotent.
pub async fn tickets_expire<S: Store + ?Sized>(store: &S) {
    let now = now();
    let (run, cp) = park(store, TenantId::v4(), now).await;
    let mut overdue = new_ticket(&run, cp, "late");
    overdue.expires_at = Some(now - TimeDelta::seconds(1));
    let overdue = store.create_ticket(overdue, now).await.expect("create");

    let (run2, cp2) = park(store, TenantId::v4(), now).await;
    let mut fresh = new_ticket(&run2, cp2, "fresh");
    fresh.expires_at = Some(now + TimeDelta::hours(1));
    let fresh = store.create_ticket(fresh, now).await.expect("create");

    let expired = store.expire_overdue_tickets(now).await.expect("sweep");
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].ticket_id, overdue.ticket_id);
    assert_eq!(expired[0].status, TicketStatus::Expired);
    assert!(store.expire_overdue_tickets(now).await.expect("sweep").is_empty());

    let err = store
        .decide_ticket(overdue.ticket_id, approve(json!({})), cp, now)
        .await
        .unwrap_err();
    assert!(matches!(err, PortsError::AlreadyDecided { .. }), "got {err:?}");

    let t = store.expire_ticket(fresh.ticket_id, now).await.expect("expire");
    assert_eq!(t.status, TicketStatus::Expired);
    let t = store.expire_ticket(fresh.ticket_id, now).await.expect("expire again");
    assert_eq!(t.status, TicketStatus::Expired);
}

/// Listing filters by every field and returns newest first.
pub async fn inbox_filters_newest_first<S: Store + ?Sized>(store: &S) {
    let tenant = TenantId::v4();
    let base = now();
    let mut ids = Vec::new();
    for (offset, risk) in [(0, RiskLevel::Low), (1, RiskLevel::High), (2, RiskLevel::High)] {
        let at = base + TimeDelta::seconds(offset);
        let (run, cp) = park(store, tenant, base).await;
        let mut new = new_ticket(&run, cp, "approve");
        new.risk_level = risk;
        ids.push(store.create_ticket(new, at).await.expect("create").ticket_id);
    }
    let (foreign, cp) = park(store, TenantId::v4(), base).await;
    store
        .create_ticket(new_ticket(&foreign, cp, "approve"), base)
        .await
        .expect("create");

    let mine = store
        .list_tickets(&TicketFilter {
            tenant_id: Some(tenant),
            ..TicketFilter::default()
        })
        .await
        .expect("list");
    assert_eq!(
        mine.iter().map(|t| t.ticket_id).collect::<Vec<_>>(),
        vec![ids[2], ids[1], ids[0]]
    );

    let high = store
        .list_tickets(&TicketFilter {
            tenant_id: Some(tenant),
            risk_level: Some(RiskLevel::High),
            limit: Some(1),
            ..TicketFilter::default()
        })
        .await
        .expect("list");
    assert_eq!(high.iter().map(|t| t.ticket_id).collect::<Vec<_>>(), vec![ids[2]]);

    let approved = store
        .list_tickets(&TicketFilter {
            tenant_id: Some(tenant),
            status: Some(TicketStatus::Approved),
            ..TicketFilter::default()
        })
        .await
        .expect("list");
    assert!(approved.is_empty());
}

/// Claims pick the lowest priority first, then the least recently updated,
/// then the earliest created.
pub async fn claims_follow_priority_then_age<S: Store + ?Sized>(store: &S) {
    let tenant = TenantId::v4();
    let low_old = seed_run(store, tenant, 5).await;
    let low_new = seed_run(store, tenant, 5).await;
    let urgent = seed_run(store, tenant, 1).await;
    let now = now() + TimeDelta::seconds(1);

    let mut order = Vec::new();
    while let Some((run, claim)) = claim_one(store, "w", now).await {
        assert_eq!(run.lease.as_ref().map(|l| l.token), Some(claim.token));
        order.push(run.run_id);
    }
    assert_eq!(order, vec![urgent.run_id, low_old.run_id, low_new.run_id]);
}

/// A live claim excludes other workers; an expired one does not.
pub async fn claims_are_exclusive_until_expiry<S: Store + ?Sized>(store: &S) {
    let run = seed_run(store, TenantId::v4(), 0).await;
    let now = now();

    let (_, first) = claim_one(store, "w1", now).await.expect("claimable");
    store
        .transition(&first, RunStatus::Running, None, now)
        .await
        .expect("queued -> running");
    assert!(claim_one(store, "w2", now).await.is_none());

    let later = now + TimeDelta::from_std(TTL).expect("ttl") + TimeDelta::seconds(1);
    let (reclaimed, second) = claim_one(store, "w2", later).await.expect("lease expired");
    assert_eq!(reclaimed.run_id, run.run_id);
    assert_eq!(reclaimed.status, RunStatus::Running);
    assert_ne!(first.token, second.token);

    let err = store.renew_claim(&first, TTL, later).await.unwrap_err();
    assert!(matches!(err, PortsError::LeaseUnavailable { .. }), "got {err:?}");
    let err = store
        .transition(&first, RunStatus::Completed, None, later)
        .await
        .unwrap_err();
    assert!(matches!(err, PortsError::LeaseUnavailable { .. }), "got {err:?}");

    let renewed = store
        .renew_claim(&second, TTL, later + TimeDelta::seconds(1))
        .await
        .expect("renew");
    assert_eq!(renewed.token, second.token);
    assert!(renewed.expires_at > second.expires_at);
}

/// Transitions are validated, release the claim when parking or finishing,
/// and stamp the lifecycle timestamps.
pub async fn transitions_follow_the_state_machine<S: Store + ?Sized>(store: &S) {
    let run = seed_run(store, TenantId::v4(), 0).await;
    let now = now();
    let (_, claim) = claim_one(store, "w", now).await.expect("claimable");

    let err = store
        .transition(&claim, RunStatus::Completed, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, PortsError::InvalidTransition { .. }), "got {err:?}");

    let running = store
        .transition(&claim, RunStatus::Running, None, now)
        .await
        .expect("queued -> running");
    assert!(running.started_at.is_some());
    assert!(running.lease.is_some());

    let failed = store
        .transition(&claim, RunStatus::Failed, Some("step: boom".into()), now)
        .await
        .expect("running -> failed");
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("step: boom"));
    assert!(failed.finished_at.is_some());
    assert!(failed.lease.is_none());

    assert!(claim_is_gone(store, run.run_id).await);
}

async fn claim_is_gone<S: Store + ?Sized>(store: &S, run_id: RunId) -> bool {
    let later = now() + TimeDelta::hours(1);
    claim_one(store, "w", later).await.map(|(run, _)| run.run_id) != Some(run_id)
}

/// Parked runs hold no worker until their ticket is decided.
pub async fn parked_runs_wait_for_a_decision<S: Store + ?Sized>(store: &S) {
    let now = now();
    let (run, cp) = park(store, TenantId::v4(), now).await;
    let ticket = store
        .create_ticket(new_ticket(&run, cp, "approve"), now)
        .await
        .expect("create");

    assert!(claim_one(store, "w", now).await.is_none());

    store
        .decide_ticket(ticket.ticket_id, approve(json!({})), cp, now)
        .await
        .expect("decide");
    let (claimed, claim) = claim_one(store, "w", now).await.expect("claimable after decision");
    assert_eq!(claimed.run_id, run.run_id);
    assert_eq!(claimed.status, RunStatus::WaitingApproval);

    let resumed = store
        .transition(&claim, RunStatus::Running, None, now)
        .await
        .expect("waiting -> running");
    assert_eq!(resumed.status, RunStatus::Running);
}

/// Cancellation requests are recorded once and make parked runs claimable.
pub async fn cancel_requests_wake_parked_runs<S: Store + ?Sized>(store: &S) {
    let now = now();
    let (run, cp) = park(store, TenantId::v4(), now).await;
    store
        .create_ticket(new_ticket(&run, cp, "approve"), now)
        .await
        .expect("create");
    assert!(claim_one(store, "w", now).await.is_none());

    let first = store.request_cancel(run.run_id, now).await.expect("cancel");
    assert_eq!(first.cancel_requested_at, Some(now));
    let later = now + TimeDelta::seconds(5);
    let second = store.request_cancel(run.run_id, later).await.expect("cancel again");
    assert_eq!(second.cancel_requested_at, Some(now));

    let (claimed, claim) = claim_one(store, "w", now).await.expect("claimable after cancel");
    assert_eq!(claimed.run_id, run.run_id);
    store
        .transition(&claim, RunStatus::Canceled, None, now)
        .await
        .expect("waiting -> canceled");

    let err = store.request_cancel(run.run_id, now).await.unwrap_err();
    assert!(matches!(err, PortsError::InvalidState { .. }), "got {err:?}");
    let err = store.request_cancel(RunId::v4(), now).await.unwrap_err();
    assert!(matches!(err, PortsError::NotFound { .. }), "got {err:?}");
}
