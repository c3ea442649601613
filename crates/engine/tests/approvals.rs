//! Human-in-the-loop scenarios: park, decide, resume, reject, expire, cancel.

mod common;

use chrono::{TimeDelta, Utc};
use common::{harness, workflow_id};
use pretty_assertions::assert_eq;
use serde_json::json;
use spire_core::{CheckpointId, RunId, Sequence, TenantId};
use spire_engine::{Caller, EngineError, StartOptions};
use spire_execution::{
    Decision, EffectStatus, EventKind, FailureKind, Outcome, RiskLevel, RunStatus, TicketStatus,
    TimelineEntry,
};
use spire_ports::{CheckpointStore, DecideOutcome, TicketFilter, TicketStore};
use spire_telemetry::{RunNotification, names};

const C2: CheckpointId = CheckpointId::new(2);

#[tokio::test]
async fn refund_parks_for_approval_then_completes() {
    let h = harness();
    let mut notifications = h.engine.telemetry().bus().subscribe();
    let run_id = h.start_refund().await;

    h.drain().await;
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::WaitingApproval);
    assert!(run.lease.is_none());
    assert_eq!(h.refunds.calls(), 0);

    let snapshot = h.engine.control().get_snapshot(&h.caller, run_id).await.unwrap();
    assert_eq!(snapshot.checkpoint_id, Some(C2));
    assert_eq!(snapshot.position, 1);
    assert_eq!(snapshot.next_step.as_deref(), Some("approve_refund"));
    let ticket = snapshot.pending_ticket.expect("pending ticket");
    assert_eq!(ticket.risk_level, RiskLevel::High);
    assert_eq!(ticket.expected_checkpoint_id, C2);
    assert_eq!(ticket.context_pack, json!({ "order_id": "o-1", "amount_cents": 4200 }));

    let prepared = h.effects(run_id).await;
    assert_eq!(prepared.len(), 1);
    assert_eq!(prepared[0].status, EffectStatus::Prepared);
    assert_eq!(prepared[0].ticket_id, Some(ticket.ticket_id));
    assert_eq!(ticket.effect_id.as_ref(), Some(&prepared[0].effect_id));

    let decided = h
        .engine
        .control()
        .resume_run(&h.caller, run_id, json!({ "note": "looks fine" }), C2)
        .await
        .unwrap();
    assert!(matches!(decided, DecideOutcome::Applied(_)));

    h.drain().await;
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.finished_at.is_some());
    assert_eq!(h.refunds.calls(), 1);

    assert_eq!(
        h.lifecycle(run_id).await,
        vec![
            EventKind::Started,
            EventKind::PausedForApproval,
            EventKind::Resumed,
            EventKind::Completed,
        ]
    );

    let effects = h.effects(run_id).await;
    assert_eq!(effects.len(), 1);
    assert_eq!(effects[0].action, "issue_refund");
    assert_eq!(effects[0].status, EffectStatus::Committed);

    let state = h.final_state(run_id).await;
    assert_eq!(state.outcome, Some(Outcome::Completed));
    assert_eq!(state.data["notified"], json!(true));
    assert_eq!(Some(&state.data["refund"]), effects[0].result_payload.as_ref());
    let record = &state.decisions["approve_refund"];
    assert_eq!(record.decision, Decision::Approve);
    assert_eq!(record.decided_by.as_deref(), Some("reviewer"));
    assert_eq!(record.payload, json!({ "note": "looks fine" }));

    let history = h.store.checkpoint_history(run_id).await.unwrap();
    let ids: Vec<u64> = history.iter().map(|c| c.checkpoint_id.get()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    assert_eq!(h.counter(names::RUNS_COMPLETED), 1);
    assert_eq!(h.counter(names::EFFECTS_COMMITTED), 1);

    let mut seen = Vec::new();
    while let Some(notification) = notifications.try_recv() {
        seen.push(notification);
    }
    assert!(matches!(seen.first(), Some(RunNotification::Started { .. })));
    assert!(seen.iter().any(|n| matches!(
        n,
        RunNotification::ApprovalRequested { risk_level, .. } if risk_level == "high"
    )));
    assert!(matches!(seen.last(), Some(RunNotification::Completed { .. })));
}

#[tokio::test]
async fn identical_resume_is_idempotent() {
    let h = harness();
    let run_id = h.start_refund().await;
    h.drain().await;

    let control = h.engine.control();
    let first = control
        .resume_run(&h.caller, run_id, json!({ "ok": true }), C2)
        .await
        .unwrap();
    let second = control
        .resume_run(&h.caller, run_id, json!({ "ok": true }), C2)
        .await
        .unwrap();
    assert!(matches!(first, DecideOutcome::Applied(_)));
    assert!(matches!(second, DecideOutcome::Unchanged(_)));
    assert_eq!(first.ticket().decided_at, second.ticket().decided_at);

    h.drain().await;
    let third = control
        .resume_run(&h.caller, run_id, json!({ "ok": true }), C2)
        .await
        .unwrap();
    assert!(matches!(third, DecideOutcome::Unchanged(_)));
    assert_eq!(h.run(run_id).await.status, RunStatus::Completed);
    assert_eq!(h.refunds.calls(), 1);
}

#[tokio::test]
async fn stale_or_conflicting_decisions_are_refused() {
    let h = harness();
    let run_id = h.start_refund().await;
    h.drain().await;
    let control = h.engine.control();

    let stale = control
        .resume_run(&h.caller, run_id, json!({}), CheckpointId::FIRST)
        .await
        .unwrap_err();
    assert!(matches!(stale, EngineError::Conflict(_)), "{stale}");

    let ticket_id = h.run(run_id).await.last_ticket_id.unwrap();
    control
        .decide_ticket(&h.caller, ticket_id, Decision::Approve, json!({}), C2)
        .await
        .unwrap();
    h.drain().await;

    let late = control
        .decide_ticket(&h.caller, ticket_id, Decision::Reject, json!({}), C2)
        .await
        .unwrap_err();
    assert!(matches!(late, EngineError::Conflict(_)), "{late}");
    assert_eq!(h.refunds.calls(), 1);
}

#[tokio::test]
async fn rejection_fails_the_run_and_aborts_the_refund() {
    let h = harness();
    let run_id = h.start_refund().await;
    h.drain().await;

    let ticket_id = h.run(run_id).await.last_ticket_id.unwrap();
    h.engine
        .control()
        .decide_ticket(&h.caller, ticket_id, Decision::Reject, json!({ "why": "fraud" }), C2)
        .await
        .unwrap();
    h.drain().await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    let reason = run.last_error.unwrap();
    assert!(reason.starts_with("step: approve_refund: approval"), "{reason}");
    assert_eq!(h.refunds.calls(), 0);
    assert_eq!(h.effects(run_id).await[0].status, EffectStatus::Aborted);

    assert_eq!(
        h.lifecycle(run_id).await,
        vec![EventKind::Started, EventKind::PausedForApproval, EventKind::Failed]
    );
    let events = h.engine.timeline().collect(run_id).await.unwrap();
    let failed = TimelineEntry::from_event(events.last().unwrap()).unwrap();
    assert!(matches!(
        failed,
        TimelineEntry::Failed { kind: FailureKind::Rejected, step: Some(ref step), .. } if step == "approve_refund"
    ));
    assert!(h.kinds(run_id).await.contains(&EventKind::ApprovalRejected));
    assert_eq!(h.counter(names::RUNS_FAILED), 1);
}

#[tokio::test]
async fn overdue_tickets_expire_and_fail_the_run() {
    let h = harness();
    let run_id = h.start_refund().await;
    h.drain().await;

    let sweeper = h.engine.sweeper();
    assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap(), 0);
    let later = Utc::now() + TimeDelta::hours(2);
    assert_eq!(sweeper.sweep_once(later).await.unwrap(), 1);
    assert_eq!(h.counter(names::TICKETS_EXPIRED), 1);

    h.drain().await;
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.last_error.unwrap().contains("expired"));
    assert!(h.kinds(run_id).await.contains(&EventKind::TicketExpired));
    assert_eq!(h.effects(run_id).await[0].status, EffectStatus::Aborted);
    assert_eq!(h.refunds.calls(), 0);

    let err = h
        .engine
        .control()
        .resume_run(&h.caller, run_id, json!({}), C2)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)), "{err}");
}

#[tokio::test]
async fn cancel_wakes_a_parked_run() {
    let h = harness();
    let run_id = h.start_refund().await;
    h.drain().await;

    let run = h
        .engine
        .control()
        .cancel_run(&h.caller, run_id, "customer withdrew")
        .await
        .unwrap();
    assert!(run.cancel_requested());

    h.drain().await;
    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Canceled);
    let ticket = h.store.get_ticket(run.last_ticket_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(ticket.status, TicketStatus::Expired);
    assert_eq!(h.effects(run_id).await[0].status, EffectStatus::Aborted);

    let kinds = h.kinds(run_id).await;
    assert!(kinds.contains(&EventKind::CancelRequested));
    assert_eq!(kinds.last(), Some(&EventKind::Canceled));
    assert!(matches!(
        h.final_state(run_id).await.outcome,
        Some(Outcome::Canceled { .. })
    ));

    let again = h
        .engine
        .control()
        .cancel_run(&h.caller, run_id, "again")
        .await
        .unwrap_err();
    assert!(matches!(again, EngineError::InvalidState(_)), "{again}");
}

#[tokio::test]
async fn canceling_a_queued_run_never_starts_it() {
    let h = harness();
    let run_id = h.start_refund().await;
    h.engine
        .control()
        .cancel_run(&h.caller, run_id, "changed my mind")
        .await
        .unwrap();

    h.drain().await;
    assert_eq!(h.run(run_id).await.status, RunStatus::Canceled);
    let kinds = h.kinds(run_id).await;
    assert!(!kinds.contains(&EventKind::Started));
    assert!(h.effects(run_id).await.is_empty());
}

#[tokio::test]
async fn other_tenants_see_nothing() {
    let h = harness();
    let run_id = h.start_refund().await;
    h.drain().await;
    let ticket_id = h.run(run_id).await.last_ticket_id.unwrap();

    let stranger = Caller::new(TenantId::v4(), "mallory");
    let control = h.engine.control();
    assert!(matches!(
        control.get_run(&stranger, run_id).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(
        control.get_events(&stranger, run_id, Sequence::ZERO, 10).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(
        control.get_ticket(&stranger, ticket_id).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(matches!(
        control.resume_run(&stranger, run_id, json!({}), C2).await,
        Err(EngineError::NotFound { .. })
    ));
    assert!(
        control
            .list_inbox(&stranger, TicketFilter::default())
            .await
            .unwrap()
            .is_empty()
    );
    let taken = StartOptions {
        run_id: Some(run_id),
        ..StartOptions::default()
    };
    let input = json!({ "order_id": "o-1", "amount_cents": 4200 });
    assert!(matches!(
        control.start_run(&stranger, "refund", input, taken).await,
        Err(EngineError::Conflict(_))
    ));
    assert_eq!(h.run(run_id).await.tenant_id, h.caller.tenant_id);

    let inbox = control
        .list_inbox(
            &h.caller,
            TicketFilter {
                status: Some(TicketStatus::Pending),
                ..TicketFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].ticket_id, ticket_id);
}

#[tokio::test]
async fn start_run_validates_before_writing() {
    let h = harness();
    let control = h.engine.control();

    for (workflow, input) in [
        ("payout", json!({})),
        ("Not A Name", json!({})),
        ("refund", json!([1, 2, 3])),
    ] {
        let err = control
            .start_run(&h.caller, workflow, input, StartOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{workflow}: {err}");
    }

    let foreign_parent = Caller::new(TenantId::v4(), "other");
    let parent = control
        .start_run(&foreign_parent, "refund", json!({}), StartOptions::default())
        .await
        .unwrap();
    let err = control
        .start_run(
            &h.caller,
            "refund",
            json!({}),
            StartOptions {
                parent_run_id: Some(parent),
                ..StartOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }), "{err}");
    assert_eq!(h.engine.workflows().ids(), vec![workflow_id("refund")]);
}

#[tokio::test]
async fn invalid_input_fails_the_first_step() {
    let h = harness();
    let run_id = h.start("refund", json!({ "amount_cents": 0 })).await;
    h.drain().await;

    let run = h.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.last_error.as_deref(),
        Some("step: validate_refund: amount must be positive")
    );
    assert!(matches!(
        h.final_state(run_id).await.outcome,
        Some(Outcome::Failed { .. })
    ));
}

#[tokio::test]
async fn chosen_run_ids_are_idempotent_only_for_the_same_start() {
    let h = harness();
    let control = h.engine.control();
    let options = StartOptions {
        run_id: Some(RunId::v4()),
        ..StartOptions::default()
    };
    let input = json!({ "order_id": "o-7", "amount_cents": 900 });

    let first = control
        .start_run(&h.caller, "refund", input.clone(), options.clone())
        .await
        .unwrap();
    let retried = control
        .start_run(&h.caller, "refund", input, options.clone())
        .await
        .unwrap();
    assert_eq!(first, retried);

    let changed = control
        .start_run(&h.caller, "refund", json!({ "order_id": "o-7", "amount_cents": 1 }), options)
        .await;
    assert!(matches!(changed, Err(EngineError::Conflict(_))));
    assert_eq!(h.run(first).await.input["amount_cents"], 900);
}
