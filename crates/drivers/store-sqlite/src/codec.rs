//! Row decoding and column encoding.
//!
//! Timestamps are UTC milliseconds, identifiers and enums are their string
//! forms and JSON documents are TEXT.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::Value;
use spire_core::{CheckpointId, EffectId, RunId, Sequence, TenantId, TicketId, WorkerId, WorkflowId};
use spire_execution::{Checkpoint, Effect, Event, Lease, Run, Ticket};
use spire_ports::PortsError;
use sqlx::sqlite::SqliteRow;
use sqlx::{Decode, Row, Sqlite, Type};
use uuid::Uuid;

use crate::error::map_sqlx;

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn json_text(value: &Value) -> String {
    value.to_string()
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, PortsError>
where
    T: Decode<'r, Sqlite> + Type<Sqlite>,
{
    row.try_get(name).map_err(map_sqlx)
}

fn parsed<T>(kind: &str, raw: &str) -> Result<T, PortsError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e| PortsError::Serialization(format!("{kind} {raw:?}: {e}")))
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>, PortsError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| PortsError::Serialization(format!("timestamp out of range: {ms}")))
}

fn opt_timestamp(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, PortsError> {
    ms.map(timestamp).transpose()
}

fn json(raw: &str) -> Result<Value, PortsError> {
    Ok(serde_json::from_str(raw)?)
}

fn opt_json(raw: Option<String>) -> Result<Option<Value>, PortsError> {
    raw.as_deref().map(json).transpose()
}

fn run_id(raw: &str) -> Result<RunId, PortsError> {
    RunId::parse(raw).map_err(|e| PortsError::Serialization(format!("run id {raw:?}: {e}")))
}

fn ticket_id(raw: &str) -> Result<TicketId, PortsError> {
    TicketId::parse(raw).map_err(|e| PortsError::Serialization(format!("ticket id {raw:?}: {e}")))
}

fn tenant_id(raw: &str) -> Result<TenantId, PortsError> {
    TenantId::parse(raw).map_err(|e| PortsError::Serialization(format!("tenant id {raw:?}: {e}")))
}

fn effect_id(raw: &str) -> Result<EffectId, PortsError> {
    EffectId::from_hex(raw).map_err(|e| PortsError::Serialization(e.to_string()))
}

fn counter(raw: i64) -> u64 {
    raw.max(0) as u64
}

pub(crate) fn run_from_row(row: &SqliteRow) -> Result<Run, PortsError> {
    let lease = match (
        col::<Option<String>>(row, "claimed_by")?,
        col::<Option<String>>(row, "claim_token")?,
        col::<Option<i64>>(row, "claim_expires_at")?,
    ) {
        (Some(worker), Some(token), Some(expires_at)) => Some(Lease {
            worker_id: WorkerId::new(&worker).map_err(|e| PortsError::Serialization(e.to_string()))?,
            token: parsed::<Uuid>("claim token", &token)?,
            expires_at: timestamp(expires_at)?,
        }),
        _ => None,
    };
    let workflow: String = col(row, "workflow_id")?;

    Ok(Run {
        run_id: run_id(&col::<String>(row, "run_id")?)?,
        tenant_id: tenant_id(&col::<String>(row, "tenant_id")?)?,
        workflow_id: WorkflowId::new(&workflow).map_err(|e| PortsError::Serialization(e.to_string()))?,
        parent_run_id: col::<Option<String>>(row, "parent_run_id")?
            .as_deref()
            .map(run_id)
            .transpose()?,
        status: parsed("run status", &col::<String>(row, "status")?)?,
        priority: col::<i64>(row, "priority")? as i32,
        input: json(&col::<String>(row, "input")?)?,
        last_checkpoint_id: col::<Option<i64>>(row, "last_checkpoint_id")?
            .map(|n| CheckpointId::new(counter(n))),
        last_ticket_id: col::<Option<String>>(row, "last_ticket_id")?
            .as_deref()
            .map(ticket_id)
            .transpose()?,
        created_at: timestamp(col(row, "created_at")?)?,
        started_at: opt_timestamp(col(row, "started_at")?)?,
        finished_at: opt_timestamp(col(row, "finished_at")?)?,
        updated_at: timestamp(col(row, "updated_at")?)?,
        last_error: col(row, "last_error")?,
        cancel_requested_at: opt_timestamp(col(row, "cancel_requested_at")?)?,
        lease,
    })
}

pub(crate) fn checkpoint_from_row(row: &SqliteRow) -> Result<Checkpoint, PortsError> {
    Ok(Checkpoint {
        run_id: run_id(&col::<String>(row, "run_id")?)?,
        checkpoint_id: CheckpointId::new(counter(col(row, "checkpoint_id")?)),
        state_payload: json(&col::<String>(row, "state_payload")?)?,
        created_at: timestamp(col(row, "created_at")?)?,
    })
}

pub(crate) fn event_from_row(row: &SqliteRow) -> Result<Event, PortsError> {
    Ok(Event {
        run_id: run_id(&col::<String>(row, "run_id")?)?,
        sequence: Sequence::new(counter(col(row, "sequence")?)),
        event_type: parsed("event type", &col::<String>(row, "event_type")?)?,
        payload: json(&col::<String>(row, "payload")?)?,
        created_at: timestamp(col(row, "created_at")?)?,
    })
}

pub(crate) fn effect_from_row(row: &SqliteRow) -> Result<Effect, PortsError> {
    Ok(Effect {
        effect_id: effect_id(&col::<String>(row, "effect_id")?)?,
        run_id: run_id(&col::<String>(row, "run_id")?)?,
        action: col(row, "action")?,
        status: parsed("effect status", &col::<String>(row, "status")?)?,
        prepared_payload: json(&col::<String>(row, "prepared_payload")?)?,
        result_payload: opt_json(col(row, "result_payload")?)?,
        ticket_id: col::<Option<String>>(row, "ticket_id")?
            .as_deref()
            .map(ticket_id)
            .transpose()?,
        created_at: timestamp(col(row, "created_at")?)?,
        committed_at: opt_timestamp(col(row, "committed_at")?)?,
    })
}

pub(crate) fn ticket_from_row(row: &SqliteRow) -> Result<Ticket, PortsError> {
    Ok(Ticket {
        ticket_id: ticket_id(&col::<String>(row, "ticket_id")?)?,
        tenant_id: tenant_id(&col::<String>(row, "tenant_id")?)?,
        run_id: run_id(&col::<String>(row, "run_id")?)?,
        checkpoint_id: CheckpointId::new(counter(col(row, "checkpoint_id")?)),
        interrupt_id: col(row, "interrupt_id")?,
        status: parsed("ticket status", &col::<String>(row, "status")?)?,
        risk_level: parsed("risk level", &col::<String>(row, "risk_level")?)?,
        context_pack: json(&col::<String>(row, "context_pack")?)?,
        decision_payload: opt_json(col(row, "decision_payload")?)?,
        decided_by: col(row, "decided_by")?,
        effect_id: col::<Option<String>>(row, "effect_id")?
            .as_deref()
            .map(effect_id)
            .transpose()?,
        expected_checkpoint_id: CheckpointId::new(counter(col(row, "expected_checkpoint_id")?)),
        created_at: timestamp(col(row, "created_at")?)?,
        decided_at: opt_timestamp(col(row, "decided_at")?)?,
        expires_at: opt_timestamp(col(row, "expires_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::SubsecRound;

    #[test]
    fn timestamps_round_trip_at_millisecond_precision() {
        let now = Utc::now().trunc_subsecs(3);
        assert_eq!(timestamp(millis(now)).unwrap(), now);
        assert_eq!(
            timestamp(millis(DateTime::<Utc>::MAX_UTC)).unwrap(),
            DateTime::<Utc>::MAX_UTC.trunc_subsecs(3)
        );
    }

    #[test]
    fn bad_enum_text_is_a_serialization_error() {
        let err = parsed::<spire_execution::RunStatus>("run status", "sleeping").unwrap_err();
        assert!(matches!(err, PortsError::Serialization(msg) if msg.contains("sleeping")));
    }

    #[test]
    fn negative_counters_clamp_to_zero() {
        assert_eq!(counter(-3), 0);
        assert_eq!(counter(7), 7);
    }
}
