#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Spire SQLite Store
//!
//! Durable driver implementing every Spire port on SQLite through `sqlx`.
//!
//! The pool holds a single connection, so SQLite sees exactly one writer and
//! every multi-statement port call runs inside one transaction. Claims are a
//! single `UPDATE .. RETURNING` statement.
//!
//! ```rust,ignore
//! let store = SqliteStore::connect("sqlite://spire.db").await?;
//! let store: Arc<dyn Store> = Arc::new(store);
//! ```

mod codec;
mod error;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use spire_core::{CheckpointId, EffectId, RunId, Sequence, TicketId, WorkerId};
use spire_execution::transition::can_transition_run;
use spire_execution::{
    Checkpoint, Effect, EffectStatus, Event, EventKind, Run, RunStatus, Ticket, TicketStatus,
};
use spire_ports::{
    CheckpointStore, Claim, ClaimedRun, DecideOutcome, EffectLedger, EventTimeline, NewEffect,
    NewRun, NewTicket, PortsError, PrepareOutcome, RunRepo, TicketDecision, TicketFilter,
    TicketStore, lease_deadline,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, QueryBuilder, Row, Sqlite, Transaction};
use uuid::Uuid;

use crate::codec::{
    checkpoint_from_row, effect_from_row, event_from_row, json_text, millis, run_from_row,
    ticket_from_row,
};
use crate::error::{ACQUIRE_TIMEOUT, map_migrate, map_sqlx};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite implementation of every Spire port.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and apply migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `sqlite://spire.db` or
    /// `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, PortsError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(map_sqlx)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            // An in-memory database lives and dies with its connection.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;
        let store = Self { pool };
        store.migrate().await?;
        tracing::info!(url, "sqlite store ready");
        Ok(store)
    }

    /// A fresh private in-memory database.
    pub async fn in_memory() -> Result<Self, PortsError> {
        Self::connect("sqlite::memory:").await
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<(), PortsError> {
        MIGRATOR.run(&self.pool).await.map_err(map_migrate)
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Begin a transaction that holds the write lock from the start.
    async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, PortsError> {
        self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(map_sqlx)
    }
}

async fn load_run<'e, E>(executor: E, run_id: RunId) -> Result<Option<Run>, PortsError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("SELECT * FROM runs WHERE run_id = ?")
        .bind(run_id.to_string())
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx)?
        .as_ref()
        .map(run_from_row)
        .transpose()
}

async fn load_ticket<'e, E>(executor: E, ticket_id: TicketId) -> Result<Option<Ticket>, PortsError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("SELECT * FROM tickets WHERE ticket_id = ?")
        .bind(ticket_id.to_string())
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx)?
        .as_ref()
        .map(ticket_from_row)
        .transpose()
}

async fn load_effect<'e, E>(executor: E, effect_id: &EffectId) -> Result<Option<Effect>, PortsError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("SELECT * FROM effects WHERE effect_id = ?")
        .bind(effect_id.as_str())
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx)?
        .as_ref()
        .map(effect_from_row)
        .transpose()
}

/// Write every mutable run column back.
async fn store_run<'e, E>(executor: E, run: &Run) -> Result<(), PortsError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let lease = run.lease.as_ref();
    sqlx::query(
        "UPDATE runs SET status = ?, updated_at = ?, started_at = ?, finished_at = ?, \
         last_error = ?, cancel_requested_at = ?, claimed_by = ?, claim_token = ?, \
         claim_expires_at = ? WHERE run_id = ?",
    )
    .bind(run.status.as_str())
    .bind(millis(run.updated_at))
    .bind(run.started_at.map(millis))
    .bind(run.finished_at.map(millis))
    .bind(run.last_error.as_deref())
    .bind(run.cancel_requested_at.map(millis))
    .bind(lease.map(|l| l.worker_id.to_string()))
    .bind(lease.map(|l| l.token.to_string()))
    .bind(lease.map(|l| millis(l.expires_at)))
    .bind(run.run_id.to_string())
    .execute(executor)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

fn holds(run: &Run, claim: &Claim) -> bool {
    run.lease.as_ref().is_some_and(|l| l.token == claim.token)
}

#[async_trait]
impl RunRepo for SqliteStore {
    async fn create_run(&self, new: NewRun) -> Result<Run, PortsError> {
        let now = millis(Utc::now());
        sqlx::query(
            "INSERT INTO runs (run_id, tenant_id, workflow_id, parent_run_id, status, priority, \
             input, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(new.run_id.to_string())
        .bind(new.tenant_id.to_string())
        .bind(new.workflow_id.as_str())
        .bind(new.parent_run_id.map(|id| id.to_string()))
        .bind(RunStatus::Queued.as_str())
        .bind(i64::from(new.priority))
        .bind(json_text(&new.input))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        load_run(&self.pool, new.run_id)
            .await?
            .ok_or_else(|| PortsError::Internal(format!("run {} vanished after insert", new.run_id)))
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, PortsError> {
        load_run(&self.pool, run_id).await
    }

    async fn claim_next(
        &self,
        worker_id: &WorkerId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRun>, PortsError> {
        let token = Uuid::new_v4();
        let expires_at = lease_deadline(now, ttl);
        let row = sqlx::query(
            "UPDATE runs \
             SET claimed_by = ?1, claim_token = ?2, claim_expires_at = ?3, updated_at = ?4 \
             WHERE run_id = ( \
                 SELECT r.run_id FROM runs r \
                 LEFT JOIN tickets t ON t.ticket_id = r.last_ticket_id \
                 WHERE (r.claim_expires_at IS NULL OR r.claim_expires_at <= ?4) \
                   AND (r.status IN ('queued', 'running') \
                        OR (r.status = 'waiting_approval' \
                            AND (r.cancel_requested_at IS NOT NULL \
                                 OR t.status IN ('approved', 'rejected', 'expired')))) \
                 ORDER BY r.priority, r.updated_at, r.rowid \
                 LIMIT 1) \
             RETURNING *",
        )
        .bind(worker_id.as_str())
        .bind(token.to_string())
        .bind(millis(expires_at))
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let run = run_from_row(&row)?;
        tracing::debug!(run_id = %run.run_id, worker = %worker_id, "run claimed");
        let claim = Claim {
            run_id: run.run_id,
            worker_id: worker_id.clone(),
            token,
            expires_at: run.lease.as_ref().map_or(expires_at, |l| l.expires_at),
        };
        Ok(Some(ClaimedRun { run, claim }))
    }

    async fn renew_claim(
        &self,
        claim: &Claim,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Claim, PortsError> {
        let expires_at = lease_deadline(now, ttl);
        let renewed = sqlx::query(
            "UPDATE runs SET claim_expires_at = ? WHERE run_id = ? AND claim_token = ?",
        )
        .bind(millis(expires_at))
        .bind(claim.run_id.to_string())
        .bind(claim.token.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        if renewed.rows_affected() == 0 {
            return Err(PortsError::lease_unavailable(claim.run_id));
        }
        Ok(Claim {
            expires_at,
            ..claim.clone()
        })
    }

    async fn release_claim(&self, claim: &Claim) -> Result<(), PortsError> {
        sqlx::query(
            "UPDATE runs SET claimed_by = NULL, claim_token = NULL, claim_expires_at = NULL \
             WHERE run_id = ? AND claim_token = ?",
        )
        .bind(claim.run_id.to_string())
        .bind(claim.token.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn transition(
        &self,
        claim: &Claim,
        to: RunStatus,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Run, PortsError> {
        let mut tx = self.begin_write().await?;
        let mut run = load_run(&mut *tx, claim.run_id)
            .await?
            .ok_or_else(|| PortsError::not_found("run", claim.run_id))?;
        if !holds(&run, claim) {
            return Err(PortsError::lease_unavailable(claim.run_id));
        }
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
        store_run(&mut *tx, &run).await?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(run)
    }

    async fn request_cancel(&self, run_id: RunId, now: DateTime<Utc>) -> Result<Run, PortsError> {
        let mut tx = self.begin_write().await?;
        let mut run = load_run(&mut *tx, run_id)
            .await?
            .ok_or_else(|| PortsError::not_found("run", run_id))?;
        if run.status.is_terminal() {
            return Err(PortsError::invalid_state("run", run_id, "non-terminal", run.status));
        }
        if run.cancel_requested_at.is_none() {
            run.cancel_requested_at = Some(now);
            run.updated_at = now;
            store_run(&mut *tx, &run).await?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(run)
    }
}

#[async_trait]
impl CheckpointStore for SqliteStore {
    async fn append_checkpoint(
        &self,
        run_id: RunId,
        state_payload: Value,
    ) -> Result<CheckpointId, PortsError> {
        let now = millis(Utc::now());
        let mut tx = self.begin_write().await?;
        let row = sqlx::query("SELECT last_checkpoint_id FROM runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?
            .ok_or_else(|| PortsError::not_found("run", run_id))?;
        let last: Option<i64> = row.try_get("last_checkpoint_id").map_err(map_sqlx)?;
        let checkpoint_id = last.map_or(CheckpointId::FIRST, |n| {
            CheckpointId::new(n.max(0) as u64).next()
        });

        sqlx::query(
            "INSERT INTO checkpoints (run_id, checkpoint_id, state_payload, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(checkpoint_id.get() as i64)
        .bind(json_text(&state_payload))
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        sqlx::query("UPDATE runs SET last_checkpoint_id = ?, updated_at = ? WHERE run_id = ?")
            .bind(checkpoint_id.get() as i64)
            .bind(now)
            .bind(run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(checkpoint_id)
    }

    async fn latest_checkpoint(&self, run_id: RunId) -> Result<Option<Checkpoint>, PortsError> {
        sqlx::query(
            "SELECT * FROM checkpoints WHERE run_id = ? ORDER BY checkpoint_id DESC LIMIT 1",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .as_ref()
        .map(checkpoint_from_row)
        .transpose()
    }

    async fn get_checkpoint(
        &self,
        run_id: RunId,
        checkpoint_id: CheckpointId,
    ) -> Result<Option<Checkpoint>, PortsError> {
        sqlx::query("SELECT * FROM checkpoints WHERE run_id = ? AND checkpoint_id = ?")
            .bind(run_id.to_string())
            .bind(checkpoint_id.get() as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .as_ref()
            .map(checkpoint_from_row)
            .transpose()
    }

    async fn checkpoint_history(&self, run_id: RunId) -> Result<Vec<Checkpoint>, PortsError> {
        sqlx::query("SELECT * FROM checkpoints WHERE run_id = ? ORDER BY checkpoint_id")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(checkpoint_from_row)
            .collect()
    }
}

#[async_trait]
impl EventTimeline for SqliteStore {
    async fn append_event(
        &self,
        run_id: RunId,
        event_type: EventKind,
        payload: Value,
    ) -> Result<Sequence, PortsError> {
        let mut tx = self.begin_write().await?;
        if load_run(&mut *tx, run_id).await?.is_none() {
            return Err(PortsError::not_found("run", run_id));
        }
        let last: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(sequence), 0) FROM events WHERE run_id = ?")
                .bind(run_id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        let sequence = Sequence::new(last.max(0) as u64).next();

        sqlx::query(
            "INSERT INTO events (run_id, sequence, event_type, payload, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id.to_string())
        .bind(sequence.get() as i64)
        .bind(event_type.as_str())
        .bind(json_text(&payload))
        .bind(millis(Utc::now()))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(sequence)
    }

    async fn read_events(
        &self,
        run_id: RunId,
        after: Sequence,
        limit: usize,
    ) -> Result<Vec<Event>, PortsError> {
        sqlx::query(
            "SELECT * FROM events WHERE run_id = ? AND sequence > ? ORDER BY sequence LIMIT ?",
        )
        .bind(run_id.to_string())
        .bind(after.get() as i64)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(event_from_row)
        .collect()
    }
}

#[async_trait]
impl EffectLedger for SqliteStore {
    async fn prepare_effect(&self, new: NewEffect) -> Result<PrepareOutcome, PortsError> {
        let inserted = sqlx::query(
            "INSERT INTO effects (effect_id, run_id, action, status, prepared_payload, ticket_id, \
             created_at) VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT (effect_id) DO NOTHING",
        )
        .bind(new.effect_id.as_str())
        .bind(new.run_id.to_string())
        .bind(new.action.as_str())
        .bind(EffectStatus::Prepared.as_str())
        .bind(json_text(&new.params))
        .bind(new.ticket_id.map(|id| id.to_string()))
        .bind(millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let effect = load_effect(&self.pool, &new.effect_id)
            .await?
            .ok_or_else(|| PortsError::not_found("effect", &new.effect_id))?;
        if inserted.rows_affected() == 1 {
            Ok(PrepareOutcome::Prepared(effect))
        } else {
            Ok(PrepareOutcome::AlreadyExists(effect))
        }
    }

    async fn commit_effect(&self, effect_id: &EffectId, result: Value) -> Result<Effect, PortsError> {
        let row = sqlx::query(
            "UPDATE effects SET status = ?, result_payload = ?, committed_at = ? \
             WHERE effect_id = ? AND status = ? RETURNING *",
        )
        .bind(EffectStatus::Committed.as_str())
        .bind(json_text(&result))
        .bind(millis(Utc::now()))
        .bind(effect_id.as_str())
        .bind(EffectStatus::Prepared.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => effect_from_row(&row),
            None => Err(self.refused(effect_id).await),
        }
    }

    async fn abort_effect(&self, effect_id: &EffectId) -> Result<Effect, PortsError> {
        let row = sqlx::query(
            "UPDATE effects SET status = ?1 WHERE effect_id = ?2 AND status IN (?1, ?3) RETURNING *",
        )
        .bind(EffectStatus::Aborted.as_str())
        .bind(effect_id.as_str())
        .bind(EffectStatus::Prepared.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => effect_from_row(&row),
            None => Err(self.refused(effect_id).await),
        }
    }

    async fn lookup_effect(&self, effect_id: &EffectId) -> Result<Option<Effect>, PortsError> {
        load_effect(&self.pool, effect_id).await
    }

    async fn effects_for_run(&self, run_id: RunId) -> Result<Vec<Effect>, PortsError> {
        sqlx::query("SELECT * FROM effects WHERE run_id = ? ORDER BY rowid")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(effect_from_row)
            .collect()
    }
}

impl SqliteStore {
    /// Explain why a conditional effect update matched no row.
    async fn refused(&self, effect_id: &EffectId) -> PortsError {
        match load_effect(&self.pool, effect_id).await {
            Ok(Some(effect)) => {
                PortsError::invalid_state("effect", effect_id, EffectStatus::Prepared, effect.status)
            }
            Ok(None) => PortsError::not_found("effect", effect_id),
            Err(err) => err,
        }
    }
}

#[async_trait]
impl TicketStore for SqliteStore {
    async fn create_ticket(&self, new: NewTicket, now: DateTime<Utc>) -> Result<Ticket, PortsError> {
        let mut tx = self.begin_write().await?;
        let touched = sqlx::query("UPDATE runs SET last_ticket_id = ?, updated_at = ? WHERE run_id = ?")
            .bind(new.ticket_id.to_string())
            .bind(millis(now))
            .bind(new.run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        if touched.rows_affected() == 0 {
            return Err(PortsError::not_found("run", new.run_id));
        }

        sqlx::query(
            "INSERT INTO tickets (ticket_id, tenant_id, run_id, checkpoint_id, interrupt_id, \
             status, risk_level, context_pack, effect_id, expected_checkpoint_id, created_at, \
             expires_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (ticket_id) DO NOTHING",
        )
        .bind(new.ticket_id.to_string())
        .bind(new.tenant_id.to_string())
        .bind(new.run_id.to_string())
        .bind(new.checkpoint_id.get() as i64)
        .bind(new.interrupt_id.as_str())
        .bind(TicketStatus::Pending.as_str())
        .bind(new.risk_level.as_str())
        .bind(json_text(&new.context_pack))
        .bind(new.effect_id.as_ref().map(EffectId::as_str))
        .bind(new.checkpoint_id.get() as i64)
        .bind(millis(now))
        .bind(new.expires_at.map(millis))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let ticket = load_ticket(&mut *tx, new.ticket_id)
            .await?
            .ok_or_else(|| PortsError::not_found("ticket", new.ticket_id))?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(ticket)
    }

    async fn get_ticket(&self, ticket_id: TicketId) -> Result<Option<Ticket>, PortsError> {
        load_ticket(&self.pool, ticket_id).await
    }

    async fn decide_ticket(
        &self,
        ticket_id: TicketId,
        decision: TicketDecision,
        expected: CheckpointId,
        now: DateTime<Utc>,
    ) -> Result<DecideOutcome, PortsError> {
        let mut tx = self.begin_write().await?;
        let ticket = load_ticket(&mut *tx, ticket_id)
            .await?
            .ok_or_else(|| PortsError::not_found("ticket", ticket_id))?;

        if ticket.records(decision.decision, &decision.payload) {
            return Ok(DecideOutcome::Unchanged(ticket));
        }
        if expected != ticket.expected_checkpoint_id {
            return Err(PortsError::conflict(
                "ticket",
                ticket_id,
                expected.get(),
                ticket.expected_checkpoint_id.get(),
            ));
        }
        let current = load_run(&mut *tx, ticket.run_id)
            .await?
            .and_then(|run| run.last_checkpoint_id);
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

        let row = sqlx::query(
            "UPDATE tickets SET status = ?, decision_payload = ?, decided_by = ?, decided_at = ? \
             WHERE ticket_id = ? RETURNING *",
        )
        .bind(decision.decision.resulting_status().as_str())
        .bind(json_text(&decision.payload))
        .bind(decision.decided_by.as_deref())
        .bind(millis(now))
        .bind(ticket_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        let decided = ticket_from_row(&row)?;
        sqlx::query("UPDATE runs SET updated_at = ? WHERE run_id = ?")
            .bind(millis(now))
            .bind(decided.run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(DecideOutcome::Applied(decided))
    }

    async fn list_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>, PortsError> {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM tickets WHERE 1 = 1");
        if let Some(tenant_id) = filter.tenant_id {
            query.push(" AND tenant_id = ").push_bind(tenant_id.to_string());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(risk_level) = filter.risk_level {
            query.push(" AND risk_level = ").push_bind(risk_level.as_str());
        }
        if let Some(run_id) = filter.run_id {
            query.push(" AND run_id = ").push_bind(run_id.to_string());
        }
        query
            .push(" ORDER BY created_at DESC, ticket_id DESC LIMIT ")
            .push_bind(i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX));

        query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?
            .iter()
            .map(ticket_from_row)
            .collect()
    }

    async fn expire_overdue_tickets(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>, PortsError> {
        sqlx::query(
            "UPDATE tickets SET status = ?1, decided_at = ?2 \
             WHERE status = ?3 AND expires_at IS NOT NULL AND expires_at <= ?2 RETURNING *",
        )
        .bind(TicketStatus::Expired.as_str())
        .bind(millis(now))
        .bind(TicketStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?
        .iter()
        .map(ticket_from_row)
        .collect()
    }

    async fn expire_ticket(&self, ticket_id: TicketId, now: DateTime<Utc>) -> Result<Ticket, PortsError> {
        let mut tx = self.begin_write().await?;
        let ticket = load_ticket(&mut *tx, ticket_id)
            .await?
            .ok_or_else(|| PortsError::not_found("ticket", ticket_id))?;
        let ticket = match ticket.status {
            TicketStatus::Pending => {
                let row = sqlx::query(
                    "UPDATE tickets SET status = ?, decided_at = ? WHERE ticket_id = ? RETURNING *",
                )
                .bind(TicketStatus::Expired.as_str())
                .bind(millis(now))
                .bind(ticket_id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx)?;
                ticket_from_row(&row)?
            }
            TicketStatus::Expired => ticket,
            TicketStatus::Approved | TicketStatus::Rejected => {
                return Err(PortsError::AlreadyDecided {
                    ticket_id: ticket_id.to_string(),
                    status: ticket.status.to_string(),
                });
            }
        };
        tx.commit().await.map_err(map_sqlx)?;
        Ok(ticket)
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
        fn _check(store: SqliteStore) {
            _takes_store(Arc::new(store));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn writers_on_one_file_wait_for_the_lock() {
        use serde_json::json;
        use spire_core::{TenantId, WorkflowId};

        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("spire.db").display());
        let first = SqliteStore::connect(&url).await.expect("open");
        let second = SqliteStore::connect(&url).await.expect("open again");
        let run_id = RunId::v4();
        first
            .create_run(NewRun {
                run_id,
                tenant_id: TenantId::v4(),
                workflow_id: WorkflowId::new("shared").expect("workflow id"),
                parent_run_id: None,
                priority: 0,
                input: json!({}),
            })
            .await
            .expect("create run");

        // Hold an uncommitted write while the other pool reads then writes.
        let mut held = first.begin_write().await.expect("lock");
        sqlx::query("UPDATE runs SET priority = priority + 1 WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&mut *held)
            .await
            .expect("touch run");
        let waiting =
            tokio::spawn(async move { second.append_checkpoint(run_id, json!({ "n": 1 })).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        held.commit().await.expect("commit");

        let appended = waiting.await.expect("join").expect("append after lock release");
        assert_eq!(appended, CheckpointId::FIRST);
        let run = first.get_run(run_id).await.expect("get").expect("run");
        assert_eq!(run.priority, 1);
        assert_eq!(run.last_checkpoint_id, Some(CheckpointId::FIRST));
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = SqliteStore::in_memory().await.expect("open");
        store.migrate().await.expect("second migrate");
        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&store.pool)
                .await
                .expect("tables");
        for table in ["checkpoints", "effects", "events", "runs", "tickets"] {
            assert!(tables.iter().any(|t| t == table), "missing {table}");
        }
    }
}
