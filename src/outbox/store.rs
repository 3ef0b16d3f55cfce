//! SQLite-backed outbox queue.
//!
//! The claim step is a conditional update inside an immediate transaction:
//! a batch of due `pending` events flips to `processing` atomically, so two
//! workers can never hold the same event. The claim subquery also skips any
//! event whose aggregate still has an earlier unfinished event, preserving
//! FIFO per aggregate id even with concurrent workers.

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::errors::{PersonaKitError, Result};
use crate::storage::{now_str, parse_ts, Database};

use super::{NewOutboxEvent, OutboxEvent, OutboxStatus};

/// Queue operations over `outbox_events`.
#[derive(Debug, Clone)]
pub struct OutboxStore {
    db: Database,
}

impl OutboxStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue an event in its own transaction.
    pub fn enqueue(&self, event: NewOutboxEvent) -> Result<Uuid> {
        let conn = self.db.connect()?;
        self.enqueue_on(&conn, event)
    }

    /// Enqueue an event on an existing connection, so the caller can bundle
    /// it with the state change that produced it.
    pub fn enqueue_on(&self, conn: &Connection, event: NewOutboxEvent) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = now_str();
        conn.execute(
            "INSERT INTO outbox_events
                 (id, aggregate_type, aggregate_id, event_type, payload,
                  status, attempts, run_after, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6, ?6)",
            params![
                id.to_string(),
                event.aggregate_type,
                event.aggregate_id,
                event.event_type,
                serde_json::to_string(&event.payload)?,
                now,
            ],
        )?;
        Ok(id)
    }

    /// Claim up to `limit` due events, marking them `processing`.
    ///
    /// Events are claimed oldest first; an event is skipped while an
    /// earlier event for the same aggregate is still pending or processing.
    pub fn claim_batch(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = now_str();

        let seqs: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT o.seq FROM outbox_events o
                 WHERE o.status = 'pending' AND o.run_after <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM outbox_events p
                       WHERE p.aggregate_id = o.aggregate_id
                         AND p.seq < o.seq
                         AND p.status IN ('pending', 'processing')
                   )
                 ORDER BY o.seq
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now, limit as i64], |row| row.get(0))?;
            let mut seqs = Vec::new();
            for row in rows {
                seqs.push(row?);
            }
            seqs
        };

        let mut claimed = Vec::with_capacity(seqs.len());
        for seq in &seqs {
            let updated = tx.execute(
                "UPDATE outbox_events SET status = 'processing', updated_at = ?1
                 WHERE seq = ?2 AND status = 'pending'",
                params![now, seq],
            )?;
            if updated == 1 {
                let event = tx.query_row(
                    "SELECT id, seq, aggregate_type, aggregate_id, event_type, payload,
                            status, attempts, last_error, run_after, created_at, updated_at
                     FROM outbox_events WHERE seq = ?1",
                    params![seq],
                    row_to_event,
                )?;
                claimed.push(event);
            }
        }

        tx.commit()?;
        Ok(claimed)
    }

    /// Mark a claimed event done.
    pub fn mark_done(&self, id: Uuid) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE outbox_events SET status = 'done', updated_at = ?1 WHERE id = ?2",
            params![now_str(), id.to_string()],
        )?;
        Ok(())
    }

    /// Record a handler failure.
    ///
    /// Below the attempt bound the event returns to `pending` with an
    /// exponentially delayed `run_after`; at the bound it becomes `failed`
    /// and stays visible for operational alerting.
    pub fn mark_failed(&self, id: Uuid, error: &str, max_attempts: i64) -> Result<OutboxStatus> {
        let conn = self.db.connect()?;
        let attempts: i64 = conn
            .query_row(
                "SELECT attempts FROM outbox_events WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(PersonaKitError::NotFound {
                what: "outbox event",
                id: id.to_string(),
            })?;

        let attempts = attempts + 1;
        let truncated: String = error.chars().take(500).collect();
        let status = if attempts < max_attempts {
            OutboxStatus::Pending
        } else {
            OutboxStatus::Failed
        };
        let backoff_secs = (60i64 << (attempts - 1).min(10)).min(3600);
        let run_after = (Utc::now() + Duration::seconds(backoff_secs)).to_rfc3339();

        conn.execute(
            "UPDATE outbox_events
             SET status = ?1, attempts = ?2, last_error = ?3, run_after = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                status.as_str(),
                attempts,
                truncated,
                run_after,
                now_str(),
                id.to_string()
            ],
        )?;
        Ok(status)
    }

    /// Fetch one event by id.
    pub fn get(&self, id: Uuid) -> Result<OutboxEvent> {
        let conn = self.db.connect()?;
        conn.query_row(
            "SELECT id, seq, aggregate_type, aggregate_id, event_type, payload,
                    status, attempts, last_error, run_after, created_at, updated_at
             FROM outbox_events WHERE id = ?1",
            params![id.to_string()],
            row_to_event,
        )
        .optional()?
        .ok_or(PersonaKitError::NotFound {
            what: "outbox event",
            id: id.to_string(),
        })
    }

    /// Number of events waiting to be claimed.
    pub fn pending_count(&self) -> Result<i64> {
        let conn = self.db.connect()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM outbox_events WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?)
    }

    /// Delete done/failed events older than `days`. Returns how many rows
    /// were removed.
    pub fn cleanup(&self, days: i64) -> Result<usize> {
        let conn = self.db.connect()?;
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let removed = conn.execute(
            "DELETE FROM outbox_events
             WHERE status IN ('done', 'failed') AND updated_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    let id: String = row.get(0)?;
    let payload: String = row.get(5)?;
    let status: String = row.get(6)?;
    let run_after: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;

    Ok(OutboxEvent {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        seq: row.get(1)?,
        aggregate_type: row.get(2)?,
        aggregate_id: row.get(3)?,
        event_type: row.get(4)?,
        payload: serde_json::from_str(&payload).unwrap_or_default(),
        status: OutboxStatus::parse(&status).unwrap_or(OutboxStatus::Pending),
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        run_after: parse_ts(&run_after),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}
