//! SQLite-backed observation persistence.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::errors::{PersonaKitError, Result};
use crate::outbox::{NewOutboxEvent, OutboxStore};
use crate::storage::{parse_ts, Database};

use super::{Observation, ObservationKind};

/// Read/write access to observations.
#[derive(Debug, Clone)]
pub struct ObservationStore {
    db: Database,
    outbox: OutboxStore,
}

impl ObservationStore {
    pub fn new(db: Database) -> Self {
        let outbox = OutboxStore::new(db.clone());
        Self { db, outbox }
    }

    /// Accept an observation: the row and its `process_observation` outbox
    /// event commit in one transaction, so the trait recompute can never be
    /// lost between the write and the enqueue.
    pub fn create(&self, observation: &Observation) -> Result<Uuid> {
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO observations
                 (id, person_id, kind, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                observation.id.to_string(),
                observation.person_id.to_string(),
                observation.kind.as_str(),
                serde_json::to_string(&observation.content)?,
                serde_json::to_string(&observation.metadata)?,
                observation.created_at.to_rfc3339(),
            ],
        )?;
        let event_id = self.outbox.enqueue_on(
            &tx,
            NewOutboxEvent::process_observation(observation.person_id, observation.id),
        )?;
        tx.commit()?;

        log::debug!(
            "accepted observation {} for person {} (outbox event {})",
            observation.id,
            observation.person_id,
            event_id
        );
        Ok(event_id)
    }

    /// Fetch an observation by id.
    pub fn get(&self, id: Uuid) -> Result<Observation> {
        let conn = self.db.connect()?;
        conn.query_row(
            "SELECT id, person_id, kind, content, metadata, processed_at, created_at
             FROM observations WHERE id = ?1",
            params![id.to_string()],
            row_to_observation,
        )
        .optional()?
        .ok_or(PersonaKitError::NotFound {
            what: "observation",
            id: id.to_string(),
        })
    }

    /// Recent observations for a person, most recent first.
    pub fn recent(&self, person_id: Uuid, limit: usize) -> Result<Vec<Observation>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, person_id, kind, content, metadata, processed_at, created_at
             FROM observations
             WHERE person_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![person_id.to_string(), limit as i64],
            row_to_observation,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Recent observations asynchronously.
    pub async fn arecent(&self, person_id: Uuid, limit: usize) -> Result<Vec<Observation>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.recent(person_id, limit)).await?
    }

    /// Stamp an observation as processed. Returns `false` if it already
    /// was, which lets the outbox handler skip redelivered work.
    pub fn mark_processed(&self, id: Uuid) -> Result<bool> {
        let conn = self.db.connect()?;
        let updated = conn.execute(
            "UPDATE observations SET processed_at = ?1
             WHERE id = ?2 AND processed_at IS NULL",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(updated == 1)
    }
}

fn row_to_observation(row: &Row<'_>) -> rusqlite::Result<Observation> {
    let id: String = row.get(0)?;
    let person_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let content: String = row.get(3)?;
    let metadata: String = row.get(4)?;
    let processed_at: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(Observation {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        person_id: Uuid::parse_str(&person_id).unwrap_or_default(),
        kind: ObservationKind::parse(&kind).unwrap_or(ObservationKind::UserInput),
        content: serde_json::from_str(&content).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        processed_at: processed_at.as_deref().map(parse_ts),
        created_at: parse_ts(&created_at),
    })
}
