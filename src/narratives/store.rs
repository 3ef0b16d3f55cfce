//! SQLite-backed narrative persistence.
//!
//! The `embedding` column is the durable source for the in-process ANN
//! index; vectors are stored as little-endian f32 blobs.

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::errors::{PersonaKitError, Result};
use crate::outbox::{NewOutboxEvent, OutboxStore};
use crate::storage::{parse_ts, Database};

use super::{Narrative, NarrativeKind, TraitNarrativeLink};

/// Encode an embedding as a little-endian f32 blob.
fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(v.len() * 4);
    for x in v {
        blob.extend_from_slice(&x.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 blob.
fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Read/write access to narratives and trait links.
#[derive(Debug, Clone)]
pub struct NarrativeStore {
    db: Database,
    outbox: OutboxStore,
}

impl NarrativeStore {
    pub fn new(db: Database) -> Self {
        let outbox = OutboxStore::new(db.clone());
        Self { db, outbox }
    }

    /// Accept a narrative: the row and its `index_narrative` outbox event
    /// commit in one transaction, so embedding and indexing can never be
    /// lost between the write and the enqueue.
    pub fn create(&self, narrative: &Narrative) -> Result<Uuid> {
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        insert_on(&tx, narrative)?;
        let event_id = self.outbox.enqueue_on(
            &tx,
            NewOutboxEvent::index_narrative(narrative.person_id, narrative.id),
        )?;
        tx.commit()?;

        log::debug!(
            "accepted narrative {} for person {} (outbox event {})",
            narrative.id,
            narrative.person_id,
            event_id
        );
        Ok(event_id)
    }

    /// Persist a narrative without scheduling indexing work. Narratives
    /// are immutable once created.
    pub fn insert(&self, narrative: &Narrative) -> Result<()> {
        let conn = self.db.connect()?;
        insert_on(&conn, narrative)
    }

    /// Fetch a narrative by id.
    pub fn get(&self, id: Uuid) -> Result<Narrative> {
        let conn = self.db.connect()?;
        conn.query_row(
            "SELECT id, person_id, narrative_type, raw_text, tags, context,
                    trait_path, curation_action, source, embedding, created_at
             FROM narratives WHERE id = ?1",
            params![id.to_string()],
            row_to_narrative,
        )
        .optional()?
        .ok_or(PersonaKitError::NotFound {
            what: "narrative",
            id: id.to_string(),
        })
    }

    /// Store the computed embedding for a narrative.
    pub fn set_embedding(&self, id: Uuid, embedding: &[f32]) -> Result<()> {
        let conn = self.db.connect()?;
        let updated = conn.execute(
            "UPDATE narratives SET embedding = ?1 WHERE id = ?2",
            params![vec_to_blob(embedding), id.to_string()],
        )?;
        if updated == 0 {
            return Err(PersonaKitError::NotFound {
                what: "narrative",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// All narratives that already carry an embedding, for index rebuild.
    pub fn embedded(&self) -> Result<Vec<(Uuid, Uuid, Vec<f32>)>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, person_id, embedding FROM narratives
             WHERE embedding IS NOT NULL ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, person_id, blob) = row?;
            let id = parse_uuid(&id)?;
            let person_id = parse_uuid(&person_id)?;
            out.push((id, person_id, blob_to_vec(&blob)));
        }
        Ok(out)
    }

    /// Narratives for a person, most recent first.
    pub fn for_person(
        &self,
        person_id: Uuid,
        kind: Option<NarrativeKind>,
        limit: usize,
    ) -> Result<Vec<Narrative>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, person_id, narrative_type, raw_text, tags, context,
                    trait_path, curation_action, source, embedding, created_at
             FROM narratives
             WHERE person_id = ?1 AND (?2 IS NULL OR narrative_type = ?2)
             ORDER BY created_at DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                person_id.to_string(),
                kind.map(|k| k.as_str()),
                limit as i64
            ],
            row_to_narrative,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Persist a trait-narrative link.
    pub fn insert_link(&self, link: &TraitNarrativeLink) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "INSERT INTO trait_narrative_links
                 (id, narrative_id, trait_path, person_id, link_type, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                link.id.to_string(),
                link.narrative_id.to_string(),
                link.trait_path,
                link.person_id.to_string(),
                link.link_type,
                link.confidence,
                link.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Whether a link of the given type already exists for a narrative.
    pub fn link_exists(&self, narrative_id: Uuid, link_type: &str) -> Result<bool> {
        let conn = self.db.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM trait_narrative_links
             WHERE narrative_id = ?1 AND link_type = ?2",
            params![narrative_id.to_string(), link_type],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

fn insert_on(conn: &Connection, narrative: &Narrative) -> Result<()> {
    conn.execute(
        "INSERT INTO narratives
             (id, person_id, narrative_type, raw_text, tags, context,
              trait_path, curation_action, source, embedding, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            narrative.id.to_string(),
            narrative.person_id.to_string(),
            narrative.kind.as_str(),
            narrative.raw_text,
            serde_json::to_string(&narrative.tags)?,
            serde_json::to_string(&narrative.context)?,
            narrative.trait_path,
            narrative.curation_action,
            narrative.source,
            narrative.embedding.as_deref().map(vec_to_blob),
            narrative.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| PersonaKitError::NotFound {
        what: "narrative",
        id: raw.to_string(),
    })
}

fn row_to_narrative(row: &Row<'_>) -> rusqlite::Result<Narrative> {
    let id: String = row.get(0)?;
    let person_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let tags: String = row.get(4)?;
    let context: String = row.get(5)?;
    let embedding: Option<Vec<u8>> = row.get(9)?;
    let created_at: String = row.get(10)?;

    Ok(Narrative {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        person_id: Uuid::parse_str(&person_id).unwrap_or_default(),
        kind: NarrativeKind::parse(&kind).unwrap_or(NarrativeKind::SelfObservation),
        raw_text: row.get(3)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        context: serde_json::from_str(&context).unwrap_or_default(),
        trait_path: row.get(6)?,
        curation_action: row.get(7)?,
        source: row.get(8)?,
        embedding: embedding.as_deref().map(blob_to_vec),
        created_at: parse_ts(&created_at),
    })
}
