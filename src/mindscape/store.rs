//! SQLite-backed mindscape persistence.
//!
//! Trait updates are append-then-supersede: every applied value lands in
//! `trait_history`, and the previously current row for the same
//! `(person_id, path)` gets a `superseded_at` stamp in the same
//! transaction. The aggregated tree in `mindscapes` is what persona
//! generation snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::Result;
use crate::storage::{now_str, parse_ts, Database};

use super::{merge_trait, navigate, set_path, Mindscape, TraitValue};

/// One retained historical value for a trait path.
#[derive(Debug, Clone)]
pub struct TraitHistoryEntry {
    pub path: String,
    pub value: Value,
    pub confidence: f64,
    pub sample_size: i64,
    pub recorded_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

/// Read/write access to per-person trait state.
#[derive(Debug, Clone)]
pub struct MindscapeStore {
    db: Database,
}

impl MindscapeStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch the mindscape for a person, if one exists.
    pub fn get(&self, person_id: Uuid) -> Result<Option<Mindscape>> {
        let conn = self.db.connect()?;
        let row = conn
            .query_row(
                "SELECT traits, version, updated_at FROM mindscapes WHERE person_id = ?1",
                params![person_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((traits_json, version, updated_at)) => Ok(Some(Mindscape {
                person_id,
                traits: serde_json::from_str(&traits_json)?,
                version,
                updated_at: parse_ts(&updated_at),
            })),
            None => Ok(None),
        }
    }

    /// Point-in-time snapshot for persona generation. A person with no
    /// recorded traits yields an empty mindscape rather than an error.
    pub fn snapshot(&self, person_id: Uuid) -> Result<Mindscape> {
        Ok(self.get(person_id)?.unwrap_or_else(|| Mindscape::empty(person_id)))
    }

    /// Snapshot asynchronously.
    pub async fn asnapshot(&self, person_id: Uuid) -> Result<Mindscape> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.snapshot(person_id)).await?
    }

    /// Merge a batch of extracted trait values into the person's mindscape.
    ///
    /// The aggregate update, the history append, and the supersede stamp on
    /// the prior current rows all commit in one transaction; the mindscape
    /// version increments once per applied batch.
    pub fn apply_traits(
        &self,
        person_id: Uuid,
        updates: HashMap<String, TraitValue>,
    ) -> Result<Mindscape> {
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let now = now_str();

        let existing = tx
            .query_row(
                "SELECT traits, version FROM mindscapes WHERE person_id = ?1",
                params![person_id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        let (mut traits, version) = match existing {
            Some((raw, version)) => (serde_json::from_str(&raw)?, version),
            None => (serde_json::json!({}), 0),
        };

        for (path, incoming) in &updates {
            let merged = match current_leaf(&traits, path) {
                Some(current) => merge_trait(&current, incoming),
                None => incoming.clone(),
            };

            tx.execute(
                "UPDATE trait_history SET superseded_at = ?1
                 WHERE person_id = ?2 AND path = ?3 AND superseded_at IS NULL",
                params![now, person_id.to_string(), path],
            )?;
            tx.execute(
                "INSERT INTO trait_history
                     (person_id, path, value, confidence, sample_size, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    person_id.to_string(),
                    path,
                    serde_json::to_string(&merged.value)?,
                    merged.confidence,
                    merged.sample_size,
                    now,
                ],
            )?;

            set_path(&mut traits, path, serde_json::to_value(&merged)?);
        }

        let new_version = version + 1;
        tx.execute(
            "INSERT INTO mindscapes (person_id, traits, version, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(person_id) DO UPDATE SET
                 traits = excluded.traits,
                 version = excluded.version,
                 updated_at = excluded.updated_at",
            params![
                person_id.to_string(),
                serde_json::to_string(&traits)?,
                new_version,
                now,
            ],
        )?;
        tx.commit()?;

        log::debug!(
            "applied {} trait updates for person {} (version {})",
            updates.len(),
            person_id,
            new_version
        );

        Ok(Mindscape {
            person_id,
            traits,
            version: new_version,
            updated_at: parse_ts(&now),
        })
    }

    /// Retained history for one trait path, most recent first.
    pub fn history(
        &self,
        person_id: Uuid,
        path: &str,
        limit: usize,
    ) -> Result<Vec<TraitHistoryEntry>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(
            "SELECT path, value, confidence, sample_size, recorded_at, superseded_at
             FROM trait_history
             WHERE person_id = ?1 AND path = ?2
             ORDER BY id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![person_id.to_string(), path, limit as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (path, value, confidence, sample_size, recorded_at, superseded_at) = row?;
            entries.push(TraitHistoryEntry {
                path,
                value: serde_json::from_str(&value)?,
                confidence,
                sample_size,
                recorded_at: parse_ts(&recorded_at),
                superseded_at: superseded_at.as_deref().map(parse_ts),
            });
        }
        Ok(entries)
    }
}

/// Interpret the node at `path` as a trait leaf, if it is one.
fn current_leaf(traits: &Value, path: &str) -> Option<TraitValue> {
    let node = navigate(traits, path)?;
    serde_json::from_value(node.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, MindscapeStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        (dir, MindscapeStore::new(db))
    }

    #[test]
    fn test_apply_creates_and_versions() {
        let (_dir, store) = store();
        let person = Uuid::new_v4();

        let mut updates = HashMap::new();
        updates.insert(
            "work.focus_duration".to_string(),
            TraitValue::new(json!(45.0), 0.9, 1),
        );
        let mindscape = store.apply_traits(person, updates).unwrap();
        assert_eq!(mindscape.version, 1);
        let leaf = mindscape.trait_at("work.focus_duration").unwrap();
        assert_eq!(leaf["value"], json!(45.0));

        let mut updates = HashMap::new();
        updates.insert(
            "work.focus_duration".to_string(),
            TraitValue::new(json!(55.0), 0.9, 1),
        );
        let mindscape = store.apply_traits(person, updates).unwrap();
        assert_eq!(mindscape.version, 2);
        // Equal confidences average the two measurements.
        let merged = mindscape.trait_at("work.focus_duration").unwrap();
        assert!((merged["value"].as_f64().unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_supersedes_previous_rows() {
        let (_dir, store) = store();
        let person = Uuid::new_v4();

        for value in [30.0, 40.0] {
            let mut updates = HashMap::new();
            updates.insert(
                "work.focus_duration".to_string(),
                TraitValue::new(json!(value), 0.8, 1),
            );
            store.apply_traits(person, updates).unwrap();
        }

        let history = store.history(person, "work.focus_duration", 10).unwrap();
        assert_eq!(history.len(), 2);
        // Most recent row is still current; the older one is superseded.
        assert!(history[0].superseded_at.is_none());
        assert!(history[1].superseded_at.is_some());
    }

    #[test]
    fn test_snapshot_of_unknown_person_is_empty() {
        let (_dir, store) = store();
        let mindscape = store.snapshot(Uuid::new_v4()).unwrap();
        assert_eq!(mindscape.version, 0);
        assert_eq!(mindscape.traits, json!({}));
    }
}
