//! Shared SQLite access for the component stores.
//!
//! Every store opens a fresh connection per operation against the same
//! database file. Connections run in WAL mode with a busy timeout so
//! concurrent writers (persona requests, the outbox dispatcher, mapper
//! activations) serialize instead of erroring. The physical layout here
//! stands in for the external persistence collaborator; the vector index
//! lives in process (see [`crate::narratives::index`]) and treats the
//! `embedding` column as its durable source of truth.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::errors::Result;

/// Current time as the RFC 3339 string stored in timestamp columns.
pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a stored RFC 3339 timestamp, falling back to the epoch on
/// corruption rather than failing a read.
pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}

/// Handle to the PersonaKit database file.
///
/// Cheap to clone; each store keeps its own copy.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Open (creating if needed) the database at `path` and ensure the
    /// schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Self { path };
        db.initialize()?;
        Ok(db)
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new connection with the standard pragmas applied.
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(conn)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mindscapes (
                person_id   TEXT PRIMARY KEY,
                traits      TEXT NOT NULL DEFAULT '{}',
                version     INTEGER NOT NULL DEFAULT 1,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS trait_history (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                person_id     TEXT NOT NULL,
                path          TEXT NOT NULL,
                value         TEXT NOT NULL,
                confidence    REAL NOT NULL,
                sample_size   INTEGER NOT NULL,
                recorded_at   TEXT NOT NULL,
                superseded_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trait_history_person_path
                ON trait_history(person_id, path);

            CREATE TABLE IF NOT EXISTS observations (
                id           TEXT PRIMARY KEY,
                person_id    TEXT NOT NULL,
                kind         TEXT NOT NULL,
                content      TEXT NOT NULL,
                metadata     TEXT NOT NULL DEFAULT '{}',
                processed_at TEXT,
                created_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_observations_person
                ON observations(person_id, created_at);

            CREATE TABLE IF NOT EXISTS narratives (
                id              TEXT PRIMARY KEY,
                person_id       TEXT NOT NULL,
                narrative_type  TEXT NOT NULL,
                raw_text        TEXT NOT NULL,
                tags            TEXT NOT NULL DEFAULT '[]',
                context         TEXT NOT NULL DEFAULT '{}',
                trait_path      TEXT,
                curation_action TEXT,
                source          TEXT,
                embedding       BLOB,
                created_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_narratives_person
                ON narratives(person_id, created_at);

            CREATE TABLE IF NOT EXISTS trait_narrative_links (
                id           TEXT PRIMARY KEY,
                narrative_id TEXT NOT NULL,
                trait_path   TEXT NOT NULL,
                person_id    TEXT NOT NULL,
                link_type    TEXT NOT NULL,
                confidence   REAL,
                created_at   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_links_narrative
                ON trait_narrative_links(narrative_id);

            CREATE TABLE IF NOT EXISTS mapper_configs (
                id           TEXT PRIMARY KEY,
                config_id    TEXT NOT NULL,
                version      INTEGER NOT NULL,
                document     TEXT NOT NULL,
                status       TEXT NOT NULL DEFAULT 'draft',
                created_at   TEXT NOT NULL,
                updated_at   TEXT NOT NULL,
                usage_count  INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                UNIQUE(config_id, version)
            );
            CREATE INDEX IF NOT EXISTS idx_mapper_configs_status
                ON mapper_configs(config_id, status);

            CREATE TABLE IF NOT EXISTS personas (
                id                TEXT PRIMARY KEY,
                person_id         TEXT NOT NULL,
                mapper_id         TEXT NOT NULL,
                mapper_config_id  TEXT NOT NULL,
                mapper_version    INTEGER NOT NULL,
                core              TEXT NOT NULL,
                overlay           TEXT NOT NULL,
                narrative_context TEXT,
                metadata          TEXT NOT NULL DEFAULT '{}',
                created_at        TEXT NOT NULL,
                expires_at        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_personas_person
                ON personas(person_id, expires_at);

            CREATE TABLE IF NOT EXISTS outbox_events (
                seq            INTEGER PRIMARY KEY AUTOINCREMENT,
                id             TEXT NOT NULL UNIQUE,
                aggregate_type TEXT NOT NULL,
                aggregate_id   TEXT NOT NULL,
                event_type     TEXT NOT NULL,
                payload        TEXT NOT NULL,
                status         TEXT NOT NULL DEFAULT 'pending',
                attempts       INTEGER NOT NULL DEFAULT 0,
                last_error     TEXT,
                run_after      TEXT NOT NULL,
                created_at     TEXT NOT NULL,
                updated_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_status
                ON outbox_events(status, run_after);
            CREATE INDEX IF NOT EXISTS idx_outbox_aggregate
                ON outbox_events(aggregate_id, seq);",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        let conn = db.connect().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'outbox_events'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        Database::open(&path).unwrap();
        Database::open(&path).unwrap();
    }
}
