//! Versioned mapper configuration storage.
//!
//! Lifecycle is a guarded finite-state machine: uploads land as `draft`,
//! a draft becomes `active` through an atomic swap that demotes the prior
//! active version to `deprecated` in the same transaction, and `deprecated`
//! is terminal. Versions are monotonically increasing per config id. The
//! single-active-version invariant is enforced inside one immediate
//! transaction, so concurrent activations serialize and exactly one wins.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::errors::{PersonaKitError, Result};
use crate::storage::{now_str, parse_ts, Database};

use super::document::MapperDocument;

/// Lifecycle state of one mapper version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperStatus {
    Draft,
    Active,
    Deprecated,
}

impl MapperStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Deprecated => "deprecated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

/// One stored mapper version.
#[derive(Debug, Clone)]
pub struct MapperConfig {
    pub id: Uuid,
    pub config_id: String,
    pub version: i64,
    pub document: MapperDocument,
    pub status: MapperStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub usage_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Versioned mapper configuration store.
#[derive(Debug, Clone)]
pub struct MapperConfigStore {
    db: Database,
}

impl MapperConfigStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validate and store a document as a new draft version.
    ///
    /// The version is `metadata.version` when it exceeds every stored
    /// version for the config id, otherwise latest + 1.
    pub fn upload(&self, document: MapperDocument) -> Result<MapperConfig> {
        document.validate()?;

        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let config_id = document.metadata.id.clone();
        let latest: Option<i64> = tx
            .query_row(
                "SELECT MAX(version) FROM mapper_configs WHERE config_id = ?1",
                params![config_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        let next = latest.unwrap_or(0) + 1;
        let version = match document.metadata.version {
            Some(v) if v >= next => v,
            _ => next,
        };

        let id = Uuid::new_v4();
        let now = now_str();
        tx.execute(
            "INSERT INTO mapper_configs
                 (id, config_id, version, document, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?5)",
            params![
                id.to_string(),
                config_id,
                version,
                serde_json::to_string(&document.to_json_value()?)?,
                now,
            ],
        )?;
        tx.commit()?;

        log::info!("uploaded mapper '{config_id}' version {version} as draft");
        self.get(&config_id, version)
    }

    /// Promote a draft version to active, demoting the current active
    /// version (if any) to deprecated in the same transaction.
    ///
    /// Activating the already-active version is a no-op; activating a
    /// deprecated version is rejected.
    pub fn activate(&self, config_id: &str, version: i64) -> Result<MapperConfig> {
        let mut conn = self.db.connect()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM mapper_configs WHERE config_id = ?1 AND version = ?2",
                params![config_id, version],
                |row| row.get(0),
            )
            .optional()?;

        let status = status.ok_or(PersonaKitError::NotFound {
            what: "mapper version",
            id: format!("{config_id}/{version}"),
        })?;

        match MapperStatus::parse(&status) {
            Some(MapperStatus::Active) => {
                // Someone beat us to it; the invariant already holds.
                tx.commit()?;
                return self.get(config_id, version);
            }
            Some(MapperStatus::Deprecated) => {
                return Err(PersonaKitError::validation(vec![format!(
                    "version {version} of '{config_id}' is deprecated and cannot be reactivated"
                )]));
            }
            _ => {}
        }

        let now = now_str();
        tx.execute(
            "UPDATE mapper_configs SET status = 'deprecated', updated_at = ?1
             WHERE config_id = ?2 AND status = 'active'",
            params![now, config_id],
        )?;
        tx.execute(
            "UPDATE mapper_configs SET status = 'active', updated_at = ?1
             WHERE config_id = ?2 AND version = ?3",
            params![now, config_id, version],
        )?;
        tx.commit()?;

        log::info!("activated mapper '{config_id}' version {version}");
        self.get(config_id, version)
    }

    /// The active version for a config id.
    pub fn get_active(&self, config_id: &str) -> Result<MapperConfig> {
        let conn = self.db.connect()?;
        conn.query_row(
            "SELECT id, config_id, version, document, status, created_at, updated_at,
                    usage_count, last_used_at
             FROM mapper_configs
             WHERE config_id = ?1 AND status = 'active'
             ORDER BY version DESC
             LIMIT 1",
            params![config_id],
            row_to_config,
        )
        .optional()?
        .ok_or_else(|| PersonaKitError::ConfigNotFound {
            config_id: config_id.to_string(),
        })
    }

    /// The active version, asynchronously.
    pub async fn aget_active(&self, config_id: &str) -> Result<MapperConfig> {
        let store = self.clone();
        let config_id = config_id.to_string();
        tokio::task::spawn_blocking(move || store.get_active(&config_id)).await?
    }

    /// A specific stored version.
    pub fn get(&self, config_id: &str, version: i64) -> Result<MapperConfig> {
        let conn = self.db.connect()?;
        conn.query_row(
            "SELECT id, config_id, version, document, status, created_at, updated_at,
                    usage_count, last_used_at
             FROM mapper_configs
             WHERE config_id = ?1 AND version = ?2",
            params![config_id, version],
            row_to_config,
        )
        .optional()?
        .ok_or(PersonaKitError::NotFound {
            what: "mapper version",
            id: format!("{config_id}/{version}"),
        })
    }

    /// Every stored version of a config id, newest first.
    pub fn versions(&self, config_id: &str) -> Result<Vec<MapperConfig>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, config_id, version, document, status, created_at, updated_at,
                    usage_count, last_used_at
             FROM mapper_configs
             WHERE config_id = ?1
             ORDER BY version DESC",
        )?;
        let rows = stmt.query_map(params![config_id], row_to_config)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The latest version of every config id.
    pub fn list_latest(&self) -> Result<Vec<MapperConfig>> {
        let conn = self.db.connect()?;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.config_id, m.version, m.document, m.status, m.created_at,
                    m.updated_at, m.usage_count, m.last_used_at
             FROM mapper_configs m
             JOIN (SELECT config_id, MAX(version) AS max_version
                   FROM mapper_configs GROUP BY config_id) latest
               ON m.config_id = latest.config_id AND m.version = latest.max_version
             ORDER BY m.config_id",
        )?;
        let rows = stmt.query_map([], row_to_config)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Best-effort usage bump after a successful evaluation. Lost
    /// increments under crash are acceptable; callers log and continue on
    /// error.
    pub fn record_usage(&self, id: Uuid) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "UPDATE mapper_configs
             SET usage_count = usage_count + 1, last_used_at = ?1
             WHERE id = ?2",
            params![now_str(), id.to_string()],
        )?;
        Ok(())
    }

    /// Usage bump, asynchronously.
    pub async fn arecord_usage(&self, id: Uuid) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.record_usage(id)).await?
    }
}

fn row_to_config(row: &Row<'_>) -> rusqlite::Result<MapperConfig> {
    let id: String = row.get(0)?;
    let document: String = row.get(3)?;
    let status: String = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    let last_used_at: Option<String> = row.get(8)?;

    let document_value: serde_json::Value =
        serde_json::from_str(&document).unwrap_or_default();

    Ok(MapperConfig {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        config_id: row.get(1)?,
        version: row.get(2)?,
        document: MapperDocument::from_json_value(document_value).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            )
        })?,
        status: MapperStatus::parse(&status).unwrap_or(MapperStatus::Draft),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        usage_count: row.get(7)?,
        last_used_at: last_used_at.as_deref().map(parse_ts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, MapperConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        (dir, MapperConfigStore::new(db))
    }

    fn doc(config_id: &str) -> MapperDocument {
        MapperDocument::from_yaml_str(&format!(
            r#"
metadata: {{id: {config_id}, name: Test Mapper}}
rules:
  - id: r1
    conditions: {{type: trait_check, path: work.energy, operator: equals, value: high}}
    actions: [{{type: set_core_field, field: style, value: {{default: focused}}}}]
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_upload_auto_increments_versions() {
        let (_dir, store) = fixture();
        let v1 = store.upload(doc("daily")).unwrap();
        let v2 = store.upload(doc("daily")).unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v1.status, MapperStatus::Draft);
    }

    #[test]
    fn test_upload_honors_larger_explicit_version() {
        let (_dir, store) = fixture();
        store.upload(doc("daily")).unwrap();
        let mut document = doc("daily");
        document.metadata.version = Some(10);
        let stored = store.upload(document).unwrap();
        assert_eq!(stored.version, 10);
        // A stale explicit version falls back to auto-increment.
        let mut document = doc("daily");
        document.metadata.version = Some(3);
        let stored = store.upload(document).unwrap();
        assert_eq!(stored.version, 11);
    }

    #[test]
    fn test_upload_rejects_invalid_document() {
        let (_dir, store) = fixture();
        let mut document = doc("daily");
        document.rules.clear();
        let err = store.upload(document).unwrap_err();
        assert!(matches!(err, PersonaKitError::Validation { .. }));
    }

    #[test]
    fn test_round_trip_preserves_rule_tree() {
        let (_dir, store) = fixture();
        let document = doc("daily");
        let stored = store.upload(document.clone()).unwrap();
        let fetched = store.get("daily", stored.version).unwrap();
        assert_eq!(fetched.document.rules, document.rules);
        assert_eq!(fetched.document.metadata.id, document.metadata.id);
    }

    #[test]
    fn test_activation_swaps_atomically() {
        let (_dir, store) = fixture();
        store.upload(doc("daily")).unwrap();
        store.upload(doc("daily")).unwrap();

        store.activate("daily", 1).unwrap();
        assert_eq!(store.get_active("daily").unwrap().version, 1);

        store.activate("daily", 2).unwrap();
        assert_eq!(store.get_active("daily").unwrap().version, 2);
        assert_eq!(store.get("daily", 1).unwrap().status, MapperStatus::Deprecated);

        let actives = store
            .versions("daily")
            .unwrap()
            .into_iter()
            .filter(|c| c.status == MapperStatus::Active)
            .count();
        assert_eq!(actives, 1);
    }

    #[test]
    fn test_activation_rejects_deprecated_version() {
        let (_dir, store) = fixture();
        store.upload(doc("daily")).unwrap();
        store.upload(doc("daily")).unwrap();
        store.activate("daily", 1).unwrap();
        store.activate("daily", 2).unwrap();

        let err = store.activate("daily", 1).unwrap_err();
        assert!(matches!(err, PersonaKitError::Validation { .. }));
        // Re-activating the active version is a harmless no-op.
        store.activate("daily", 2).unwrap();
        assert_eq!(store.get_active("daily").unwrap().version, 2);
    }

    #[test]
    fn test_get_active_without_activation_fails() {
        let (_dir, store) = fixture();
        store.upload(doc("daily")).unwrap();
        let err = store.get_active("daily").unwrap_err();
        assert!(matches!(err, PersonaKitError::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_activation_leaves_one_active() {
        let (_dir, store) = fixture();
        store.upload(doc("daily")).unwrap();
        store.upload(doc("daily")).unwrap();
        store.activate("daily", 1).unwrap();

        let a = {
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.activate("daily", 2))
        };
        let b = {
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.activate("daily", 2))
        };
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.unwrap().is_ok());
        assert!(rb.unwrap().is_ok());

        let versions = store.versions("daily").unwrap();
        let actives: Vec<i64> = versions
            .iter()
            .filter(|c| c.status == MapperStatus::Active)
            .map(|c| c.version)
            .collect();
        assert_eq!(actives, vec![2]);
        assert_eq!(store.get("daily", 1).unwrap().status, MapperStatus::Deprecated);
    }

    #[test]
    fn test_usage_tracking() {
        let (_dir, store) = fixture();
        let stored = store.upload(doc("daily")).unwrap();
        assert_eq!(stored.usage_count, 0);
        store.record_usage(stored.id).unwrap();
        store.record_usage(stored.id).unwrap();
        let fetched = store.get("daily", stored.version).unwrap();
        assert_eq!(fetched.usage_count, 2);
        assert!(fetched.last_used_at.is_some());
    }

    #[test]
    fn test_list_latest_one_row_per_config() {
        let (_dir, store) = fixture();
        store.upload(doc("daily")).unwrap();
        store.upload(doc("daily")).unwrap();
        store.upload(doc("weekly")).unwrap();

        let latest = store.list_latest().unwrap();
        assert_eq!(latest.len(), 2);
        let daily = latest.iter().find(|c| c.config_id == "daily").unwrap();
        assert_eq!(daily.version, 2);
    }
}
