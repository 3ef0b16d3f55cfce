//! SQLite-backed persona persistence.
//!
//! Personas are written with a single insert after assembly completes, so
//! a cancelled or failed generation leaves no partial state behind.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::errors::{PersonaKitError, Result};
use crate::storage::{parse_ts, Database};

use super::Persona;

/// Read/write access to generated personas.
#[derive(Debug, Clone)]
pub struct PersonaStore {
    db: Database,
}

impl PersonaStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a fully assembled persona.
    pub fn save(&self, persona: &Persona) -> Result<()> {
        let conn = self.db.connect()?;
        conn.execute(
            "INSERT INTO personas
                 (id, person_id, mapper_id, mapper_config_id, mapper_version,
                  core, overlay, narrative_context, metadata, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                persona.id.to_string(),
                persona.person_id.to_string(),
                persona.mapper_id,
                persona.mapper_config_id.to_string(),
                persona.mapper_version,
                serde_json::to_string(&persona.core)?,
                serde_json::to_string(&persona.overlay)?,
                persona
                    .narrative_context
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&persona.metadata)?,
                persona.created_at.to_rfc3339(),
                persona.expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Persist asynchronously.
    pub async fn asave(&self, persona: &Persona) -> Result<()> {
        let store = self.clone();
        let persona = persona.clone();
        tokio::task::spawn_blocking(move || store.save(&persona)).await?
    }

    /// Fetch a persona by id.
    pub fn get(&self, id: Uuid) -> Result<Persona> {
        let conn = self.db.connect()?;
        conn.query_row(
            "SELECT id, person_id, mapper_id, mapper_config_id, mapper_version,
                    core, overlay, narrative_context, metadata, created_at, expires_at
             FROM personas WHERE id = ?1",
            params![id.to_string()],
            row_to_persona,
        )
        .optional()?
        .ok_or(PersonaKitError::NotFound {
            what: "persona",
            id: id.to_string(),
        })
    }

    /// The most recent unexpired persona for a person and mapper, if any.
    pub fn current(&self, person_id: Uuid, mapper_id: &str) -> Result<Option<Persona>> {
        let conn = self.db.connect()?;
        let persona = conn
            .query_row(
                "SELECT id, person_id, mapper_id, mapper_config_id, mapper_version,
                        core, overlay, narrative_context, metadata, created_at, expires_at
                 FROM personas
                 WHERE person_id = ?1 AND mapper_id = ?2
                 ORDER BY created_at DESC
                 LIMIT 1",
                params![person_id.to_string(), mapper_id],
                row_to_persona,
            )
            .optional()?;
        Ok(persona.filter(|p| !p.is_expired()))
    }
}

fn row_to_persona(row: &Row<'_>) -> rusqlite::Result<Persona> {
    let id: String = row.get(0)?;
    let person_id: String = row.get(1)?;
    let mapper_config_id: String = row.get(3)?;
    let core: String = row.get(5)?;
    let overlay: String = row.get(6)?;
    let narrative_context: Option<String> = row.get(7)?;
    let metadata: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let expires_at: String = row.get(10)?;

    Ok(Persona {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        person_id: Uuid::parse_str(&person_id).unwrap_or_default(),
        mapper_id: row.get(2)?,
        mapper_config_id: Uuid::parse_str(&mapper_config_id).unwrap_or_default(),
        mapper_version: row.get(4)?,
        core: serde_json::from_str(&core).unwrap_or_default(),
        overlay: serde_json::from_str(&overlay).unwrap_or_default(),
        narrative_context: narrative_context
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok()),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: parse_ts(&created_at),
        expires_at: parse_ts(&expires_at),
    })
}
