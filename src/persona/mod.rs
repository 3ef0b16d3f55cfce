//! Generated personas.
//!
//! A persona is ephemeral: created whole, never updated, superseded by
//! generating a new one, and expired by `expires_at`. `core` holds stable
//! trait-derived content, `overlay` the context-dependent state and
//! suggestions, and `narrative_context` records which narratives backed
//! which fired narrative checks.

pub mod generator;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use generator::{GeneratorConfig, PersonaGenerator};
pub use store::PersonaStore;

/// A generated, time-boxed persona document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: Uuid,
    pub person_id: Uuid,
    /// Config id of the mapper that produced this persona.
    pub mapper_id: String,
    /// Storage id of the exact mapper version used.
    pub mapper_config_id: Uuid,
    pub mapper_version: i64,
    /// Stable, trait-derived content.
    pub core: Value,
    /// Context-dependent content: current state and suggestions.
    pub overlay: Value,
    /// Narrative provenance per query, present when narrative checks fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub narrative_context: Option<Value>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Persona {
    /// Whether this persona has passed its validity horizon.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}
