//! Inbound observations.
//!
//! Observations are raw signals about a person (work sessions, free-form
//! input, calendar events). Accepting one writes the observation row and
//! its outbox event in the same transaction, so trait recomputation is
//! guaranteed to eventually run even across process restarts.

pub mod extraction;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use extraction::TraitExtractor;
pub use store::ObservationStore;

/// Source kind of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    WorkSession,
    UserInput,
    CalendarEvent,
}

impl ObservationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkSession => "work_session",
            Self::UserInput => "user_input",
            Self::CalendarEvent => "calendar_event",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "work_session" => Some(Self::WorkSession),
            "user_input" => Some(Self::UserInput),
            "calendar_event" => Some(Self::CalendarEvent),
            _ => None,
        }
    }
}

/// A raw observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: Uuid,
    pub person_id: Uuid,
    pub kind: ObservationKind,
    /// Kind-specific payload.
    pub content: Value,
    pub metadata: Value,
    /// Set once the outbox handler has recomputed traits from this row.
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Observation {
    /// Build a new unprocessed observation stamped now.
    pub fn new(person_id: Uuid, kind: ObservationKind, content: Value, metadata: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            person_id,
            kind,
            content,
            metadata,
            processed_at: None,
            created_at: Utc::now(),
        }
    }
}
