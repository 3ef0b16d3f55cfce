//! Reliable side-effect delivery (transactional outbox).
//!
//! Intents are written in the same transaction as the primary write that
//! caused them, then drained by background workers with at-least-once
//! delivery. Handlers must be idempotent; a bounded retry count with
//! exponential backoff separates transient failures from poisoned events.

pub mod dispatcher;
pub mod handlers;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use dispatcher::{OutboxDispatcher, OutboxHandler};
pub use handlers::{NarrativeIndexHandler, ObservationProcessHandler};
pub use store::OutboxStore;

/// Event type handled by the observation processor.
pub const EVENT_PROCESS_OBSERVATION: &str = "process_observation";
/// Event type handled by the narrative indexer.
pub const EVENT_INDEX_NARRATIVE: &str = "index_narrative";

/// Lifecycle of an outbox event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A durable side-effect intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    /// Monotonic claim-ordering key (assigned by storage).
    pub seq: i64,
    /// Kind of the aggregate that produced the event (e.g. `observation`).
    pub aggregate_type: String,
    /// Identity of the aggregate; claim order is FIFO within it.
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// Earliest time the event may be (re)claimed.
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An event about to be enqueued.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: Value,
}

impl NewOutboxEvent {
    /// Intent to recompute traits from an accepted observation.
    pub fn process_observation(person_id: Uuid, observation_id: Uuid) -> Self {
        Self {
            aggregate_type: "observation".to_string(),
            aggregate_id: person_id.to_string(),
            event_type: EVENT_PROCESS_OBSERVATION.to_string(),
            payload: serde_json::json!({ "observation_id": observation_id }),
        }
    }

    /// Intent to embed and index a new narrative.
    pub fn index_narrative(person_id: Uuid, narrative_id: Uuid) -> Self {
        Self {
            aggregate_type: "narrative".to_string(),
            aggregate_id: person_id.to_string(),
            event_type: EVENT_INDEX_NARRATIVE.to_string(),
            payload: serde_json::json!({ "narrative_id": narrative_id }),
        }
    }
}
