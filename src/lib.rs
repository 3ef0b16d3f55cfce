//! # PersonaKit
//!
//! Builds short-lived, context-adapted personas for a person from two
//! knowledge sources: confidence-scored traits (the mindscape) and
//! free-text narratives with semantic embeddings.
//!
//! The pipeline: inbound observations enqueue outbox work; background
//! workers recompute traits and index narrative embeddings; a persona
//! request resolves the active mapper version, snapshots traits,
//! prefetches narrative matches, runs the rule engine, and assembles a
//! time-boxed persona with `core`, `overlay`, and narrative provenance.
//!
//! The HTTP surface, physical schema migrations, and the concrete
//! embedding model are external collaborators; this crate exposes the
//! component APIs those boundaries map onto.

pub mod config;
pub mod embeddings;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod mapper;
pub mod mindscape;
pub mod narratives;
pub mod observations;
pub mod outbox;
pub mod persona;
pub mod storage;

pub use config::Settings;
pub use embeddings::{EmbeddingProvider, HttpEmbeddingProvider};
pub use engine::{EvaluationContext, EvaluationOutcome, EvaluationWarning, RuleEngine};
pub use errors::{PersonaKitError, Result};
pub use mapper::{MapperConfig, MapperConfigStore, MapperDocument, MapperStatus};
pub use mindscape::{Mindscape, MindscapeStore, TraitValue};
pub use narratives::{Narrative, NarrativeKind, NarrativeSearch, NarrativeStore};
pub use observations::{Observation, ObservationKind, ObservationStore};
pub use outbox::{OutboxDispatcher, OutboxEvent, OutboxStatus, OutboxStore};
pub use persona::{Persona, PersonaGenerator, PersonaStore};
pub use storage::Database;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
