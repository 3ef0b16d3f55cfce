//! Standard outbox handlers.
//!
//! Both handlers are idempotent: the observation processor skips rows
//! already stamped `processed_at`, and the narrative indexer skips
//! narratives that already carry an embedding. Redelivered events are
//! therefore harmless.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{PersonaKitError, Result};
use crate::mindscape::MindscapeStore;
use crate::narratives::{NarrativeSearch, NarrativeStore, TraitNarrativeLink};
use crate::observations::{ObservationStore, TraitExtractor};
use crate::storage::Database;

use super::dispatcher::OutboxHandler;
use super::{OutboxEvent, EVENT_INDEX_NARRATIVE, EVENT_PROCESS_OBSERVATION};

fn payload_uuid(event: &OutboxEvent, key: &str) -> Result<Uuid> {
    event
        .payload
        .get(key)
        .and_then(Value::as_str)
        .and_then(|raw| Uuid::parse_str(raw).ok())
        .ok_or(PersonaKitError::OutboxHandlerFailure {
            event_id: event.id,
            message: format!("payload missing '{key}'"),
        })
}

/// Recomputes traits from an accepted observation.
pub struct ObservationProcessHandler {
    observations: ObservationStore,
    mindscapes: MindscapeStore,
    extractor: TraitExtractor,
}

impl ObservationProcessHandler {
    pub fn new(db: Database) -> Self {
        Self {
            observations: ObservationStore::new(db.clone()),
            mindscapes: MindscapeStore::new(db),
            extractor: TraitExtractor::new(),
        }
    }
}

#[async_trait]
impl OutboxHandler for ObservationProcessHandler {
    fn event_type(&self) -> &'static str {
        EVENT_PROCESS_OBSERVATION
    }

    async fn handle(&self, event: &OutboxEvent) -> Result<()> {
        let observation_id = payload_uuid(event, "observation_id")?;
        let observations = self.observations.clone();
        let mindscapes = self.mindscapes.clone();
        let extractor = self.extractor.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let observation = observations.get(observation_id)?;
            if observation.processed_at.is_some() {
                log::debug!("observation {observation_id} already processed; skipping");
                return Ok(());
            }

            let traits = extractor.extract(observation.kind, &observation.content);
            if traits.is_empty() {
                log::warn!("no traits extracted from observation {observation_id}");
            } else {
                let mindscape = mindscapes.apply_traits(observation.person_id, traits)?;
                log::info!(
                    "observation {observation_id} applied (mindscape version {})",
                    mindscape.version
                );
            }
            observations.mark_processed(observation_id)?;
            Ok(())
        })
        .await?
    }
}

/// Embeds and indexes a new narrative; curations also get their trait
/// link.
pub struct NarrativeIndexHandler {
    narratives: NarrativeStore,
    search: Arc<NarrativeSearch>,
}

impl NarrativeIndexHandler {
    pub fn new(db: Database, search: Arc<NarrativeSearch>) -> Self {
        Self {
            narratives: NarrativeStore::new(db),
            search,
        }
    }
}

#[async_trait]
impl OutboxHandler for NarrativeIndexHandler {
    fn event_type(&self) -> &'static str {
        EVENT_INDEX_NARRATIVE
    }

    async fn handle(&self, event: &OutboxEvent) -> Result<()> {
        let narrative_id = payload_uuid(event, "narrative_id")?;
        self.search.index_narrative(narrative_id).await?;

        let narratives = self.narratives.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let narrative = narratives.get(narrative_id)?;
            if let Some(trait_path) = &narrative.trait_path {
                if !narratives.link_exists(narrative_id, "curates")? {
                    narratives.insert_link(&TraitNarrativeLink {
                        id: Uuid::new_v4(),
                        narrative_id,
                        trait_path: trait_path.clone(),
                        person_id: narrative.person_id,
                        link_type: "curates".to_string(),
                        // Direct curation carries full confidence.
                        confidence: Some(1.0),
                        created_at: chrono::Utc::now(),
                    })?;
                }
            }
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutboxSettings;
    use crate::narratives::search::tests::StubProvider;
    use crate::narratives::{Narrative, NarrativeSearchConfig};
    use crate::observations::{Observation, ObservationKind};
    use crate::outbox::{NewOutboxEvent, OutboxDispatcher, OutboxStatus, OutboxStore};
    use serde_json::json;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        outbox: OutboxStore,
        search: Arc<NarrativeSearch>,
        provider: Arc<StubProvider>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        let provider = Arc::new(StubProvider::new());
        let search = Arc::new(NarrativeSearch::new(
            NarrativeStore::new(db.clone()),
            provider.clone(),
            NarrativeSearchConfig {
                embed_timeout: std::time::Duration::from_millis(200),
                ..NarrativeSearchConfig::default()
            },
        ));
        Fixture {
            _dir: dir,
            outbox: OutboxStore::new(db.clone()),
            db,
            search,
            provider,
        }
    }

    fn dispatcher(fx: &Fixture) -> OutboxDispatcher {
        OutboxDispatcher::new(fx.outbox.clone(), OutboxSettings::default())
            .register(Arc::new(ObservationProcessHandler::new(fx.db.clone())))
            .register(Arc::new(NarrativeIndexHandler::new(
                fx.db.clone(),
                fx.search.clone(),
            )))
    }

    #[tokio::test]
    async fn test_observation_event_updates_mindscape() {
        let fx = fixture();
        let observations = ObservationStore::new(fx.db.clone());
        let person = Uuid::new_v4();
        let observation = Observation::new(
            person,
            ObservationKind::WorkSession,
            json!({"duration_minutes": 50, "interruptions": 0}),
            json!({}),
        );
        let event_id = observations.create(&observation).unwrap();

        let handled = dispatcher(&fx).poll_and_process().await.unwrap();
        assert_eq!(handled, 1);

        assert_eq!(fx.outbox.get(event_id).unwrap().status, OutboxStatus::Done);
        let mindscape = MindscapeStore::new(fx.db.clone()).snapshot(person).unwrap();
        assert_eq!(
            mindscape.trait_at("work.focus_duration").unwrap()["value"],
            json!(50.0)
        );
        assert!(observations.get(observation.id).unwrap().processed_at.is_some());
    }

    #[tokio::test]
    async fn test_redelivered_observation_event_is_idempotent() {
        let fx = fixture();
        let observations = ObservationStore::new(fx.db.clone());
        let mindscapes = MindscapeStore::new(fx.db.clone());
        let person = Uuid::new_v4();
        let observation = Observation::new(
            person,
            ObservationKind::WorkSession,
            json!({"duration_minutes": 50}),
            json!({}),
        );
        observations.create(&observation).unwrap();

        let dispatcher = dispatcher(&fx);
        dispatcher.poll_and_process().await.unwrap();
        let after_first = mindscapes.snapshot(person).unwrap();

        // Redeliver the same intent; the processed stamp short-circuits it.
        fx.outbox
            .enqueue(NewOutboxEvent::process_observation(person, observation.id))
            .unwrap();
        dispatcher.poll_and_process().await.unwrap();

        let after_second = mindscapes.snapshot(person).unwrap();
        assert_eq!(after_first.version, after_second.version);
        assert_eq!(
            after_first.trait_at("work.focus_duration"),
            after_second.trait_at("work.focus_duration")
        );
    }

    #[tokio::test]
    async fn test_narrative_event_embeds_indexes_and_links() {
        let fx = fixture();
        let narratives = NarrativeStore::new(fx.db.clone());
        let person = Uuid::new_v4();
        let narrative = Narrative::curation(
            person,
            "Actually my focus peaks in the morning",
            "work.energy_patterns.morning",
            "correct",
            vec![],
            json!({}),
        );
        narratives.create(&narrative).unwrap();

        let dispatcher = dispatcher(&fx);
        dispatcher.poll_and_process().await.unwrap();

        assert!(narratives.get(narrative.id).unwrap().embedding.is_some());
        assert!(narratives.link_exists(narrative.id, "curates").unwrap());
        assert_eq!(fx.provider.call_count(), 1);

        // Redelivery: no second embedding call, no duplicate link.
        fx.outbox
            .enqueue(NewOutboxEvent::index_narrative(person, narrative.id))
            .unwrap();
        dispatcher.poll_and_process().await.unwrap();
        assert_eq!(fx.provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_type_retries_then_fails() {
        let fx = fixture();
        let id = fx
            .outbox
            .enqueue(NewOutboxEvent {
                aggregate_type: "mystery".to_string(),
                aggregate_id: "x".to_string(),
                event_type: "mystery_event".to_string(),
                payload: json!({}),
            })
            .unwrap();

        let dispatcher = OutboxDispatcher::new(
            fx.outbox.clone(),
            OutboxSettings {
                max_attempts: 1,
                ..OutboxSettings::default()
            },
        );
        dispatcher.poll_and_process().await.unwrap();

        let event = fx.outbox.get(id).unwrap();
        assert_eq!(event.status, OutboxStatus::Failed);
        assert!(event.last_error.as_deref().unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn test_missing_payload_field_records_failure() {
        let fx = fixture();
        let id = fx
            .outbox
            .enqueue(NewOutboxEvent {
                aggregate_type: "observation".to_string(),
                aggregate_id: "x".to_string(),
                event_type: super::EVENT_PROCESS_OBSERVATION.to_string(),
                payload: json!({}),
            })
            .unwrap();

        dispatcher(&fx).poll_and_process().await.unwrap();
        let event = fx.outbox.get(id).unwrap();
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.attempts, 1);
        assert!(event.run_after > chrono::Utc::now());
    }
}
