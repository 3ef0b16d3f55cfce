//! Persona generation orchestration.
//!
//! `generate` resolves the active mapper, snapshots traits, prefetches
//! narrative matches (one search per unique query string in the document),
//! runs the rule engine, and folds the triggered actions into a persona.
//! Narrative prefetch failures and timeouts degrade to trait-only
//! evaluation; the affected narrative checks fail closed and the persona
//! is still produced. The persona is written with a single insert at the
//! end, so generation is all-or-nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::config::Settings;
use crate::engine::{
    provenance_entry, trait_scalar, EvaluationContext, EvaluationOutcome, RuleEngine,
    TriggeredAction,
};
use crate::errors::Result;
use crate::mapper::document::{Action, ParameterSource, Transform};
use crate::mapper::{MapperConfig, MapperConfigStore};
use crate::mindscape::{navigate, set_path, Mindscape, MindscapeStore};
use crate::narratives::{NarrativeMatch, NarrativeSearch};
use crate::observations::ObservationStore;
use crate::storage::Database;

use super::store::PersonaStore;
use super::Persona;

/// Tuning for [`PersonaGenerator`].
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    /// Default persona validity horizon, in hours; a mapper's
    /// `metadata.default_ttl_hours` overrides it.
    pub ttl_hours: i64,
    /// Hard deadline for each narrative prefetch.
    pub prefetch_timeout: Duration,
    /// Observations handed to the evaluation context.
    pub recent_observations: usize,
    /// Overlay suggestion list bound.
    pub max_suggestions: usize,
    /// Results requested per narrative query.
    pub search_top_k: usize,
}

impl GeneratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            ttl_hours: settings.persona_ttl_hours,
            prefetch_timeout: settings.embeddings.timeout(),
            recent_observations: 20,
            max_suggestions: 5,
            search_top_k: settings.search.top_k,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Orchestrates persona generation.
pub struct PersonaGenerator {
    mappers: MapperConfigStore,
    mindscapes: MindscapeStore,
    observations: ObservationStore,
    personas: PersonaStore,
    search: Arc<NarrativeSearch>,
    engine: RuleEngine,
    config: GeneratorConfig,
}

impl PersonaGenerator {
    pub fn new(db: Database, search: Arc<NarrativeSearch>, config: GeneratorConfig) -> Self {
        Self {
            mappers: MapperConfigStore::new(db.clone()),
            mindscapes: MindscapeStore::new(db.clone()),
            observations: ObservationStore::new(db.clone()),
            personas: PersonaStore::new(db),
            search,
            engine: RuleEngine::new(),
            config,
        }
    }

    /// Generate and persist a persona for `person_id` using the active
    /// version of `mapper_id`.
    pub async fn generate(
        &self,
        person_id: Uuid,
        mapper_id: &str,
        context: Value,
    ) -> Result<Persona> {
        let mapper = self.mappers.aget_active(mapper_id).await?;
        let mindscape = self.mindscapes.asnapshot(person_id).await?;
        let observations = self
            .observations
            .arecent(person_id, self.config.recent_observations)
            .await?;

        let narratives = self
            .prefetch_narratives(person_id, &mapper.document.narrative_queries())
            .await;

        let ctx = EvaluationContext {
            traits: mindscape.traits.clone(),
            narratives,
            observations,
            context,
        };

        let outcome = self.engine.evaluate(&mapper.document, &ctx);
        for warning in &outcome.warnings {
            log::warn!(
                "evaluation warning in mapper '{}' rule '{}': {}",
                mapper.config_id,
                warning.rule_id,
                warning.detail
            );
        }

        let persona = self.assemble(person_id, &mapper, &mindscape, &outcome, &ctx);
        self.personas.asave(&persona).await?;

        // Usage tracking is best-effort; a lost increment never fails the
        // persona request.
        if let Err(e) = self.mappers.arecord_usage(mapper.id).await {
            log::warn!("usage tracking failed for mapper {}: {e}", mapper.id);
        }

        log::info!(
            "generated persona {} for person {} (mapper '{}' v{})",
            persona.id,
            person_id,
            mapper.config_id,
            mapper.version
        );
        Ok(persona)
    }

    /// One search per unique query string. Failures and timeouts leave the
    /// query out of the map, which makes its narrative checks fail closed.
    async fn prefetch_narratives(
        &self,
        person_id: Uuid,
        queries: &[String],
    ) -> HashMap<String, Vec<NarrativeMatch>> {
        let mut narratives = HashMap::new();
        for query in queries {
            let search = self.search.search(
                person_id,
                query,
                Some(self.config.search_top_k),
                None,
            );
            match tokio::time::timeout(self.config.prefetch_timeout, search).await {
                Ok(Ok(matches)) => {
                    narratives.insert(query.clone(), matches);
                }
                Ok(Err(e)) => {
                    log::warn!("narrative prefetch failed for '{query}': {e}; failing closed");
                }
                Err(_) => {
                    log::warn!("narrative prefetch timed out for '{query}'; failing closed");
                }
            }
        }
        narratives
    }

    fn assemble(
        &self,
        person_id: Uuid,
        mapper: &MapperConfig,
        mindscape: &Mindscape,
        outcome: &EvaluationOutcome,
        ctx: &EvaluationContext,
    ) -> Persona {
        let mut core = json!({});
        let mut overlay = json!({});
        let mut suggestions: Vec<(Value, f64, u8)> = Vec::new();
        let mut fired_queries: Vec<String> = Vec::new();

        for triggered in &outcome.actions {
            for query in &triggered.narrative_queries {
                if !fired_queries.contains(query) && ctx.narratives.contains_key(query) {
                    fired_queries.push(query.clone());
                }
            }
            match &triggered.action {
                Action::GenerateSuggestion { template, parameters } => {
                    if let Some((rendered, priority_rank)) =
                        self.render_suggestion(triggered, template, parameters, mapper, ctx)
                    {
                        suggestions.push((rendered, triggered.weight, priority_rank));
                    }
                }
                Action::SetCoreField { field, value } => {
                    if let Some(resolved) = resolve_parameter(value, &ctx.traits, &ctx.context) {
                        set_path(&mut core, field, resolved);
                    }
                }
                Action::SetOverlayField { field, value } => {
                    if let Some(resolved) = resolve_parameter(value, &ctx.traits, &ctx.context) {
                        set_path(&mut overlay, field, resolved);
                    }
                }
            }
        }

        // Higher weight first, then higher priority; stable, so document
        // order breaks remaining ties.
        suggestions.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.cmp(&a.2))
        });
        suggestions.truncate(self.config.max_suggestions);

        set_path(
            &mut overlay,
            "suggestions",
            Value::Array(suggestions.into_iter().map(|(s, _, _)| s).collect()),
        );
        set_path(&mut overlay, "current_state", current_state(ctx));
        set_path(&mut overlay, "active_patterns", active_patterns(ctx));
        set_path(
            &mut core,
            "generated_from_mindscape_version",
            json!(mindscape.version),
        );

        let narrative_context = if fired_queries.is_empty() {
            None
        } else {
            let mut map = Map::new();
            for query in &fired_queries {
                if let Some(matches) = ctx.narratives.get(query) {
                    map.insert(query.clone(), provenance_entry(matches));
                }
            }
            Some(Value::Object(map))
        };

        let now = Utc::now();
        let ttl_hours = mapper
            .document
            .metadata
            .default_ttl_hours
            .unwrap_or(self.config.ttl_hours);

        Persona {
            id: Uuid::new_v4(),
            person_id,
            mapper_id: mapper.config_id.clone(),
            mapper_config_id: mapper.id,
            mapper_version: mapper.version,
            core,
            overlay,
            narrative_context,
            metadata: json!({
                "generated_at": now.to_rfc3339(),
                "rule_count": mapper.document.rules.len(),
                "suggestion_count": outcome
                    .actions
                    .iter()
                    .filter(|a| matches!(a.action, Action::GenerateSuggestion { .. }))
                    .count(),
                "warning_count": outcome.warnings.len(),
                "context": ctx.context,
            }),
            created_at: now,
            expires_at: now + chrono::Duration::hours(ttl_hours),
        }
    }

    fn render_suggestion(
        &self,
        triggered: &TriggeredAction,
        template_id: &str,
        parameters: &std::collections::BTreeMap<String, ParameterSource>,
        mapper: &MapperConfig,
        ctx: &EvaluationContext,
    ) -> Option<(Value, u8)> {
        let template = match mapper.document.templates.get(template_id) {
            Some(t) => t,
            None => {
                log::warn!(
                    "rule '{}' references missing template '{template_id}'",
                    triggered.rule_id
                );
                return None;
            }
        };

        let mut resolved = Map::new();
        for (name, source) in parameters {
            if let Some(value) = resolve_parameter(source, &ctx.traits, &ctx.context) {
                resolved.insert(name.clone(), value);
            }
        }

        let mut suggestion = Map::new();
        suggestion.insert(
            "title".to_string(),
            json!(format_template(&template.title, &resolved)),
        );
        suggestion.insert(
            "description".to_string(),
            json!(format_template(&template.description, &resolved)),
        );
        suggestion.insert("priority".to_string(), json!(template.priority));
        suggestion.insert("metadata".to_string(), template.metadata.clone());
        suggestion.insert("parameters".to_string(), Value::Object(resolved));
        suggestion.insert("rule_id".to_string(), json!(triggered.rule_id));
        suggestion.insert("weight".to_string(), json!(triggered.weight));

        if !triggered.narrative_queries.is_empty() {
            let mut provenance = Map::new();
            for query in &triggered.narrative_queries {
                if let Some(matches) = ctx.narratives.get(query) {
                    provenance.insert(query.clone(), provenance_entry(matches));
                }
            }
            if !provenance.is_empty() {
                suggestion.insert("provenance".to_string(), Value::Object(provenance));
            }
        }

        Some((Value::Object(suggestion), template.priority.rank()))
    }
}

/// Resolve an action parameter from trait state, caller context, or its
/// declared default, applying the optional transform.
fn resolve_parameter(source: &ParameterSource, traits: &Value, context: &Value) -> Option<Value> {
    let raw = if let Some(path) = &source.from_trait {
        navigate(traits, path).map(|node| trait_scalar(node).clone())
    } else if let Some(path) = &source.from_context {
        navigate(context, path).cloned()
    } else {
        None
    };

    let value = raw.or_else(|| source.default.clone())?;
    Some(match source.transform {
        Some(transform) => apply_transform(transform, value),
        None => value,
    })
}

/// Apply a presentation transform; unconvertible values pass through
/// unchanged.
fn apply_transform(transform: Transform, value: Value) -> Value {
    match transform {
        Transform::MinutesToHours => match value.as_f64() {
            Some(minutes) => json!(format!("{:.1} hours", minutes / 60.0)),
            None => value,
        },
        Transform::Capitalize => match value.as_str() {
            Some(s) => {
                let mut chars = s.chars();
                let capitalized = match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                };
                json!(capitalized)
            }
            None => value,
        },
        Transform::Lower => match value.as_str() {
            Some(s) => json!(s.to_lowercase()),
            None => value,
        },
    }
}

/// Substitute `{name}` placeholders with resolved parameter values.
fn format_template(template: &str, parameters: &Map<String, Value>) -> String {
    let mut result = template.to_string();
    for (name, value) in parameters {
        let placeholder = format!("{{{name}}}");
        if result.contains(&placeholder) {
            result = result.replace(&placeholder, &display_value(value));
        }
    }
    result
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// High-volatility state pulled from `current_state.*` traits plus the
/// caller context.
fn current_state(ctx: &EvaluationContext) -> Value {
    let state = |key: &str| {
        navigate(&ctx.traits, &format!("current_state.{key}"))
            .map(|node| trait_scalar(node).clone())
    };
    json!({
        "energy_level": state("energy_level").unwrap_or(json!("unknown")),
        "focus_available": state("focus_available").unwrap_or(json!(true)),
        "recent_activity": state("recent_activity").unwrap_or(json!([])),
        "context": ctx.context,
    })
}

fn active_patterns(ctx: &EvaluationContext) -> Value {
    let from_context =
        |key: &str| navigate(&ctx.context, key).cloned().unwrap_or(json!("unknown"));
    json!({
        "time_of_day": from_context("time_of_day"),
        "day_of_week": from_context("day_of_week"),
        "workload": navigate(&ctx.traits, "current_state.workload")
            .map(|node| trait_scalar(node).clone())
            .unwrap_or(json!("normal")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PersonaKitError;
    use crate::mapper::document::MapperDocument;
    use crate::mindscape::TraitValue;
    use crate::narratives::search::tests::StubProvider;
    use crate::narratives::{Narrative, NarrativeSearchConfig, NarrativeStore};

    const MAPPER_YAML: &str = r#"
metadata:
  id: daily
  name: Daily Optimizer
rules:
  - id: morning-person
    weight: 2.0
    conditions:
      all:
        - {type: trait_check, path: work.energy_patterns.morning, operator: equals, value: high}
        - {type: narrative_check, query: morning productivity, min_similarity: 0.7}
    actions:
      - type: generate_suggestion
        template: deep_work
        parameters:
          duration: {from_trait: work.focus_duration, default: 45, transform: minutes_to_hours}
      - {type: set_core_field, field: work_style.peak_window, value: {default: morning}}
  - id: echo-energy
    conditions: {type: trait_check, path: work.energy_patterns.morning, operator: exists}
    actions:
      - {type: set_core_field, field: work_style.peak_window, value: {from_trait: work.energy_patterns.morning}}
      - {type: set_overlay_field, field: hints.check_in, value: {from_context: time_of_day, default: anytime}}
templates:
  deep_work:
    title: "Schedule deep work for {duration}"
    description: "Protect your strongest hours"
    priority: high
"#;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Database,
        narratives: NarrativeStore,
        search: Arc<NarrativeSearch>,
        generator: PersonaGenerator,
    }

    fn fixture(provider: Arc<StubProvider>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db")).unwrap();
        let narratives = NarrativeStore::new(db.clone());
        let search_config = NarrativeSearchConfig {
            embed_timeout: Duration::from_millis(200),
            ..NarrativeSearchConfig::default()
        };
        let search = Arc::new(NarrativeSearch::new(
            narratives.clone(),
            provider,
            search_config,
        ));
        let generator_config = GeneratorConfig {
            prefetch_timeout: Duration::from_millis(500),
            ..GeneratorConfig::default()
        };
        let generator =
            PersonaGenerator::new(db.clone(), search.clone(), generator_config);
        Fixture {
            _dir: dir,
            db,
            narratives,
            search,
            generator,
        }
    }

    fn install_mapper(db: &Database, yaml: &str) {
        let store = MapperConfigStore::new(db.clone());
        let uploaded = store
            .upload(MapperDocument::from_yaml_str(yaml).unwrap())
            .unwrap();
        store.activate(&uploaded.config_id, uploaded.version).unwrap();
    }

    fn seed_morning_traits(db: &Database, person: Uuid) {
        let store = MindscapeStore::new(db.clone());
        let mut updates = HashMap::new();
        updates.insert(
            "work.energy_patterns.morning".to_string(),
            TraitValue::new(json!("high"), 0.8, 4),
        );
        updates.insert(
            "work.focus_duration".to_string(),
            TraitValue::new(json!(90.0), 0.9, 3),
        );
        store.apply_traits(person, updates).unwrap();
    }

    #[tokio::test]
    async fn test_generate_full_flow_with_narratives() {
        let provider = Arc::new(StubProvider::new());
        let fx = fixture(provider);
        install_mapper(&fx.db, MAPPER_YAML);

        let person = Uuid::new_v4();
        seed_morning_traits(&fx.db, person);
        let narrative = Narrative::self_observation(
            person,
            "I work best in early mornings",
            vec![],
            json!({}),
            None,
        );
        fx.narratives.insert(&narrative).unwrap();
        fx.search.index_narrative(narrative.id).await.unwrap();

        let persona = fx
            .generator
            .generate(person, "daily", json!({"time_of_day": "morning"}))
            .await
            .unwrap();

        // Rule order: morning-person sets the field first, echo-energy
        // overwrites it; last writer in document order wins.
        assert_eq!(persona.core["work_style"]["peak_window"], json!("high"));
        assert_eq!(persona.core["generated_from_mindscape_version"], json!(1));
        assert_eq!(persona.overlay["hints"]["check_in"], json!("morning"));

        let suggestions = persona.overlay["suggestions"].as_array().unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(
            suggestions[0]["title"],
            json!("Schedule deep work for 1.5 hours")
        );
        assert_eq!(suggestions[0]["rule_id"], json!("morning-person"));
        assert!(suggestions[0]["provenance"]["morning productivity"].is_array());

        let provenance = persona.narrative_context.as_ref().unwrap();
        let backed = provenance["morning productivity"].as_array().unwrap();
        assert_eq!(backed[0]["narrative_id"], json!(narrative.id.to_string()));
        assert!(backed[0]["similarity"].as_f64().unwrap() >= 0.7);

        let remaining = persona.expires_at - persona.created_at;
        assert_eq!(remaining, chrono::Duration::hours(4));
    }

    #[tokio::test]
    async fn test_generate_without_active_mapper_fails() {
        let provider = Arc::new(StubProvider::new());
        let fx = fixture(provider);
        let err = fx
            .generator
            .generate(Uuid::new_v4(), "missing", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PersonaKitError::ConfigNotFound { .. }));
    }

    #[tokio::test]
    async fn test_provider_timeout_degrades_to_trait_only() {
        let provider = Arc::new(StubProvider::slow(Duration::from_secs(30)));
        let fx = fixture(provider);
        install_mapper(&fx.db, MAPPER_YAML);

        let person = Uuid::new_v4();
        seed_morning_traits(&fx.db, person);

        let persona = fx
            .generator
            .generate(person, "daily", json!({}))
            .await
            .unwrap();

        // Narrative-gated rule failed closed, trait-only rule still ran.
        assert!(persona.overlay["suggestions"].as_array().unwrap().is_empty());
        assert_eq!(persona.core["work_style"]["peak_window"], json!("high"));
        assert!(persona.narrative_context.is_none());
    }

    #[tokio::test]
    async fn test_shared_query_costs_one_search_round_trip() {
        let provider = Arc::new(StubProvider::new());
        let fx = fixture(provider.clone());
        install_mapper(
            &fx.db,
            r#"
metadata: {id: daily, name: Daily}
rules:
  - id: a
    conditions: {type: narrative_check, query: morning productivity}
    actions: [{type: set_overlay_field, field: a, value: {default: 1}}]
  - id: b
    conditions: {type: narrative_check, query: morning productivity}
    actions: [{type: set_overlay_field, field: b, value: {default: 2}}]
"#,
        );

        let person = Uuid::new_v4();
        let narrative = Narrative::self_observation(
            person,
            "early mornings are productive",
            vec![],
            json!({}),
            None,
        );
        fx.narratives.insert(&narrative).unwrap();
        fx.search.index_narrative(narrative.id).await.unwrap();
        let before = provider.call_count();

        let persona = fx.generator.generate(person, "daily", json!({})).await.unwrap();

        // Two rules, one unique query string: exactly one embedding call.
        assert_eq!(provider.call_count(), before + 1);
        assert_eq!(persona.overlay["a"], json!(1));
        assert_eq!(persona.overlay["b"], json!(2));
    }

    #[tokio::test]
    async fn test_trait_only_mapper_never_touches_provider() {
        let provider = Arc::new(StubProvider::new());
        let fx = fixture(provider.clone());
        install_mapper(
            &fx.db,
            r#"
metadata: {id: plain, name: Plain}
rules:
  - id: r
    conditions: {type: trait_check, path: work.focus_duration, operator: greater_than, value: 30}
    actions: [{type: set_core_field, field: style, value: {default: focused}}]
"#,
        );
        let person = Uuid::new_v4();
        seed_morning_traits(&fx.db, person);

        let persona = fx.generator.generate(person, "plain", json!({})).await.unwrap();
        assert_eq!(persona.core["style"], json!("focused"));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_usage_count_increments_on_generation() {
        let provider = Arc::new(StubProvider::new());
        let fx = fixture(provider);
        install_mapper(
            &fx.db,
            r#"
metadata: {id: plain, name: Plain}
rules:
  - id: r
    conditions: {type: trait_check, path: work.focus_duration, operator: exists}
    actions: [{type: set_core_field, field: style, value: {default: focused}}]
"#,
        );
        let person = Uuid::new_v4();
        seed_morning_traits(&fx.db, person);
        fx.generator.generate(person, "plain", json!({})).await.unwrap();
        fx.generator.generate(person, "plain", json!({})).await.unwrap();

        let store = MapperConfigStore::new(fx.db.clone());
        let active = store.get_active("plain").unwrap();
        assert_eq!(active.usage_count, 2);
    }
}
