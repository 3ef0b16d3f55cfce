//! Mapper configuration documents.
//!
//! A mapper is a versioned YAML or JSON document: `metadata`, an ordered
//! `rules` list, and optional suggestion `templates`. Conditions form a
//! boolean tree (`all` / `any` groups over tagged leaves); actions are an
//! ordered list folded into the generated persona. The condition and
//! action kinds are closed sum types: adding a kind is an exhaustiveness
//! change checked at compile time, not a runtime type probe.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{PersonaKitError, Result};
use crate::observations::ObservationKind;

static TRAIT_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*$").expect("valid pattern"));

/// Document metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapperMetadata {
    /// Stable configuration id, e.g. `daily-work-optimizer`.
    pub id: String,
    /// Optional explicit version; versions auto-increment when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Optional persona TTL override for this mapper, in hours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl_hours: Option<i64>,
}

/// Comparison operators shared by trait and observation checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    Exists,
    NotExists,
}

/// A leaf condition, discriminated by its `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Compare a trait value at a dot-delimited path.
    TraitCheck {
        path: String,
        operator: Operator,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        value: Value,
    },
    /// True when the person's nearest narrative for `query` scores at
    /// least `min_similarity`.
    NarrativeCheck {
        query: String,
        #[serde(default = "default_min_similarity")]
        min_similarity: f64,
    },
    /// Inspect a field of the most recent matching observation.
    ObservationCheck {
        field: String,
        operator: Operator,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        observation_type: Option<ObservationKind>,
    },
}

fn default_min_similarity() -> f64 {
    0.7
}

/// Boolean tree over conditions. `all` short-circuits on the first false
/// branch, `any` on the first true one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConditionTree {
    All { all: Vec<ConditionTree> },
    Any { any: Vec<ConditionTree> },
    Leaf(Condition),
}

impl ConditionTree {
    /// Collect every narrative query in this subtree.
    pub fn narrative_queries(&self, out: &mut Vec<String>) {
        match self {
            Self::All { all } => all.iter().for_each(|c| c.narrative_queries(out)),
            Self::Any { any } => any.iter().for_each(|c| c.narrative_queries(out)),
            Self::Leaf(Condition::NarrativeCheck { query, .. }) => {
                if !out.contains(query) {
                    out.push(query.clone());
                }
            }
            Self::Leaf(_) => {}
        }
    }
}

/// Where an action parameter's value comes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ParameterSource {
    /// Dot-delimited trait path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_trait: Option<String>,
    /// Dot-delimited path into the caller-supplied context map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_context: Option<String>,
    /// Fallback value when the source is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

/// Presentation transform applied to a resolved parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    MinutesToHours,
    Capitalize,
    Lower,
}

/// An action contributed by a triggered rule, discriminated by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Render a suggestion from a template into the persona overlay.
    GenerateSuggestion {
        template: String,
        #[serde(default)]
        parameters: BTreeMap<String, ParameterSource>,
    },
    /// Write a resolved value into the persona core at a dot path.
    SetCoreField {
        field: String,
        value: ParameterSource,
    },
    /// Write a resolved value into the persona overlay at a dot path.
    SetOverlayField {
        field: String,
        value: ParameterSource,
    },
}

/// Suggestion priority, used to order overlay suggestions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Higher rank sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }
}

fn default_priority() -> Priority {
    Priority::Medium
}

/// A suggestion template referenced by `generate_suggestion` actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestionTemplate {
    /// Title with `{placeholder}` slots.
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// One rule: a condition tree gating an ordered action list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: String,
    /// Rules with non-positive weight never contribute actions.
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub conditions: ConditionTree,
    pub actions: Vec<Action>,
}

fn default_weight() -> f64 {
    1.0
}

/// A complete mapper configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapperDocument {
    pub metadata: MapperMetadata,
    pub rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub templates: HashMap<String, SuggestionTemplate>,
}

impl MapperDocument {
    /// Parse a YAML (or JSON; YAML is a superset) document.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let doc: Self = serde_yaml::from_str(raw)?;
        Ok(doc)
    }

    /// Parse from an already-deserialized JSON value.
    pub fn from_json_value(value: Value) -> Result<Self> {
        let doc: Self = serde_json::from_value(value)?;
        Ok(doc)
    }

    /// Serialize to a JSON value (the storage representation).
    pub fn to_json_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Unique narrative query strings across every rule, in document order.
    pub fn narrative_queries(&self) -> Vec<String> {
        let mut out = Vec::new();
        for rule in &self.rules {
            rule.conditions.narrative_queries(&mut out);
        }
        out
    }

    /// Validate document invariants. Returns the full list of problems;
    /// empty means valid.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.metadata.id.trim().is_empty() {
            errors.push("metadata.id must not be empty".to_string());
        }
        if self.metadata.name.trim().is_empty() {
            errors.push("metadata.name must not be empty".to_string());
        }
        if let Some(version) = self.metadata.version {
            if version < 1 {
                errors.push(format!("metadata.version must be >= 1, got {version}"));
            }
        }
        if self.rules.is_empty() {
            errors.push("document must declare at least one rule".to_string());
        }

        let mut seen_rule_ids = Vec::new();
        for rule in &self.rules {
            if rule.id.trim().is_empty() {
                errors.push("rule id must not be empty".to_string());
            } else if seen_rule_ids.contains(&rule.id) {
                errors.push(format!("duplicate rule id '{}'", rule.id));
            } else {
                seen_rule_ids.push(rule.id.clone());
            }
            if !rule.weight.is_finite() {
                errors.push(format!("rule '{}' has non-finite weight", rule.id));
            }
            validate_conditions(&rule.id, &rule.conditions, &mut errors);

            if rule.actions.is_empty() {
                errors.push(format!("rule '{}' declares no actions", rule.id));
            }
            for action in &rule.actions {
                validate_action(&rule.id, action, &self.templates, &mut errors);
            }
        }

        errors
    }

    /// Validate, converting problems into a [`PersonaKitError::Validation`].
    pub fn validate(&self) -> Result<()> {
        let errors = self.validation_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PersonaKitError::validation(errors))
        }
    }
}

fn validate_path(owner: &str, label: &str, path: &str, errors: &mut Vec<String>) {
    if !TRAIT_PATH_RE.is_match(path) {
        errors.push(format!("rule '{owner}': malformed {label} path '{path}'"));
    }
}

fn validate_conditions(rule_id: &str, tree: &ConditionTree, errors: &mut Vec<String>) {
    match tree {
        ConditionTree::All { all } => {
            if all.is_empty() {
                errors.push(format!("rule '{rule_id}': empty 'all' group"));
            }
            all.iter().for_each(|c| validate_conditions(rule_id, c, errors));
        }
        ConditionTree::Any { any } => {
            if any.is_empty() {
                errors.push(format!("rule '{rule_id}': empty 'any' group"));
            }
            any.iter().for_each(|c| validate_conditions(rule_id, c, errors));
        }
        ConditionTree::Leaf(Condition::TraitCheck { path, .. }) => {
            validate_path(rule_id, "trait", path, errors);
        }
        ConditionTree::Leaf(Condition::NarrativeCheck {
            query,
            min_similarity,
        }) => {
            if query.trim().is_empty() {
                errors.push(format!("rule '{rule_id}': empty narrative query"));
            }
            if !(0.0..=1.0).contains(min_similarity) {
                errors.push(format!(
                    "rule '{rule_id}': min_similarity {min_similarity} outside [0, 1]"
                ));
            }
        }
        ConditionTree::Leaf(Condition::ObservationCheck { field, .. }) => {
            validate_path(rule_id, "observation field", field, errors);
        }
    }
}

fn validate_action(
    rule_id: &str,
    action: &Action,
    templates: &HashMap<String, SuggestionTemplate>,
    errors: &mut Vec<String>,
) {
    match action {
        Action::GenerateSuggestion { template, parameters } => {
            if !templates.contains_key(template) {
                errors.push(format!(
                    "rule '{rule_id}' references non-existent template '{template}'"
                ));
            }
            for source in parameters.values() {
                if let Some(path) = &source.from_trait {
                    validate_path(rule_id, "parameter trait", path, errors);
                }
            }
        }
        Action::SetCoreField { field, value } | Action::SetOverlayField { field, value } => {
            validate_path(rule_id, "output field", field, errors);
            if let Some(path) = &value.from_trait {
                validate_path(rule_id, "parameter trait", path, errors);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE_YAML: &str = r#"
metadata:
  id: daily-work-optimizer
  name: Daily Work Optimizer
  description: Suggests a working rhythm from energy traits
rules:
  - id: morning-person
    weight: 1.5
    conditions:
      all:
        - type: trait_check
          path: work.energy_patterns.morning
          operator: equals
          value: high
        - type: narrative_check
          query: morning productivity
          min_similarity: 0.7
    actions:
      - type: generate_suggestion
        template: deep_work
        parameters:
          duration:
            from_trait: work.focus_duration
            default: 45
            transform: minutes_to_hours
      - type: set_core_field
        field: work_style.peak_window
        value:
          default: morning
templates:
  deep_work:
    title: "Schedule deep work for {duration}"
    description: "Protect your best hours"
    priority: high
"#;

    #[test]
    fn test_yaml_parse_and_shape() {
        let doc = MapperDocument::from_yaml_str(SAMPLE_YAML).unwrap();
        assert_eq!(doc.metadata.id, "daily-work-optimizer");
        assert_eq!(doc.rules.len(), 1);
        let rule = &doc.rules[0];
        assert_eq!(rule.weight, 1.5);
        match &rule.conditions {
            ConditionTree::All { all } => {
                assert_eq!(all.len(), 2);
                assert!(matches!(
                    all[0],
                    ConditionTree::Leaf(Condition::TraitCheck { .. })
                ));
                assert!(matches!(
                    all[1],
                    ConditionTree::Leaf(Condition::NarrativeCheck { .. })
                ));
            }
            other => panic!("expected all group, got {other:?}"),
        }
        assert!(doc.validation_errors().is_empty());
    }

    #[test]
    fn test_json_round_trip_is_semantically_equal() {
        let doc = MapperDocument::from_yaml_str(SAMPLE_YAML).unwrap();
        let value = doc.to_json_value().unwrap();
        let restored = MapperDocument::from_json_value(value).unwrap();
        assert_eq!(doc, restored);
    }

    #[test]
    fn test_narrative_queries_deduplicate() {
        let yaml = r#"
metadata: {id: m, name: M}
rules:
  - id: a
    conditions:
      any:
        - {type: narrative_check, query: morning productivity}
        - {type: narrative_check, query: evening focus}
    actions: [{type: set_overlay_field, field: f, value: {default: 1}}]
  - id: b
    conditions: {type: narrative_check, query: morning productivity}
    actions: [{type: set_overlay_field, field: g, value: {default: 2}}]
"#;
        let doc = MapperDocument::from_yaml_str(yaml).unwrap();
        assert_eq!(
            doc.narrative_queries(),
            vec!["morning productivity".to_string(), "evening focus".to_string()]
        );
    }

    #[test]
    fn test_validation_catches_problems() {
        let yaml = r#"
metadata: {id: "", name: Broken}
rules:
  - id: r1
    conditions: {type: narrative_check, query: "", min_similarity: 1.5}
    actions:
      - {type: generate_suggestion, template: missing}
  - id: r1
    conditions: {type: trait_check, path: "bad..path", operator: equals, value: 1}
    actions: []
"#;
        let doc = MapperDocument::from_yaml_str(yaml).unwrap();
        let errors = doc.validation_errors();
        assert!(errors.iter().any(|e| e.contains("metadata.id")));
        assert!(errors.iter().any(|e| e.contains("empty narrative query")));
        assert!(errors.iter().any(|e| e.contains("outside [0, 1]")));
        assert!(errors.iter().any(|e| e.contains("non-existent template")));
        assert!(errors.iter().any(|e| e.contains("duplicate rule id")));
        assert!(errors.iter().any(|e| e.contains("malformed trait path")));
        assert!(errors.iter().any(|e| e.contains("declares no actions")));
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
metadata: {id: m, name: M}
rules:
  - id: r
    conditions: {type: narrative_check, query: focus}
    actions: [{type: set_core_field, field: style, value: {default: calm}}]
"#;
        let doc = MapperDocument::from_yaml_str(yaml).unwrap();
        assert_eq!(doc.rules[0].weight, 1.0);
        match &doc.rules[0].conditions {
            ConditionTree::Leaf(Condition::NarrativeCheck { min_similarity, .. }) => {
                assert_eq!(*min_similarity, 0.7);
            }
            other => panic!("unexpected tree {other:?}"),
        }
    }
}
