//! Rule evaluation engine.
//!
//! Evaluation is a pure function of a mapper document and an
//! [`EvaluationContext`]: no store access, no retries, no side effects, so
//! the engine is unit-testable in isolation. Narrative results are
//! prefetched by the persona generator (one search per unique query
//! string) and handed in through the context, which keeps evaluation
//! synchronous and guarantees the per-query memoization.
//!
//! Anything a condition cannot resolve fails closed: a missing trait is
//! simply false (sparse traits are the normal case), while a malformed
//! value or type mismatch is false plus a non-fatal warning. A single bad
//! rule never aborts the mapper run.

use std::collections::HashMap;

use serde_json::Value;

use crate::mapper::document::{Action, Condition, ConditionTree, MapperDocument, Operator};
use crate::mindscape::navigate;
use crate::narratives::NarrativeMatch;
use crate::observations::Observation;

/// Everything a mapper run may look at.
#[derive(Debug, Default)]
pub struct EvaluationContext {
    /// Nested trait tree for the person; leaves are trait-value objects.
    pub traits: Value,
    /// Prefetched narrative matches, keyed by exact query string. A query
    /// missing from the map (search unavailable, timed out, or never run)
    /// makes its `narrative_check` false.
    pub narratives: HashMap<String, Vec<NarrativeMatch>>,
    /// Recent observations, most recent first.
    pub observations: Vec<Observation>,
    /// Caller-supplied context map (time of day, energy level, ...).
    pub context: Value,
}

impl EvaluationContext {
    /// Context with traits only; narrative checks fail closed.
    pub fn trait_only(traits: Value) -> Self {
        Self {
            traits,
            ..Self::default()
        }
    }
}

/// An action contributed by a triggered rule.
#[derive(Debug, Clone)]
pub struct TriggeredAction {
    pub rule_id: String,
    pub weight: f64,
    pub action: Action,
    /// Narrative matches behind this rule's fired narrative checks, for
    /// provenance in the generated persona.
    pub narrative_queries: Vec<String>,
}

/// A non-fatal problem hit while evaluating one condition.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationWarning {
    pub rule_id: String,
    pub detail: String,
}

/// Result of one mapper run.
#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    /// Triggered actions in rule/document order.
    pub actions: Vec<TriggeredAction>,
    pub warnings: Vec<EvaluationWarning>,
}

/// Evaluates mapper rules against an evaluation context.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine;

impl RuleEngine {
    pub fn new() -> Self {
        Self
    }

    /// Run every rule in document order.
    pub fn evaluate(&self, document: &MapperDocument, ctx: &EvaluationContext) -> EvaluationOutcome {
        let mut outcome = EvaluationOutcome::default();

        for rule in &document.rules {
            let fired = self.eval_tree(&rule.id, &rule.conditions, ctx, &mut outcome.warnings);
            if !fired {
                continue;
            }
            if rule.weight <= 0.0 {
                log::debug!("rule '{}' matched but has non-positive weight", rule.id);
                continue;
            }

            let mut queries = Vec::new();
            rule.conditions.narrative_queries(&mut queries);
            for action in &rule.actions {
                outcome.actions.push(TriggeredAction {
                    rule_id: rule.id.clone(),
                    weight: rule.weight,
                    action: action.clone(),
                    narrative_queries: queries.clone(),
                });
            }
        }

        outcome
    }

    fn eval_tree(
        &self,
        rule_id: &str,
        tree: &ConditionTree,
        ctx: &EvaluationContext,
        warnings: &mut Vec<EvaluationWarning>,
    ) -> bool {
        match tree {
            ConditionTree::All { all } => all
                .iter()
                .all(|node| self.eval_tree(rule_id, node, ctx, warnings)),
            ConditionTree::Any { any } => any
                .iter()
                .any(|node| self.eval_tree(rule_id, node, ctx, warnings)),
            ConditionTree::Leaf(condition) => {
                self.eval_leaf(rule_id, condition, ctx, warnings)
            }
        }
    }

    fn eval_leaf(
        &self,
        rule_id: &str,
        condition: &Condition,
        ctx: &EvaluationContext,
        warnings: &mut Vec<EvaluationWarning>,
    ) -> bool {
        match condition {
            Condition::TraitCheck {
                path,
                operator,
                value,
            } => {
                let node = navigate(&ctx.traits, path).map(trait_scalar);
                compare(rule_id, node, *operator, value, warnings)
            }
            Condition::NarrativeCheck {
                query,
                min_similarity,
            } => ctx
                .narratives
                .get(query)
                .and_then(|matches| matches.first())
                .map(|top| top.similarity >= *min_similarity)
                .unwrap_or(false),
            Condition::ObservationCheck {
                field,
                operator,
                value,
                observation_type,
            } => {
                let newest = ctx
                    .observations
                    .iter()
                    .find(|obs| observation_type.as_ref().map_or(true, |t| obs.kind == *t));
                let node = newest.and_then(|obs| navigate(&obs.content, field));
                compare(rule_id, node, *operator, value, warnings)
            }
        }
    }
}

/// Unwrap a trait leaf to its raw value: stored leaves are
/// `{value, confidence, ...}` objects, but plain values are tolerated.
pub fn trait_scalar(node: &Value) -> &Value {
    match node {
        Value::Object(map) if map.contains_key("value") => &map["value"],
        other => other,
    }
}

/// Apply an operator. `current = None` means the referenced path does not
/// exist, which is only true for `not_exists`.
fn compare(
    rule_id: &str,
    current: Option<&Value>,
    operator: Operator,
    expected: &Value,
    warnings: &mut Vec<EvaluationWarning>,
) -> bool {
    let current = match current {
        Some(v) => v,
        None => return operator == Operator::NotExists,
    };

    match operator {
        Operator::Exists => true,
        Operator::NotExists => false,
        Operator::Equals => current == expected,
        Operator::NotEquals => current != expected,
        Operator::GreaterThan | Operator::LessThan => {
            match (to_f64(current), to_f64(expected)) {
                (Some(a), Some(b)) => {
                    if operator == Operator::GreaterThan {
                        a > b
                    } else {
                        a < b
                    }
                }
                _ => {
                    warnings.push(EvaluationWarning {
                        rule_id: rule_id.to_string(),
                        detail: format!(
                            "cannot compare non-numeric values: {current} vs {expected}"
                        ),
                    });
                    false
                }
            }
        }
        Operator::Contains => value_contains(current, expected).unwrap_or_else(|| {
            warnings.push(EvaluationWarning {
                rule_id: rule_id.to_string(),
                detail: format!("'contains' unsupported for {current}"),
            });
            false
        }),
    }
}

/// Numeric coercion: numbers directly, numeric strings parsed.
fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Membership: substring for strings, element for arrays, key for objects.
fn value_contains(haystack: &Value, needle: &Value) -> Option<bool> {
    match haystack {
        Value::String(s) => needle.as_str().map(|n| s.contains(n)),
        Value::Array(items) => Some(items.contains(needle)),
        Value::Object(map) => needle.as_str().map(|n| map.contains_key(n)),
        _ => None,
    }
}

/// Narrative provenance attached to generated personas: which narratives
/// backed which query, with their similarity scores.
pub fn provenance_entry(matches: &[NarrativeMatch]) -> Value {
    Value::Array(
        matches
            .iter()
            .map(|m| {
                serde_json::json!({
                    "narrative_id": m.narrative.id,
                    "excerpt": m.excerpt(),
                    "similarity": m.similarity,
                })
            })
            .collect(),
    )
}
