//! Trait state per person.
//!
//! A mindscape is the full current trait tree for a person. Traits are
//! addressed by dot-delimited hierarchical paths (`work.focus_duration`)
//! and carry a confidence score and sample count alongside their value.
//! Updates merge rather than overwrite: numeric values are averaged with
//! confidence weighting, everything else keeps the higher-confidence value.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub use store::MindscapeStore;

/// A confidence-scored trait value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraitValue {
    /// The stored value; any JSON shape.
    pub value: Value,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Number of observations backing this value.
    pub sample_size: i64,
    /// When the value was last updated.
    pub updated_at: DateTime<Utc>,
}

impl TraitValue {
    /// Create a trait value stamped now.
    pub fn new(value: Value, confidence: f64, sample_size: i64) -> Self {
        Self {
            value,
            confidence: confidence.clamp(0.0, 1.0),
            sample_size,
            updated_at: Utc::now(),
        }
    }
}

/// Aggregated trait tree for a person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mindscape {
    pub person_id: Uuid,
    /// Nested JSON object; leaves are [`TraitValue`]-shaped objects.
    pub traits: Value,
    /// Incremented on every applied update batch.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Mindscape {
    /// An empty mindscape for a person with no observations yet.
    pub fn empty(person_id: Uuid) -> Self {
        Self {
            person_id,
            traits: json!({}),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Navigate to the node at a dot-delimited path, if present.
    pub fn trait_at(&self, path: &str) -> Option<&Value> {
        navigate(&self.traits, path)
    }
}

/// Walk a nested JSON object along a dot-delimited path.
///
/// Returns `None` as soon as a segment is missing or the current node is
/// not an object.
pub fn navigate<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Set the node at a dot-delimited path, creating intermediate objects.
///
/// Intermediate non-object nodes are replaced; the last writer wins.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    if !root.is_object() {
        *root = Value::Object(Map::new());
    }
    let mut current = root;
    let parts: Vec<&str> = path.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        let map = current.as_object_mut().expect("object ensured above");
        if i == parts.len() - 1 {
            map.insert((*part).to_string(), value);
            return;
        }
        let entry = map
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = entry;
    }
}

/// Merge an incoming trait value into an existing one.
///
/// Numeric values take a confidence-weighted average; other shapes keep
/// whichever side carries the higher confidence. Sample sizes accumulate
/// and the merged confidence drifts toward the stronger signal.
pub fn merge_trait(existing: &TraitValue, incoming: &TraitValue) -> TraitValue {
    let total_weight = existing.confidence + incoming.confidence;
    let merged_confidence = if total_weight > 0.0 {
        let blended = (existing.confidence * existing.sample_size as f64
            + incoming.confidence * incoming.sample_size as f64)
            / (existing.sample_size + incoming.sample_size).max(1) as f64;
        blended.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let value = match (existing.value.as_f64(), incoming.value.as_f64()) {
        (Some(old), Some(new)) if total_weight > 0.0 => {
            let avg = (old * existing.confidence + new * incoming.confidence) / total_weight;
            json!(avg)
        }
        _ => {
            if incoming.confidence >= existing.confidence {
                incoming.value.clone()
            } else {
                existing.value.clone()
            }
        }
    };

    TraitValue {
        value,
        confidence: merged_confidence,
        sample_size: existing.sample_size + incoming.sample_size,
        updated_at: incoming.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_navigate_nested_path() {
        let traits = json!({"work": {"energy_patterns": {"morning": {"value": "high"}}}});
        let node = navigate(&traits, "work.energy_patterns.morning").unwrap();
        assert_eq!(node["value"], json!("high"));
        assert!(navigate(&traits, "work.missing.morning").is_none());
        assert!(navigate(&traits, "x.y").is_none());
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut root = json!({});
        set_path(&mut root, "work.focus_duration", json!({"value": 45}));
        assert_eq!(root["work"]["focus_duration"]["value"], json!(45));
        set_path(&mut root, "work.focus_duration", json!({"value": 50}));
        assert_eq!(root["work"]["focus_duration"]["value"], json!(50));
    }

    #[test]
    fn test_merge_numeric_weighted_average() {
        let existing = TraitValue::new(json!(40.0), 0.8, 4);
        let incoming = TraitValue::new(json!(60.0), 0.2, 1);
        let merged = merge_trait(&existing, &incoming);
        let avg = merged.value.as_f64().unwrap();
        assert!((avg - 44.0).abs() < 1e-9);
        assert_eq!(merged.sample_size, 5);
    }

    #[test]
    fn test_merge_categorical_keeps_higher_confidence() {
        let existing = TraitValue::new(json!("low"), 0.9, 3);
        let incoming = TraitValue::new(json!("high"), 0.4, 1);
        let merged = merge_trait(&existing, &incoming);
        assert_eq!(merged.value, json!("low"));
    }
}
