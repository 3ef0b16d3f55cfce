//! Trait extraction from observation content.
//!
//! Direct measurements get high confidence, inferences lower. Extraction
//! is pure; the outbox handler feeds its output into the mindscape merge.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::mindscape::TraitValue;

use super::ObservationKind;

/// Extract confidence-scored traits from observations.
#[derive(Debug, Clone, Default)]
pub struct TraitExtractor;

impl TraitExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract traits from one observation's content.
    ///
    /// Unknown shapes produce an empty map, never an error; sparse input
    /// is the normal case.
    pub fn extract(
        &self,
        kind: ObservationKind,
        content: &Value,
    ) -> HashMap<String, TraitValue> {
        match kind {
            ObservationKind::WorkSession => self.from_work_session(content),
            ObservationKind::UserInput => self.from_user_input(content),
            ObservationKind::CalendarEvent => self.from_calendar_event(content),
        }
    }

    fn from_work_session(&self, content: &Value) -> HashMap<String, TraitValue> {
        let mut traits = HashMap::new();

        if let Some(duration) = content.get("duration_minutes").and_then(Value::as_f64) {
            traits.insert(
                "work.focus_duration".to_string(),
                TraitValue::new(json!(duration), 0.9, 1),
            );
        }

        if let (Some(start), Some(productivity)) = (
            content.get("start").and_then(Value::as_str),
            content.get("productivity_score").and_then(Value::as_f64),
        ) {
            if let Some(hour) = parse_hour(start) {
                if productivity >= 4.0 {
                    traits.insert(
                        "work.peak_hours".to_string(),
                        TraitValue::new(
                            json!([format!("{hour:02}:00-{:02}:00", (hour + 1) % 24)]),
                            0.7,
                            1,
                        ),
                    );
                }
                let energy = if productivity >= 4.0 {
                    "high"
                } else if productivity >= 3.0 {
                    "medium"
                } else {
                    "low"
                };
                traits.insert(
                    "current_state.energy_level".to_string(),
                    TraitValue::new(json!(energy), 0.6, 1),
                );
            }
        }

        if let Some(interruptions) = content.get("interruptions").and_then(Value::as_i64) {
            let cost = if interruptions >= 3 {
                "high"
            } else if interruptions >= 1 {
                "medium"
            } else {
                "low"
            };
            traits.insert(
                "work.task_switching_cost".to_string(),
                TraitValue::new(json!(cost), 0.7, 1),
            );
        }

        traits
    }

    fn from_user_input(&self, content: &Value) -> HashMap<String, TraitValue> {
        let mut traits = HashMap::new();

        // Self-reported state lands under current_state with moderate
        // confidence; people know how they feel, roughly.
        if let Some(energy) = content.get("energy_level").and_then(Value::as_str) {
            traits.insert(
                "current_state.energy_level".to_string(),
                TraitValue::new(json!(energy), 0.8, 1),
            );
        }
        if let Some(focus) = content.get("focus_available").and_then(Value::as_bool) {
            traits.insert(
                "current_state.focus_available".to_string(),
                TraitValue::new(json!(focus), 0.8, 1),
            );
        }
        if let Some(mood) = content.get("mood").and_then(Value::as_str) {
            traits.insert(
                "current_state.mood".to_string(),
                TraitValue::new(json!(mood), 0.7, 1),
            );
        }

        traits
    }

    fn from_calendar_event(&self, content: &Value) -> HashMap<String, TraitValue> {
        let mut traits = HashMap::new();

        if let Some(count) = content.get("meetings_today").and_then(Value::as_i64) {
            let workload = if count >= 5 {
                "heavy"
            } else if count >= 3 {
                "normal"
            } else {
                "light"
            };
            traits.insert(
                "current_state.workload".to_string(),
                TraitValue::new(json!(workload), 0.7, 1),
            );
        }
        if let Some(minutes) = content.get("recovery_minutes").and_then(Value::as_f64) {
            traits.insert(
                "work.meeting_recovery".to_string(),
                TraitValue::new(json!(minutes), 0.6, 1),
            );
        }

        traits
    }
}

/// Pull the hour out of an ISO-8601-ish timestamp or a bare `HH:MM`.
fn parse_hour(raw: &str) -> Option<u32> {
    let time_part = raw.split('T').nth(1).unwrap_or(raw);
    let hour: u32 = time_part.split(':').next()?.parse().ok()?;
    (hour < 24).then_some(hour)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_session_extraction() {
        let extractor = TraitExtractor::new();
        let content = json!({
            "duration_minutes": 50,
            "start": "2025-06-02T08:30:00Z",
            "productivity_score": 5,
            "interruptions": 0
        });
        let traits = extractor.extract(ObservationKind::WorkSession, &content);

        assert_eq!(traits["work.focus_duration"].value, json!(50.0));
        assert_eq!(traits["work.focus_duration"].confidence, 0.9);
        assert_eq!(traits["current_state.energy_level"].value, json!("high"));
        assert_eq!(traits["work.task_switching_cost"].value, json!("low"));
        assert_eq!(
            traits["work.peak_hours"].value,
            json!(["08:00-09:00"])
        );
    }

    #[test]
    fn test_user_input_extraction() {
        let extractor = TraitExtractor::new();
        let content = json!({"energy_level": "low", "focus_available": false});
        let traits = extractor.extract(ObservationKind::UserInput, &content);
        assert_eq!(traits["current_state.energy_level"].value, json!("low"));
        assert_eq!(traits["current_state.focus_available"].value, json!(false));
    }

    #[test]
    fn test_unknown_shape_yields_nothing() {
        let extractor = TraitExtractor::new();
        let traits = extractor.extract(ObservationKind::WorkSession, &json!({"unrelated": 1}));
        assert!(traits.is_empty());
    }

    #[test]
    fn test_parse_hour() {
        assert_eq!(parse_hour("2025-06-02T14:00:00Z"), Some(14));
        assert_eq!(parse_hour("09:15"), Some(9));
        assert_eq!(parse_hour("banana"), None);
    }
}
