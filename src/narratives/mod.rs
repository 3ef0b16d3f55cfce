//! Free-text narrative memory.
//!
//! Narratives are immutable human inputs: self-observations and curations.
//! A curation targets a trait path and carries an action (correct, expand,
//! clarify); corrections are new narratives, never edits. Each narrative is
//! embedded for semantic search (§ [`search`]) and indexed in the ANN
//! structure (§ [`index`]).

pub mod index;
pub mod search;
pub mod store;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use index::NarrativeVectorIndex;
pub use search::{NarrativeMatch, NarrativeSearch, NarrativeSearchConfig};
pub use store::NarrativeStore;

/// Kind of narrative input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeKind {
    /// A person describing themselves in free text.
    SelfObservation,
    /// A correction or refinement targeted at a specific trait.
    Curation,
}

impl NarrativeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfObservation => "self_observation",
            Self::Curation => "curation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "self_observation" => Some(Self::SelfObservation),
            "curation" => Some(Self::Curation),
            _ => None,
        }
    }
}

/// A stored narrative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Narrative {
    pub id: Uuid,
    pub person_id: Uuid,
    pub kind: NarrativeKind,
    pub raw_text: String,
    pub tags: Vec<String>,
    pub context: Value,
    /// Target trait path; set for curations.
    pub trait_path: Option<String>,
    /// Curation action: correct, expand, clarify.
    pub curation_action: Option<String>,
    /// Where the narrative came from (workbench, agent, ...).
    pub source: Option<String>,
    /// Unit-length embedding vector, present once indexed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

impl Narrative {
    /// Build a new self-observation, extracting tags when none are given.
    pub fn self_observation(
        person_id: Uuid,
        raw_text: impl Into<String>,
        tags: Vec<String>,
        context: Value,
        source: Option<String>,
    ) -> Self {
        let raw_text = raw_text.into();
        let tags = if tags.is_empty() {
            extract_tags(&raw_text)
        } else {
            tags
        };
        Self {
            id: Uuid::new_v4(),
            person_id,
            kind: NarrativeKind::SelfObservation,
            raw_text,
            tags,
            context,
            trait_path: None,
            curation_action: None,
            source,
            embedding: None,
            created_at: Utc::now(),
        }
    }

    /// Build a curation narrative targeting a trait path.
    pub fn curation(
        person_id: Uuid,
        raw_text: impl Into<String>,
        trait_path: impl Into<String>,
        action: impl Into<String>,
        tags: Vec<String>,
        context: Value,
    ) -> Self {
        let raw_text = raw_text.into();
        let trait_path = trait_path.into();
        let mut tags = if tags.is_empty() {
            extract_tags(&raw_text)
        } else {
            tags
        };
        tags.push(format!("curates:{trait_path}"));
        Self {
            id: Uuid::new_v4(),
            person_id,
            kind: NarrativeKind::Curation,
            raw_text,
            tags,
            context,
            trait_path: Some(trait_path),
            curation_action: Some(action.into()),
            source: Some("curation".to_string()),
            embedding: None,
            created_at: Utc::now(),
        }
    }

    /// Short excerpt of the raw text for provenance records.
    pub fn excerpt(&self) -> String {
        const EXCERPT_LEN: usize = 200;
        if self.raw_text.chars().count() <= EXCERPT_LEN {
            self.raw_text.clone()
        } else {
            let cut: String = self.raw_text.chars().take(EXCERPT_LEN).collect();
            format!("{cut}...")
        }
    }
}

/// Link between a narrative and a trait it curates, supports, or
/// contradicts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitNarrativeLink {
    pub id: Uuid,
    pub narrative_id: Uuid,
    pub trait_path: String,
    pub person_id: Uuid,
    /// extracted_from, curates, supports, contradicts.
    pub link_type: String,
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

static TAG_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "morning", "evening", "night", "afternoon", "productivity", "focus", "energy", "tired",
        "meeting", "coding", "writing", "thinking", "break", "exercise", "coffee", "lunch",
        "stressed", "calm", "motivated", "frustrated",
    ]
});

/// Keyword-based tag extraction for narratives submitted without tags.
pub fn extract_tags(text: &str) -> Vec<String> {
    const MAX_TAGS: usize = 5;
    let lower = text.to_lowercase();
    TAG_KEYWORDS
        .iter()
        .filter(|kw| lower.contains(*kw))
        .take(MAX_TAGS)
        .map(|kw| kw.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_tags_finds_keywords() {
        let tags = extract_tags("Morning coffee helps my focus before meetings");
        assert!(tags.contains(&"morning".to_string()));
        assert!(tags.contains(&"coffee".to_string()));
        assert!(tags.contains(&"focus".to_string()));
        assert!(tags.len() <= 5);
    }

    #[test]
    fn test_curation_carries_trait_tag() {
        let n = Narrative::curation(
            Uuid::new_v4(),
            "Actually I focus best at night",
            "work.energy_patterns.night",
            "correct",
            vec![],
            json!({}),
        );
        assert_eq!(n.kind, NarrativeKind::Curation);
        assert!(n
            .tags
            .contains(&"curates:work.energy_patterns.night".to_string()));
        assert_eq!(n.curation_action.as_deref(), Some("correct"));
    }

    #[test]
    fn test_excerpt_truncates_long_text() {
        let person = Uuid::new_v4();
        let long = "x".repeat(500);
        let n = Narrative::self_observation(person, long, vec![], json!({}), None);
        assert!(n.excerpt().ends_with("..."));
        assert!(n.excerpt().chars().count() <= 203);
    }
}
