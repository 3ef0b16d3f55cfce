//! In-process approximate nearest-neighbor index over narrative embeddings.
//!
//! HNSW graph with cosine distance; similarity reported as
//! `1 - distance`. The index is rebuilt from the narrative store on startup
//! and extended incrementally as narratives are indexed. Entries are never
//! removed (narratives are immutable), so the id map only grows.

use std::collections::HashSet;

use hnsw_rs::prelude::*;
use parking_lot::RwLock;
use uuid::Uuid;

/// One indexed narrative.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    narrative_id: Uuid,
    person_id: Uuid,
}

/// A person-filterable ANN hit.
#[derive(Debug, Clone, Copy)]
pub struct IndexHit {
    pub narrative_id: Uuid,
    pub similarity: f64,
}

/// HNSW index keyed by insertion order, with a side map back to narrative
/// and person ids.
pub struct NarrativeVectorIndex {
    hnsw: RwLock<Hnsw<'static, f32, DistCosine>>,
    entries: RwLock<Vec<IndexEntry>>,
    seen: RwLock<HashSet<Uuid>>,
}

impl NarrativeVectorIndex {
    /// Create an empty index sized for `capacity` narratives.
    pub fn new(capacity: usize) -> Self {
        const MAX_CONNECTIONS: usize = 16;
        const MAX_LAYER: usize = 16;
        const EF_CONSTRUCTION: usize = 200;
        let hnsw = Hnsw::new(
            MAX_CONNECTIONS,
            capacity.max(16),
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistCosine,
        );
        Self {
            hnsw: RwLock::new(hnsw),
            entries: RwLock::new(Vec::new()),
            seen: RwLock::new(HashSet::new()),
        }
    }

    /// Number of indexed narratives.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a narrative embedding. Re-adding an already indexed narrative is
    /// a no-op, which keeps redelivered outbox events harmless.
    pub fn add(&self, narrative_id: Uuid, person_id: Uuid, embedding: &[f32]) {
        {
            let mut seen = self.seen.write();
            if !seen.insert(narrative_id) {
                return;
            }
        }
        let idx = {
            let mut entries = self.entries.write();
            entries.push(IndexEntry {
                narrative_id,
                person_id,
            });
            entries.len() - 1
        };
        let hnsw = self.hnsw.read();
        hnsw.insert((embedding, idx));
    }

    /// Nearest narratives for one person.
    ///
    /// The graph is shared across people, so the beam oversamples and hits
    /// belonging to other people are filtered out before the top `k` are
    /// returned.
    pub fn search_person(&self, person_id: Uuid, query: &[f32], k: usize) -> Vec<IndexHit> {
        if self.is_empty() || k == 0 {
            return Vec::new();
        }
        let oversample = (k * 8).max(64);
        let ef_search = oversample.max(50);

        let hnsw = self.hnsw.read();
        let entries = self.entries.read();
        let neighbours = hnsw.search(query, oversample.min(entries.len()), ef_search);

        neighbours
            .into_iter()
            .filter_map(|n| {
                let entry = entries.get(n.d_id)?;
                if entry.person_id != person_id {
                    return None;
                }
                Some(IndexHit {
                    narrative_id: entry.narrative_id,
                    similarity: (1.0 - n.distance as f64).clamp(-1.0, 1.0),
                })
            })
            .take(k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_search_filters_person() {
        let index = NarrativeVectorIndex::new(64);
        let p = Uuid::new_v4();
        let q = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        index.add(a, p, &[1.0, 0.0, 0.0]);
        index.add(b, q, &[1.0, 0.0, 0.0]);
        assert_eq!(index.len(), 2);

        let hits = index.search_person(p, &[1.0, 0.0, 0.0], 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].narrative_id, a);
        assert!(hits[0].similarity > 0.99);

        let none = index.search_person(Uuid::new_v4(), &[1.0, 0.0, 0.0], 5);
        assert!(none.is_empty());
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let index = NarrativeVectorIndex::new(64);
        let p = Uuid::new_v4();
        let a = Uuid::new_v4();
        index.add(a, p, &[0.0, 1.0]);
        index.add(a, p, &[0.0, 1.0]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_ranking_by_similarity() {
        let index = NarrativeVectorIndex::new(64);
        let p = Uuid::new_v4();
        let close = Uuid::new_v4();
        let far = Uuid::new_v4();
        index.add(close, p, &[0.9, 0.1, 0.0]);
        index.add(far, p, &[0.0, 1.0, 0.0]);

        let hits = index.search_person(p, &[1.0, 0.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].narrative_id, close);
        assert!(hits[0].similarity > hits[1].similarity);
    }
}
