//! Narrative semantic search.
//!
//! `index()` computes and persists an embedding, then extends the ANN
//! index; `search()` embeds the query and retrieves a person's nearest
//! narratives. Query embeddings are cached by exact text within a short
//! TTL window so mappers that reuse a query string pay one provider
//! round-trip. Ties on similarity break toward the more recent narrative.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::Settings;
use crate::embeddings::EmbeddingProvider;
use crate::errors::{PersonaKitError, Result};

use super::index::NarrativeVectorIndex;
use super::store::NarrativeStore;
use super::Narrative;

/// A search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct NarrativeMatch {
    pub narrative: Narrative,
    pub similarity: f64,
}

impl NarrativeMatch {
    /// Excerpt of the matched narrative for provenance records.
    pub fn excerpt(&self) -> String {
        self.narrative.excerpt()
    }
}

/// Tuning for [`NarrativeSearch`].
#[derive(Debug, Clone)]
pub struct NarrativeSearchConfig {
    /// Default result count when the caller passes none.
    pub top_k: usize,
    /// Default similarity floor when the caller passes none.
    pub min_similarity: Option<f64>,
    /// TTL of the exact-text query-embedding cache.
    pub cache_ttl: Duration,
    /// Maximum cached query embeddings.
    pub cache_capacity: usize,
    /// Hard deadline for one embedding call.
    pub embed_timeout: Duration,
    /// Initial ANN index capacity.
    pub index_capacity: usize,
}

impl NarrativeSearchConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            top_k: settings.search.top_k,
            min_similarity: settings.search.min_similarity,
            cache_ttl: Duration::from_secs(settings.search.cache_ttl_secs),
            cache_capacity: settings.search.cache_capacity,
            embed_timeout: settings.embeddings.timeout(),
            index_capacity: settings.search.index_capacity,
        }
    }
}

impl Default for NarrativeSearchConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

struct CachedEmbedding {
    vector: Vec<f32>,
    fetched_at: Instant,
}

/// Semantic search over a person's narratives.
pub struct NarrativeSearch {
    store: NarrativeStore,
    index: Arc<NarrativeVectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: DashMap<String, CachedEmbedding>,
    config: NarrativeSearchConfig,
}

impl NarrativeSearch {
    pub fn new(
        store: NarrativeStore,
        provider: Arc<dyn EmbeddingProvider>,
        config: NarrativeSearchConfig,
    ) -> Self {
        let index = Arc::new(NarrativeVectorIndex::new(config.index_capacity));
        Self {
            store,
            index,
            provider,
            cache: DashMap::new(),
            config,
        }
    }

    /// Rebuild the ANN index from every persisted embedding. Returns the
    /// number of indexed narratives.
    pub async fn load_index(&self) -> Result<usize> {
        let store = self.store.clone();
        let rows = tokio::task::spawn_blocking(move || store.embedded()).await??;
        for (narrative_id, person_id, embedding) in &rows {
            self.index.add(*narrative_id, *person_id, embedding);
        }
        log::info!("narrative index loaded with {} embeddings", rows.len());
        Ok(rows.len())
    }

    /// Compute and persist the embedding for a narrative, then add it to
    /// the index.
    ///
    /// Returns `false` when the narrative was already embedded; re-running
    /// on redelivery is safe.
    pub async fn index_narrative(&self, narrative_id: Uuid) -> Result<bool> {
        let store = self.store.clone();
        let narrative =
            tokio::task::spawn_blocking(move || store.get(narrative_id)).await??;

        if let Some(embedding) = &narrative.embedding {
            // Already embedded; make sure it is present in the index.
            self.index
                .add(narrative.id, narrative.person_id, embedding);
            return Ok(false);
        }

        let embedding = self.embed_with_deadline(&narrative.raw_text).await?;
        let store = self.store.clone();
        let persisted = embedding.clone();
        tokio::task::spawn_blocking(move || store.set_embedding(narrative_id, &persisted))
            .await??;
        self.index
            .add(narrative.id, narrative.person_id, &embedding);

        log::debug!(
            "indexed narrative {} for person {}",
            narrative.id,
            narrative.person_id
        );
        Ok(true)
    }

    /// Nearest narratives for a person, ordered by similarity then recency.
    pub async fn search(
        &self,
        person_id: Uuid,
        query_text: &str,
        top_k: Option<usize>,
        min_similarity: Option<f64>,
    ) -> Result<Vec<NarrativeMatch>> {
        let top_k = top_k.unwrap_or(self.config.top_k);
        let threshold = min_similarity.or(self.config.min_similarity);

        let embedding = self.query_embedding(query_text).await?;
        let hits = self.index.search_person(person_id, &embedding, top_k);
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let store = self.store.clone();
        let ids: Vec<(Uuid, f64)> = hits
            .iter()
            .map(|h| (h.narrative_id, h.similarity))
            .collect();
        let mut matches = tokio::task::spawn_blocking(move || -> Result<Vec<NarrativeMatch>> {
            let mut out = Vec::with_capacity(ids.len());
            for (id, similarity) in ids {
                out.push(NarrativeMatch {
                    narrative: store.get(id)?,
                    similarity,
                });
            }
            Ok(out)
        })
        .await??;

        if let Some(threshold) = threshold {
            matches.retain(|m| m.similarity >= threshold);
        }
        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.narrative.created_at.cmp(&a.narrative.created_at))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    /// Embed a query, serving repeats of the exact text from the TTL cache.
    async fn query_embedding(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.get(text) {
            if cached.fetched_at.elapsed() < self.config.cache_ttl {
                return Ok(cached.vector.clone());
            }
        }

        let vector = self.embed_with_deadline(text).await?;
        self.evict_stale();
        self.cache.insert(
            text.to_string(),
            CachedEmbedding {
                vector: vector.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(vector)
    }

    async fn embed_with_deadline(&self, text: &str) -> Result<Vec<f32>> {
        match tokio::time::timeout(self.config.embed_timeout, self.provider.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(PersonaKitError::ProviderTimeout {
                operation: "embed".to_string(),
            }),
        }
    }

    /// Drop expired cache entries; if still over capacity, drop the oldest.
    fn evict_stale(&self) {
        let ttl = self.config.cache_ttl;
        self.cache.retain(|_, v| v.fetched_at.elapsed() < ttl);
        while self.cache.len() >= self.config.cache_capacity {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|entry| entry.fetched_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.cache.remove(&key);
                }
                None => break,
            }
        }
    }
}
