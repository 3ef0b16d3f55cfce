//! Environment-backed configuration.
//!
//! All settings carry working defaults so the crate runs against a local
//! SQLite file and a local OpenAI-compatible embedding endpoint without any
//! environment at all. Every field can be overridden through a
//! `PERSONAKIT_*` variable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Read an environment variable, falling back to `default` when unset or
/// unparseable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Embedding provider connection settings.
#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    /// Base URL of an OpenAI-compatible embeddings endpoint.
    pub endpoint: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Model name sent with each request.
    pub model: String,
    /// Fixed vector dimensionality for this deployment.
    pub dimension: usize,
    /// Hard deadline for a single embed call, in seconds.
    pub timeout_secs: f64,
    /// Retry attempts after the first failure (429/5xx/transport).
    pub max_retries: u32,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1".to_string(),
            api_key: None,
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            timeout_secs: 5.0,
            max_retries: 2,
        }
    }
}

impl EmbeddingSettings {
    /// The embed deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }
}

/// Narrative semantic-search settings.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Default number of results for a search.
    pub top_k: usize,
    /// Default minimum similarity filter (none = return all top_k).
    pub min_similarity: Option<f64>,
    /// TTL for the exact-text query-embedding cache, in seconds.
    pub cache_ttl_secs: u64,
    /// Maximum entries in the query-embedding cache.
    pub cache_capacity: usize,
    /// Initial capacity of the in-process ANN index.
    pub index_capacity: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_similarity: None,
            cache_ttl_secs: 300,
            cache_capacity: 1024,
            index_capacity: 10_000,
        }
    }
}

/// Outbox dispatcher settings.
#[derive(Debug, Clone)]
pub struct OutboxSettings {
    /// Events claimed per poll.
    pub batch_size: usize,
    /// Sleep between empty polls, in seconds.
    pub poll_interval_secs: u64,
    /// Attempts before an event is marked failed.
    pub max_attempts: i64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval_secs: 5,
            max_attempts: 3,
        }
    }
}

impl OutboxSettings {
    /// The poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Application settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the SQLite database file.
    pub database_path: PathBuf,
    /// Embedding provider settings.
    pub embeddings: EmbeddingSettings,
    /// Narrative search settings.
    pub search: SearchSettings,
    /// Outbox dispatcher settings.
    pub outbox: OutboxSettings,
    /// Default persona validity horizon, in hours.
    pub persona_ttl_hours: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("personakit.db"),
            embeddings: EmbeddingSettings::default(),
            search: SearchSettings::default(),
            outbox: OutboxSettings::default(),
            persona_ttl_hours: 4,
        }
    }
}

impl Settings {
    /// Load settings from the environment, with defaults for anything unset.
    pub fn from_env() -> Self {
        let mut settings = Self {
            database_path: PathBuf::from(env_or(
                "PERSONAKIT_DATABASE_PATH",
                "personakit.db".to_string(),
            )),
            persona_ttl_hours: env_or("PERSONAKIT_PERSONA_TTL_HOURS", 4),
            ..Self::default()
        };

        settings.embeddings = EmbeddingSettings {
            endpoint: env_or(
                "PERSONAKIT_EMBEDDINGS_ENDPOINT",
                settings.embeddings.endpoint.clone(),
            ),
            api_key: env_opt("PERSONAKIT_EMBEDDINGS_API_KEY"),
            model: env_or(
                "PERSONAKIT_EMBEDDINGS_MODEL",
                settings.embeddings.model.clone(),
            ),
            dimension: env_or("PERSONAKIT_EMBEDDINGS_DIMENSION", settings.embeddings.dimension),
            timeout_secs: env_or("PERSONAKIT_EMBEDDINGS_TIMEOUT_SECS", settings.embeddings.timeout_secs),
            max_retries: env_or("PERSONAKIT_EMBEDDINGS_MAX_RETRIES", settings.embeddings.max_retries),
        };

        settings.search = SearchSettings {
            top_k: env_or("PERSONAKIT_SEARCH_TOP_K", settings.search.top_k),
            min_similarity: env_opt("PERSONAKIT_SEARCH_MIN_SIMILARITY")
                .and_then(|v| v.parse().ok()),
            cache_ttl_secs: env_or("PERSONAKIT_EMBED_CACHE_TTL_SECS", settings.search.cache_ttl_secs),
            cache_capacity: env_or("PERSONAKIT_EMBED_CACHE_CAPACITY", settings.search.cache_capacity),
            index_capacity: env_or("PERSONAKIT_ANN_INDEX_CAPACITY", settings.search.index_capacity),
        };

        settings.outbox = OutboxSettings {
            batch_size: env_or("PERSONAKIT_OUTBOX_BATCH_SIZE", settings.outbox.batch_size),
            poll_interval_secs: env_or(
                "PERSONAKIT_OUTBOX_POLL_INTERVAL_SECS",
                settings.outbox.poll_interval_secs,
            ),
            max_attempts: env_or("PERSONAKIT_OUTBOX_MAX_ATTEMPTS", settings.outbox.max_attempts),
        };

        settings
    }
}
