//! HTTP embedding provider.
//!
//! Talks to an OpenAI-compatible `/embeddings` endpoint. Requests carry a
//! hard timeout on the client; 429 and 5xx responses are retried with
//! exponential backoff up to the configured bound, 4xx responses are
//! surfaced immediately.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::EmbeddingSettings;
use crate::errors::{PersonaKitError, Result};

use super::{adapt_dimension, normalize, EmbeddingProvider};

/// Embedding client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    settings: EmbeddingSettings,
    client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    /// Build a provider from settings. Fails only if the HTTP client
    /// cannot be constructed.
    pub fn new(settings: EmbeddingSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| PersonaKitError::Provider {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { settings, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.settings.endpoint.trim_end_matches('/'))
    }

    async fn request(&self, input: Value) -> Result<Value> {
        let body = json!({
            "model": self.settings.model,
            "input": input,
        });

        let mut last_error: Option<PersonaKitError> = None;
        let mut retry_delay = std::time::Duration::from_millis(250);

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                log::warn!(
                    "embedding request retry {} after {:?}",
                    attempt,
                    retry_delay
                );
                tokio::time::sleep(retry_delay).await;
                retry_delay *= 2;
            }

            let mut request = self
                .client
                .post(self.endpoint())
                .header("Content-Type", "application/json");
            if let Some(key) = &self.settings.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }

            let response = match request.json(&body).send().await {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    last_error = Some(PersonaKitError::ProviderTimeout {
                        operation: "embed".to_string(),
                    });
                    continue;
                }
                Err(e) => {
                    last_error = Some(PersonaKitError::Provider {
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                last_error = Some(PersonaKitError::Provider {
                    message: format!("embedding endpoint returned {status}"),
                });
                continue;
            }

            let text = response.text().await.map_err(|e| PersonaKitError::Provider {
                message: e.to_string(),
            })?;

            if status.is_client_error() {
                return Err(PersonaKitError::Provider {
                    message: format!("embedding endpoint error ({status}): {text}"),
                });
            }

            return serde_json::from_str(&text).map_err(|e| PersonaKitError::Provider {
                message: format!("unparseable embedding response: {e}"),
            });
        }

        Err(last_error.unwrap_or(PersonaKitError::Provider {
            message: "embedding request failed after all retries".to_string(),
        }))
    }

    fn extract_vectors(&self, response: &Value, expected: usize) -> Result<Vec<Vec<f32>>> {
        let data = response
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| PersonaKitError::Provider {
                message: "embedding response missing 'data'".to_string(),
            })?;

        if data.len() != expected {
            return Err(PersonaKitError::Provider {
                message: format!(
                    "embedding response carried {} vectors, expected {}",
                    data.len(),
                    expected
                ),
            });
        }

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let raw: Vec<f32> = item
                .get("embedding")
                .and_then(|e| e.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_f64())
                        .map(|v| v as f32)
                        .collect()
                })
                .ok_or_else(|| PersonaKitError::Provider {
                    message: "embedding response item missing 'embedding'".to_string(),
                })?;
            vectors.push(adapt_dimension(normalize(raw), self.settings.dimension));
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn dimension(&self) -> usize {
        self.settings.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(PersonaKitError::Provider {
                message: "cannot embed empty text".to_string(),
            });
        }
        let response = self.request(json!(text)).await?;
        let mut vectors = self.extract_vectors(&response, 1)?;
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self.request(json!(texts)).await?;
        self.extract_vectors(&response, texts.len())
    }
}
