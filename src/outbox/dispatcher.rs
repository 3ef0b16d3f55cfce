//! Outbox worker loop.
//!
//! Claims batches of due events and routes them to registered handlers.
//! Delivery is at-least-once: a handler may see the same event again after
//! a crash between execution and the `done` mark, so handlers are keyed by
//! the ids inside their payloads and skip work they have already applied.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::OutboxSettings;
use crate::errors::Result;

use super::store::OutboxStore;
use super::OutboxEvent;

/// One side-effect executor, selected by event type.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    /// The event type this handler consumes.
    fn event_type(&self) -> &'static str;

    /// Execute the side effect. Must be idempotent under redelivery.
    async fn handle(&self, event: &OutboxEvent) -> Result<()>;
}

/// Polls the outbox and dispatches claimed events to handlers.
pub struct OutboxDispatcher {
    store: OutboxStore,
    handlers: HashMap<&'static str, Arc<dyn OutboxHandler>>,
    settings: OutboxSettings,
}

impl OutboxDispatcher {
    pub fn new(store: OutboxStore, settings: OutboxSettings) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            settings,
        }
    }

    /// Register a handler for its event type.
    pub fn register(mut self, handler: Arc<dyn OutboxHandler>) -> Self {
        self.handlers.insert(handler.event_type(), handler);
        self
    }

    /// Claim and process one batch. Returns how many events were handled
    /// (successfully or not); zero means the queue was empty.
    pub async fn poll_and_process(&self) -> Result<usize> {
        let store = self.store.clone();
        let batch_size = self.settings.batch_size;
        let batch =
            tokio::task::spawn_blocking(move || store.claim_batch(batch_size)).await??;

        let claimed = batch.len();
        for event in batch {
            self.process_event(event).await?;
        }
        Ok(claimed)
    }

    async fn process_event(&self, event: OutboxEvent) -> Result<()> {
        log::info!(
            "processing outbox event {} (type {}, attempt {})",
            event.id,
            event.event_type,
            event.attempts + 1
        );

        let result = match self.handlers.get(event.event_type.as_str()) {
            Some(handler) => handler.handle(&event).await,
            None => Err(crate::errors::PersonaKitError::OutboxHandlerFailure {
                event_id: event.id,
                message: format!("no handler registered for '{}'", event.event_type),
            }),
        };

        let store = self.store.clone();
        let max_attempts = self.settings.max_attempts;
        match result {
            Ok(()) => {
                tokio::task::spawn_blocking(move || store.mark_done(event.id)).await??;
                log::debug!("outbox event {} done", event.id);
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("outbox event {} failed: {message}", event.id);
                let status = tokio::task::spawn_blocking(move || {
                    store.mark_failed(event.id, &message, max_attempts)
                })
                .await??;
                if status == super::OutboxStatus::Failed {
                    // Exhausted retries; surface loudly for operators.
                    log::error!(
                        "outbox event {} moved to failed after {} attempts",
                        event.id,
                        event.attempts + 1
                    );
                }
            }
        }
        Ok(())
    }

    /// Run the polling loop until `shutdown` flips to true. Errors are
    /// logged and the loop keeps going; a broken poll must not kill the
    /// worker.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "outbox dispatcher started (batch {}, poll every {:?})",
            self.settings.batch_size,
            self.settings.poll_interval()
        );

        loop {
            match self.poll_and_process().await {
                Ok(0) => {
                    // Idle; wait out the poll interval or shut down.
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                        changed = shutdown.changed() => {
                            // Sender dropped counts as shutdown.
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(n) => {
                    log::debug!("outbox batch of {n} processed");
                }
                Err(e) => {
                    log::error!("outbox poll failed: {e}");
                    tokio::time::sleep(self.settings.poll_interval()).await;
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        log::info!("outbox dispatcher stopped");
    }
}
