//! Durable event queue and background flush
//!
//! Events for one user are read from the store in a single pass, shipped as
//! one batch, and only the keys from that pass are deleted afterwards. Events
//! written while a request is in flight stay queued for the next batch.
//!
//! | Response | Outcome | Queued events |
//! |----------|---------|---------------|
//! | 2xx | [`SendOutcome::Delivered`] | deleted |
//! | other < 500 | [`SendOutcome::Rejected`] | deleted, status and body logged |
//! | >= 500 or no response | [`SendOutcome::Retryable`] | kept |

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::background::{Latch, RepeatingTask};
use crate::error::Result;
use crate::storage::LocalStore;
use crate::types::{FlushConfig, QueuedEvent};

use super::api::EventApiClient;

/// Result of one [`EventQueueManager::send_events`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Another send was in flight
    Skipped,
    /// Nothing was queued
    Empty,
    Delivered { events: usize },
    /// Permanent failure; the batch was discarded
    Rejected { status: u16, events: usize },
    /// Transient failure; the batch stays queued
    Retryable { reason: String },
}

/// Flush statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushStats {
    /// Background cycles that ran
    pub cycles: usize,
    /// Batches the collector accepted
    pub batches_sent: usize,
    /// Events the collector accepted
    pub events_sent: usize,
    /// Events dropped after a non-retryable response
    pub events_discarded: usize,
    /// Sends that left their batch queued
    pub retryable_failures: usize,
    /// Sends skipped because another send was in flight
    pub skipped_sends: usize,
    /// QA shadow events posted
    pub qa_events_sent: usize,
}

/// Owns the flush loop and the QA shadow-event task for one user
pub struct EventQueueManager {
    store: LocalStore,
    user_id: String,
    client: EventApiClient,
    processing: Latch,
    sending: Latch,
    stats: Arc<Mutex<FlushStats>>,
    flush_config: watch::Receiver<FlushConfig>,
    qa_tx: Mutex<Option<mpsc::UnboundedSender<Vec<QueuedEvent>>>>,
    qa_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<QueuedEvent>>>>,
    qa_task: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Option<RepeatingTask>>,
}

impl EventQueueManager {
    pub fn new(
        store: LocalStore,
        user_id: &str,
        client: EventApiClient,
        flush_config: watch::Receiver<FlushConfig>,
    ) -> Self {
        let (qa_tx, qa_rx) = mpsc::unbounded_channel();
        Self {
            store,
            user_id: user_id.to_string(),
            client,
            processing: Latch::new(),
            sending: Latch::new(),
            stats: Arc::new(Mutex::new(FlushStats::default())),
            flush_config,
            qa_tx: Mutex::new(Some(qa_tx)),
            qa_rx: Mutex::new(Some(qa_rx)),
            qa_task: Mutex::new(None),
            background: Mutex::new(None),
        }
    }

    /// Start the flush loop (first cycle immediately) and the QA task
    pub fn start(self: &Arc<Self>) {
        let mut background = self.background.lock().unwrap();
        if background.is_some() {
            return;
        }

        let queue = Arc::downgrade(self);
        let flush_config = self.flush_config.clone();
        *background = Some(RepeatingTask::spawn(
            "event-flush",
            Duration::ZERO,
            move || Duration::from_millis(flush_config.borrow().flush_frequency),
            move || {
                let queue = queue.upgrade();
                async move {
                    if let Some(queue) = queue {
                        queue.process_in_background().await;
                    }
                }
            },
        ));

        if let Some(rx) = self.qa_rx.lock().unwrap().take() {
            let client = self.client.clone();
            let stats = Arc::clone(&self.stats);
            *self.qa_task.lock().unwrap() = Some(tokio::spawn(run_qa_sender(rx, client, stats)));
        }

        tracing::info!(
            user_id = %self.user_id,
            flush_frequency_ms = self.flush_config.borrow().flush_frequency,
            "Event queue started"
        );
    }

    /// One background cycle; a no-op while a previous cycle is running
    pub async fn process_in_background(&self) {
        let Some(_processing) = self.processing.try_acquire() else {
            tracing::debug!("Previous flush cycle still running");
            return;
        };
        self.stats.lock().unwrap().cycles += 1;

        if let Err(e) = self.send_events().await {
            tracing::error!(user_id = %self.user_id, error = %e, "Error processing queued events");
        }
    }

    /// Ship everything queued for the user as one batch
    pub async fn send_events(&self) -> Result<SendOutcome> {
        let Some(_sending) = self.sending.try_acquire() else {
            tracing::debug!(user_id = %self.user_id, "Send already in flight, skipping");
            self.stats.lock().unwrap().skipped_sends += 1;
            return Ok(SendOutcome::Skipped);
        };

        let stored = self.store.read_events(&self.user_id)?;
        if stored.is_empty() {
            return Ok(SendOutcome::Empty);
        }
        let (keys, events): (Vec<String>, Vec<QueuedEvent>) =
            stored.into_iter().map(|s| (s.key, s.event)).unzip();

        let outcome = match self.client.send_batch(&events).await {
            Ok(response) if response.is_success() => {
                self.store.delete_events(&keys)?;
                let mut stats = self.stats.lock().unwrap();
                stats.batches_sent += 1;
                stats.events_sent += events.len();
                tracing::info!(
                    user_id = %self.user_id,
                    events = events.len(),
                    status = response.status,
                    "Event batch delivered"
                );
                SendOutcome::Delivered {
                    events: events.len(),
                }
            }
            Ok(response) if response.status < 500 => {
                self.store.delete_events(&keys)?;
                self.stats.lock().unwrap().events_discarded += events.len();
                tracing::error!(
                    user_id = %self.user_id,
                    events = events.len(),
                    status = response.status,
                    body = %response.body,
                    "Event batch rejected, discarding"
                );
                SendOutcome::Rejected {
                    status: response.status,
                    events: events.len(),
                }
            }
            Ok(response) => {
                self.stats.lock().unwrap().retryable_failures += 1;
                tracing::warn!(
                    user_id = %self.user_id,
                    events = events.len(),
                    status = response.status,
                    "Event batch failed, will retry"
                );
                SendOutcome::Retryable {
                    reason: format!("status {}", response.status),
                }
            }
            Err(e) => {
                self.stats.lock().unwrap().retryable_failures += 1;
                tracing::warn!(
                    user_id = %self.user_id,
                    events = events.len(),
                    error = %e,
                    "Event batch not sent, will retry"
                );
                SendOutcome::Retryable {
                    reason: e.to_string(),
                }
            }
        };

        Ok(outcome)
    }

    /// Post QA shadow events right away, bypassing the durable queue
    pub fn send_qa_events(&self, events: Vec<QueuedEvent>) {
        if events.is_empty() {
            return;
        }
        match self.qa_tx.lock().unwrap().as_ref() {
            Some(tx) => {
                if tx.send(events).is_err() {
                    tracing::warn!("QA sender has stopped, dropping QA events");
                }
            }
            None => tracing::debug!("Queue shut down, dropping QA events"),
        }
    }

    /// Stop the loop, make one last send and drain pending QA events.
    /// Errors are logged, never returned.
    pub async fn shutdown(&self) {
        let background = self.background.lock().unwrap().take();
        if let Some(task) = background {
            task.shutdown().await;
        }

        match self.send_events().await {
            Ok(outcome) => tracing::info!(user_id = %self.user_id, ?outcome, "Final flush"),
            Err(e) => {
                tracing::error!(user_id = %self.user_id, error = %e, "Could not flush events before shutdown")
            }
        }

        self.qa_tx.lock().unwrap().take();
        let qa_task = self.qa_task.lock().unwrap().take();
        if let Some(handle) = qa_task {
            let _ = handle.await;
        }
    }

    /// Events currently queued for the user, in queue order
    pub fn queued_events(&self) -> Result<Vec<QueuedEvent>> {
        Ok(self
            .store
            .read_events(&self.user_id)?
            .into_iter()
            .map(|s| s.event)
            .collect())
    }

    pub fn stats(&self) -> FlushStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.is_held()
    }

    pub fn is_sending(&self) -> bool {
        self.sending.is_held()
    }

    /// Start and stop times of the last background cycle, ms since epoch
    pub fn last_cycle(&self) -> (Option<i64>, Option<i64>) {
        (self.processing.last_start(), self.processing.last_stop())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

async fn run_qa_sender(
    mut rx: mpsc::UnboundedReceiver<Vec<QueuedEvent>>,
    client: EventApiClient,
    stats: Arc<Mutex<FlushStats>>,
) {
    while let Some(events) = rx.recv().await {
        match client.send_batch(&events).await {
            Ok(response) if response.is_success() => {
                stats.lock().unwrap().qa_events_sent += events.len();
                tracing::debug!(events = events.len(), "QA events sent");
            }
            Ok(response) => tracing::warn!(
                status = response.status,
                body = %response.body,
                "QA events rejected"
            ),
            Err(e) => tracing::warn!(error = %e, "QA events not sent"),
        }
    }
    tracing::debug!("QA sender stopped");
}
