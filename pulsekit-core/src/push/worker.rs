//! The push worker
//!
//! A single task owns the worker store and drains a mailbox of page requests
//! and browser events one at a time. It keeps running when no page is
//! attached, capturing push events for whichever user was last marked
//! current, and hands them over when a page asks.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::db::schema::{run_migrations, WORKER_MIGRATIONS};
use crate::error::{Error, Result};
use crate::types::{push_delivered_event_name, push_engaged_event_name, PushEventRecord, PushEventType, WorkerUser};

use super::protocol::{BrowserEvent, ClientMessage, Envelope, PageRequest, PushPayload, WorkerInput, WorkerReply};

const MAILBOX_CAPACITY: usize = 64;
const CLIENT_CHANNEL_CAPACITY: usize = 32;

// ============================================
// Worker store
// ============================================

/// The worker's own database: known users and captured push events
pub struct WorkerStore {
    conn: Mutex<Connection>,
}

impl WorkerStore {
    /// Open or create the worker store at `path` and migrate it
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        run_migrations(&conn, WORKER_MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a migrated in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn, WORKER_MIGRATIONS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Mark `user_id` as the current user.
    ///
    /// `last_active` is kept strictly above every other user's so the most
    /// recent call wins even within the same millisecond.
    pub fn set_current_user(&self, user_id: &str) -> Result<WorkerUser> {
        let conn = self.conn.lock().unwrap();
        let latest: Option<i64> =
            conn.query_row("SELECT MAX(last_active) FROM push_users", [], |r| r.get(0))?;
        let now = chrono::Utc::now().timestamp_millis();
        let last_active = match latest {
            Some(latest) if latest >= now => latest + 1,
            _ => now,
        };

        conn.execute(
            r#"
            INSERT INTO push_users (user_id, last_active) VALUES (?1, ?2)
            ON CONFLICT(user_id) DO UPDATE SET last_active = excluded.last_active
            "#,
            params![user_id, last_active],
        )?;

        Ok(WorkerUser {
            user_id: user_id.to_string(),
            last_active,
        })
    }

    /// The user with the greatest `last_active`
    pub fn current_user(&self) -> Result<Option<WorkerUser>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT user_id, last_active FROM push_users ORDER BY last_active DESC LIMIT 1",
            [],
            |row| {
                Ok(WorkerUser {
                    user_id: row.get(0)?,
                    last_active: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// Record a push event; returns its row id
    pub fn store_push_event(
        &self,
        user_id: &str,
        event_type: PushEventType,
        event: &str,
        campaign_id: Option<i64>,
        timestamp: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO push_events (user_id, event_type, event, campaign_id, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![user_id, event_type.as_str(), event, campaign_id, timestamp],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All captured events for `user_id`, oldest first
    pub fn push_events_for_user(&self, user_id: &str) -> Result<Vec<PushEventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, event_type, event, campaign_id, user_id, timestamp
            FROM push_events
            WHERE user_id = ?1
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;

        let rows = stmt.query_map([user_id], |row| {
            let event_type: String = row.get(1)?;
            Ok((
                row.get::<_, i64>(0)?,
                event_type,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, event_type, event, campaign_id, user_id, timestamp) = row?;
            match event_type.parse::<PushEventType>() {
                Ok(event_type) => records.push(PushEventRecord {
                    id,
                    event_type,
                    event,
                    campaign_id,
                    user_id,
                    timestamp,
                }),
                Err(e) => tracing::warn!(id, error = %e, "Skipping unreadable push event"),
            }
        }
        Ok(records)
    }

    /// Delete the given records; returns how many rows went away
    pub fn delete_push_events(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM push_events WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Drop every captured event for `user_id`
    pub fn delete_push_events_for_user(&self, user_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM push_events WHERE user_id = ?1", [user_id])?)
    }

    pub fn push_event_count(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM push_events", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

// ============================================
// Notification display
// ============================================

/// Displays notifications and opens deep links on the worker's behalf
pub trait Notifier: Send + Sync {
    fn show(&self, payload: &PushPayload) -> Result<()>;
    fn close(&self, campaign_id: i64);
    fn open_window(&self, url: &str) -> Result<()>;
}

/// Notifier that only logs; used when no display surface exists
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show(&self, payload: &PushPayload) -> Result<()> {
        tracing::info!(campaign_id = payload.campaign_id, title = %payload.title, "Notification shown");
        Ok(())
    }

    fn close(&self, campaign_id: i64) {
        tracing::debug!(campaign_id, "Notification closed");
    }

    fn open_window(&self, url: &str) -> Result<()> {
        tracing::info!(url, "Opening deep link");
        Ok(())
    }
}

// ============================================
// Worker task
// ============================================

/// Page-side handle to a running worker
#[derive(Clone)]
pub struct WorkerHandle {
    mailbox: mpsc::Sender<WorkerInput>,
    clients: broadcast::Sender<ClientMessage>,
}

impl WorkerHandle {
    /// Send a request and wait up to `timeout` for the reply
    pub async fn request(&self, request: PageRequest, timeout: Duration) -> Result<WorkerReply> {
        let (reply, reply_rx) = oneshot::channel();
        self.mailbox
            .send(WorkerInput::Message(Envelope { request, reply }))
            .await
            .map_err(|_| Error::Bridge("push worker is not running".to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Bridge("push worker dropped the request".to_string())),
            Err(_) => Err(Error::Bridge(format!(
                "push worker did not reply within {} ms",
                timeout.as_millis()
            ))),
        }
    }

    pub async fn set_user_session(&self, user_id: &str, timeout: Duration) -> Result<WorkerUser> {
        let request = PageRequest::SetUserSession {
            user_id: user_id.to_string(),
        };
        match self.request(request, timeout).await? {
            WorkerReply::UserSession(user) => Ok(user),
            WorkerReply::Error(e) => Err(Error::Bridge(e)),
            other => Err(Error::Bridge(format!("unexpected reply: {:?}", other))),
        }
    }

    pub async fn fetch_push_data(&self, user_id: &str, timeout: Duration) -> Result<Vec<PushEventRecord>> {
        let request = PageRequest::FetchPushData {
            user_id: user_id.to_string(),
        };
        match self.request(request, timeout).await? {
            WorkerReply::PushData(records) => Ok(records),
            WorkerReply::Error(e) => Err(Error::Bridge(e)),
            other => Err(Error::Bridge(format!("unexpected reply: {:?}", other))),
        }
    }

    /// Deliver a browser event (push arrival, click, close)
    pub async fn dispatch(&self, event: BrowserEvent) -> Result<()> {
        self.mailbox
            .send(WorkerInput::Browser(event))
            .await
            .map_err(|_| Error::Bridge("push worker is not running".to_string()))
    }

    /// Listen for the worker's notification broadcasts
    pub fn subscribe_clients(&self) -> broadcast::Receiver<ClientMessage> {
        self.clients.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.mailbox.is_closed()
    }
}

/// The worker actor
pub struct PushWorker {
    store: Arc<WorkerStore>,
    notifier: Arc<dyn Notifier>,
    clients: broadcast::Sender<ClientMessage>,
}

impl PushWorker {
    pub fn new(store: Arc<WorkerStore>, notifier: Arc<dyn Notifier>) -> Self {
        let (clients, _) = broadcast::channel(CLIENT_CHANNEL_CAPACITY);
        Self {
            store,
            notifier,
            clients,
        }
    }

    /// Start the mailbox loop. The task ends once every handle is dropped.
    pub fn spawn(self) -> (WorkerHandle, JoinHandle<()>) {
        let (mailbox, mut rx) = mpsc::channel(MAILBOX_CAPACITY);
        let handle = WorkerHandle {
            mailbox,
            clients: self.clients.clone(),
        };

        let task = tokio::spawn(async move {
            tracing::debug!("Push worker started");
            while let Some(input) = rx.recv().await {
                match input {
                    WorkerInput::Message(envelope) => self.handle_message(envelope),
                    WorkerInput::Browser(event) => self.handle_browser_event(event),
                }
            }
            tracing::debug!("Push worker stopped");
        });

        (handle, task)
    }

    fn handle_message(&self, envelope: Envelope) {
        let Envelope { request, reply } = envelope;
        match request {
            PageRequest::SetUserSession { user_id } => {
                let response = match self.store.set_current_user(&user_id) {
                    Ok(user) => WorkerReply::UserSession(user),
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Failed to set worker user");
                        WorkerReply::Error(e.to_string())
                    }
                };
                let _ = reply.send(response);
            }
            PageRequest::FetchPushData { user_id } => {
                let records = match self.store.push_events_for_user(&user_id) {
                    Ok(records) => records,
                    Err(e) => {
                        tracing::warn!(user_id = %user_id, error = %e, "Failed to read push events");
                        let _ = reply.send(WorkerReply::Error(e.to_string()));
                        return;
                    }
                };

                let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
                if reply.send(WorkerReply::PushData(records)).is_err() {
                    tracing::warn!(user_id = %user_id, "Page went away before push data was delivered");
                }

                // Handed over exactly once, delivered or not
                if !ids.is_empty() {
                    match self.store.delete_push_events(&ids) {
                        Ok(deleted) => tracing::debug!(user_id = %user_id, deleted, "Push events handed over"),
                        Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Failed to delete push events"),
                    }
                }
            }
        }
    }

    fn handle_browser_event(&self, event: BrowserEvent) {
        match event {
            BrowserEvent::Push(payload) => {
                let id = payload.campaign_id;
                self.capture(PushEventType::Received, &push_delivered_event_name(id), id);
                let _ = self.clients.send(ClientMessage::PushReceived { id });
                if let Err(e) = self.notifier.show(&payload) {
                    tracing::warn!(campaign_id = id, error = %e, "Failed to show notification");
                }
            }
            BrowserEvent::NotificationClick(payload) => {
                let id = payload.campaign_id;
                self.notifier.close(id);
                if let Some(url) = payload.deeplink.as_deref() {
                    if let Err(e) = self.notifier.open_window(url) {
                        tracing::warn!(campaign_id = id, url, error = %e, "Failed to open deep link");
                    }
                }
                self.capture(PushEventType::Clicked, &push_engaged_event_name(id), id);
                let _ = self.clients.send(ClientMessage::PushClicked {
                    id,
                    deeplink: payload.deeplink,
                    custom_payload: payload.custom_payload,
                });
            }
            BrowserEvent::NotificationClose(payload) => {
                tracing::debug!(campaign_id = payload.campaign_id, "Notification dismissed");
                let _ = self.clients.send(ClientMessage::PushClosed);
            }
        }
    }

    /// Store a push event against the current user. Failures are logged only.
    fn capture(&self, event_type: PushEventType, event: &str, campaign_id: i64) {
        let user = match self.store.current_user() {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(campaign_id, "No current user, push event not captured");
                return;
            }
            Err(e) => {
                tracing::warn!(campaign_id, error = %e, "Failed to look up current user");
                return;
            }
        };

        let timestamp = chrono::Utc::now().timestamp_millis();
        if let Err(e) = self
            .store
            .store_push_event(&user.user_id, event_type, event, Some(campaign_id), timestamp)
        {
            tracing::warn!(campaign_id, error = %e, "Failed to store push event");
        }
    }
}
