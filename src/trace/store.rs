//! Trace store backends.
//!
//! The store is the system's append-only memory: every loop invocation,
//! safety override, and anchor response lands here, and the frame builder
//! reads it back. Read-your-writes holds within a single process; anything
//! stronger is the embedder's problem.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::trace::schema::{initialize_schema, is_initialized};
use crate::trace::types::{TraceId, TraceRecord};
use crate::webhook::WebhookEvent;

/// Append-only trace log.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Append a record. Never overwrites.
    async fn append(&self, record: TraceRecord) -> Result<()>;

    /// Most recent records for a user, newest first.
    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<TraceRecord>>;

    /// Fetch one record by id.
    async fn get(&self, id: &TraceId) -> Result<Option<TraceRecord>>;

    /// Delete whole records older than the cutoff. Returns how many went.
    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Separate persistence channel for inbound webhook events.
#[async_trait]
pub trait WebhookEventLog: Send + Sync {
    /// Record a received event.
    async fn record_event(&self, event: &WebhookEvent) -> Result<()>;

    /// Mark an event processed with its dispatch results.
    async fn mark_processed(
        &self,
        delivery_id: &str,
        processing_time_ms: f64,
        triggered_actions: u32,
    ) -> Result<()>;

    /// Delete whole events received before the cutoff. Returns how many went.
    async fn prune_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// SQLite-backed trace store.
pub struct SqliteTraceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTraceStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| Error::TraceStorage(e.to_string()))?;

        if !is_initialized(&conn) {
            initialize_schema(&conn).map_err(|e| Error::TraceStorage(e.to_string()))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::TraceStorage(e.to_string()))?;
        initialize_schema(&conn).map_err(|e| Error::TraceStorage(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
        f(&conn).map_err(|e| Error::TraceStorage(e.to_string()))
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<TraceRecord> {
        let id: String = row.get(0)?;
        let event_data: String = row.get(3)?;
        let timestamp: String = row.get(5)?;

        Ok(TraceRecord {
            id: TraceId(id),
            user_id: row.get(1)?,
            event_type: row.get(2)?,
            event_data: serde_json::from_str(&event_data).unwrap_or(serde_json::Value::Null),
            task_id: row.get(4)?,
            timestamp: timestamp
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now()),
            source: row.get(6)?,
            confidence: row.get(7)?,
        })
    }
}

#[async_trait]
impl TraceStore for SqliteTraceStore {
    async fn append(&self, record: TraceRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO traces (
                    id, user_id, event_type, event_data, task_id, timestamp, source, confidence
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id.to_string(),
                    record.user_id,
                    record.event_type,
                    serde_json::to_string(&record.event_data).unwrap_or_default(),
                    record.task_id,
                    record.timestamp.to_rfc3339(),
                    record.source,
                    record.confidence,
                ],
            )?;
            Ok(())
        })
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<TraceRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, event_type, event_data, task_id, timestamp, source, confidence
                 FROM traces WHERE user_id = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], Self::row_to_record)?;
            rows.collect()
        })
    }

    async fn get(&self, id: &TraceId) -> Result<Option<TraceRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, user_id, event_type, event_data, task_id, timestamp, source, confidence
                 FROM traces WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_record,
            )
            .optional()
        })
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM traces WHERE timestamp < ?1",
                params![cutoff.to_rfc3339()],
            )?;
            Ok(deleted as u64)
        })
    }
}

#[async_trait]
impl WebhookEventLog for SqliteTraceStore {
    async fn record_event(&self, event: &WebhookEvent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO webhook_events (
                    delivery_id, event_type, action, source_ref, payload,
                    received_at, processed, processing_time_ms, triggered_actions
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.delivery_id,
                    event.event_type,
                    event.action,
                    event.source_ref,
                    serde_json::to_string(&event.payload).unwrap_or_default(),
                    event.received_at.to_rfc3339(),
                    event.processed as i32,
                    event.processing_time_ms,
                    event.triggered_actions,
                ],
            )?;
            Ok(())
        })
    }

    async fn mark_processed(
        &self,
        delivery_id: &str,
        processing_time_ms: f64,
        triggered_actions: u32,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE webhook_events
                 SET processed = 1, processing_time_ms = ?2, triggered_actions = ?3
                 WHERE delivery_id = ?1",
                params![delivery_id, processing_time_ms, triggered_actions],
            )?;
            Ok(())
        })
    }

    async fn prune_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM webhook_events WHERE received_at < ?1",
                params![cutoff.to_rfc3339()],
            )?;
            Ok(deleted as u64)
        })
    }
}

/// Trace store decorator that fails fast while its dependency's circuit is
/// open, and feeds call outcomes back into the breaker.
pub struct ProtectedTraceStore {
    inner: Arc<dyn TraceStore>,
    breaker: Arc<crate::breaker::InfraBreaker>,
}

impl ProtectedTraceStore {
    /// Wrap a store with an infrastructure breaker.
    pub fn new(inner: Arc<dyn TraceStore>, breaker: Arc<crate::breaker::InfraBreaker>) -> Self {
        Self { inner, breaker }
    }

    /// The breaker guarding this store.
    pub fn breaker(&self) -> &crate::breaker::InfraBreaker {
        &self.breaker
    }

    async fn guarded<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.breaker.guard()?;
        let result = call.await;
        self.breaker.record(result.is_ok());
        result
    }
}

#[async_trait]
impl TraceStore for ProtectedTraceStore {
    async fn append(&self, record: TraceRecord) -> Result<()> {
        self.guarded(self.inner.append(record)).await
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<TraceRecord>> {
        self.guarded(self.inner.recent(user_id, limit)).await
    }

    async fn get(&self, id: &TraceId) -> Result<Option<TraceRecord>> {
        self.guarded(self.inner.get(id)).await
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.guarded(self.inner.prune_older_than(cutoff)).await
    }
}

/// In-memory trace store for tests and single-session embedders.
#[derive(Default)]
pub struct InMemoryTraceStore {
    records: Mutex<Vec<TraceRecord>>,
    events: Mutex<HashMap<String, WebhookEvent>>,
}

impl InMemoryTraceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of webhook events currently held.
    pub fn event_count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// All records of a given event type, oldest first. Test helper.
    pub fn of_type(&self, event_type: &str) -> Vec<TraceRecord> {
        self.records
            .lock()
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.event_type == event_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TraceStore for InMemoryTraceStore {
    async fn append(&self, record: TraceRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .push(record);
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<TraceRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &TraceId) -> Result<Option<TraceRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(records.iter().find(|r| &r.id == id).cloned())
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[async_trait]
impl WebhookEventLog for InMemoryTraceStore {
    async fn record_event(&self, event: &WebhookEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?
            .entry(event.delivery_id.clone())
            .or_insert_with(|| event.clone());
        Ok(())
    }

    async fn mark_processed(
        &self,
        delivery_id: &str,
        processing_time_ms: f64,
        triggered_actions: u32,
    ) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?;
        if let Some(event) = events.get_mut(delivery_id) {
            event.processed = true;
            event.processing_time_ms = processing_time_ms;
            event.triggered_actions = triggered_actions;
        }
        Ok(())
    }

    async fn prune_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut events = self
            .events
            .lock()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let before = events.len();
        events.retain(|_, event| event.received_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}
