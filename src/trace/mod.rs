//! Append-only trace memory.
//!
//! Two channels share one backend: the trace log proper (every loop
//! invocation, safety override, and anchor response) and the webhook event
//! log with its own retention.

mod schema;
mod store;
mod types;

pub use store::{
    InMemoryTraceStore, ProtectedTraceStore, SqliteTraceStore, TraceStore, WebhookEventLog,
};
pub use types::{TraceId, TraceRecord};
