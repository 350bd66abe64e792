//! Audit events emitted after every successful mutation.
//!
//! The recorder that persists the audit trail is an external consumer.
//! The core's obligation is emission: synchronously after local commit,
//! fire-and-forget. A sink that drops events costs history, never
//! correctness of the primary store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// A structured audit event: what changed, who changed it, both images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Table the mutation touched ("results", "exceptions", ...).
    pub table: String,
    pub operation: AuditOp,
    /// Who performed the mutation: an advisor username or "worker:<id>".
    pub actor: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    Insert,
    Update,
    Delete,
}

impl AuditEvent {
    pub fn insert(table: &str, actor: &str, after: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            operation: AuditOp::Insert,
            actor: actor.to_string(),
            before: None,
            after: Some(after),
            timestamp: Utc::now(),
        }
    }

    pub fn update(
        table: &str,
        actor: &str,
        before: serde_json::Value,
        after: serde_json::Value,
    ) -> Self {
        Self {
            table: table.to_string(),
            operation: AuditOp::Update,
            actor: actor.to_string(),
            before: Some(before),
            after: Some(after),
            timestamp: Utc::now(),
        }
    }

    pub fn delete(table: &str, actor: &str, before: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            operation: AuditOp::Delete,
            actor: actor.to_string(),
            before: Some(before),
            after: None,
            timestamp: Utc::now(),
        }
    }
}

/// Where audit events go. Implementations must not block for long and
/// must not panic; the core ignores their failures by construction
/// (emit is infallible).
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Default sink: structured log lines via `tracing`. Downstream log
/// shippers pick these up without the core knowing about them.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        tracing::info!(
            table = %event.table,
            operation = ?event.operation,
            actor = %event.actor,
            event = %serde_json::to_string(&event).unwrap_or_default(),
            "audit_event"
        );
    }
}

/// Test sink: collects events in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
