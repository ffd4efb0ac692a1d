use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Debug;
use tracing::info;

/// A credential was handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub identity: Option<String>,
    pub credential: String,
    pub timestamp: DateTime<Utc>,
}

/// Receives issuance events. `record` must return immediately; any I/O
/// belongs on a spawned task and its failures stay inside the sink.
pub trait AuditSink: Send + Sync + Debug {
    fn record(&self, event: AuditEvent);
}

/// Writes issuance events to the tracing log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) {
        info!(
            identity = event.identity.as_deref().unwrap_or("-"),
            credential = %event.credential,
            timestamp = %event.timestamp.to_rfc3339(),
            "Key issued"
        );
    }
}
