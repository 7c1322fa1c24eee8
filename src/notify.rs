//! Incident notifications.
//!
//! State changes hand events to a [`NotificationDispatcher`], which queues
//! them without waiting. A background task drains the queue into a
//! [`NotificationSink`]. Delivery failures are logged and dropped; they never
//! affect the incident change that produced the event.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::incident::{Incident, IncidentSeverity, IncidentStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IncidentEventKind {
    Created,
    StatusChanged {
        from: IncidentStatus,
        to: IncidentStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncidentEvent {
    #[serde(flatten)]
    pub kind: IncidentEventKind,
    pub incident_id: Uuid,
    pub incident_number: String,
    pub severity: IncidentSeverity,
    pub summary: String,
    pub at: DateTime<Utc>,
}

impl IncidentEvent {
    pub fn created(incident: &Incident) -> Self {
        Self {
            kind: IncidentEventKind::Created,
            incident_id: incident.id,
            incident_number: incident.incident_number.clone(),
            severity: incident.severity,
            summary: incident.title.clone(),
            at: incident.created_at,
        }
    }

    pub fn status_changed(incident: &Incident, from: IncidentStatus) -> Self {
        Self {
            kind: IncidentEventKind::StatusChanged {
                from,
                to: incident.status,
            },
            incident_id: incident.id,
            incident_number: incident.incident_number.clone(),
            severity: incident.severity,
            summary: format!("{}: {} -> {}", incident.title, from, incident.status),
            at: incident.updated_at,
        }
    }
}

/// Outbound delivery of incident events.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, event: &IncidentEvent) -> anyhow::Result<()>;
}

/// Writes events to the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, event: &IncidentEvent) -> anyhow::Result<()> {
        info!(
            incident = %event.incident_number,
            severity = %event.severity,
            event = ?event.kind,
            "{}",
            event.summary
        );
        Ok(())
    }
}

/// Cheap, cloneable handle for queueing events.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    tx: Option<mpsc::UnboundedSender<IncidentEvent>>,
}

impl NotificationDispatcher {
    /// Drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Dispatcher plus the raw receiving end, for callers that drain events
    /// themselves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<IncidentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Start a delivery task feeding `sink`. Must be called inside a runtime.
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> (Self, JoinHandle<()>) {
        let (dispatcher, mut rx) = Self::channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.deliver(&event).await {
                    warn!(
                        incident = %event.incident_number,
                        error = %e,
                        "notification delivery failed"
                    );
                }
            }
        });
        (dispatcher, handle)
    }

    pub fn dispatch(&self, event: IncidentEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(event) {
                warn!(incident = %e.0.incident_number, "notification queue closed, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event() -> IncidentEvent {
        IncidentEvent {
            kind: IncidentEventKind::StatusChanged {
                from: IncidentStatus::Open,
                to: IncidentStatus::Acknowledged,
            },
            incident_id: Uuid::new_v4(),
            incident_number: "INC-000001".into(),
            severity: IncidentSeverity::Sev2,
            summary: "cpu hot".into(),
            at: Utc::now(),
        }
    }

    struct FailingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn deliver(&self, _event: &IncidentEvent) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("pager unreachable")
        }
    }

    #[test]
    fn test_event_serializes_flat() {
        let json = serde_json::to_value(event()).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["from"], "OPEN");
        assert_eq!(json["to"], "ACKNOWLEDGED");
        assert_eq!(json["severity"], "SEV2");
    }

    #[test]
    fn test_disabled_and_closed_dispatchers_do_not_panic() {
        NotificationDispatcher::disabled().dispatch(event());
        let (dispatcher, rx) = NotificationDispatcher::channel();
        drop(rx);
        dispatcher.dispatch(event());
    }

    #[test]
    fn test_log_sink_accepts_events() {
        tokio_test::block_on(async {
            LogSink.deliver(&event()).await.unwrap();
        });
    }

    #[tokio::test]
    async fn test_sink_failures_are_swallowed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (dispatcher, handle) = NotificationDispatcher::spawn(Arc::new(FailingSink(attempts.clone())));
        dispatcher.dispatch(event());
        dispatcher.dispatch(event());
        drop(dispatcher);
        handle.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
