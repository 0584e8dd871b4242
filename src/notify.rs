//! Post-commit notifications to other connected clients.
//!
//! Fire-and-forget: the coordinator calls a [`Notifier`] only after the
//! transaction committed, and a delivery failure is logged, never surfaced.

use crate::entities::EntityKind;
use crate::upsert::UpsertOutcome;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEvent {
    pub kind: EntityKind,
    pub tenant_id: i64,
    pub branch_id: Option<i64>,
    pub global_id: String,
    pub surrogate_id: i64,
    pub outcome: UpsertOutcome,
    pub origin_terminal_id: String,
    pub at: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no subscribers")]
    NoSubscribers,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: &SyncEvent) -> Result<(), NotifyError>;
}

/// Writes events to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &SyncEvent) -> Result<(), NotifyError> {
        info!(
            kind = %event.kind,
            tenant_id = event.tenant_id,
            branch_id = ?event.branch_id,
            global_id = %event.global_id,
            outcome = ?event.outcome,
            "Sync event"
        );
        Ok(())
    }
}

/// Fans events out to in-process subscribers (e.g. a push channel to
/// dashboards). Slow subscribers drop the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<SyncEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, event: &SyncEvent) -> Result<(), NotifyError> {
        self.tx
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers)
    }
}
