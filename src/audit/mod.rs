//! Best-effort activity trail.
//!
//! Ledger mutations enqueue [`PointsEvent`]s on an [`AuditOutbox`]; a
//! background worker forwards them to an [`ActivityLog`] sink. Nothing here can
//! fail or roll back a committed mutation.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::domain::events::PointsEvent;
use crate::domain::value_objects::{AdminId, Reason, UserId};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("activity sink failed: {0}")]
    Sink(String),
    #[error("audit outbox is closed")]
    Closed,
}

#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn log_points_earned(&self, user_id: &UserId, amount: i64, reason: &Reason) -> Result<(), AuditError>;
    async fn log_points_spent(&self, user_id: &UserId, amount: i64, reason: &Reason) -> Result<(), AuditError>;
    async fn log_admin_change(
        &self,
        user_id: &UserId,
        field: &'static str,
        old_value: i64,
        new_value: i64,
        admin_id: &AdminId,
        reason: &Reason,
    ) -> Result<(), AuditError>;
}

async fn deliver(sink: &dyn ActivityLog, event: &PointsEvent) -> Result<(), AuditError> {
    match event {
        PointsEvent::Earned { user_id, amount, reason } => sink.log_points_earned(user_id, *amount, reason).await,
        PointsEvent::Spent { user_id, amount, reason } => sink.log_points_spent(user_id, *amount, reason).await,
        PointsEvent::AdminChanged { user_id, field, old_value, new_value, admin_id, reason } => {
            sink.log_admin_change(user_id, *field, *old_value, *new_value, admin_id, reason).await
        }
        // Tier moves are derived state; they are logged by the service, not audited.
        PointsEvent::TierChanged { .. } => Ok(()),
    }
}

enum OutboxMessage {
    Event(PointsEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone, Debug)]
pub struct AuditOutbox {
    tx: mpsc::Sender<OutboxMessage>,
}

impl AuditOutbox {
    /// Starts the delivery worker. It exits once every outbox clone is dropped.
    pub fn spawn(sink: Arc<dyn ActivityLog>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    OutboxMessage::Event(event) => {
                        if let Err(e) = deliver(sink.as_ref(), &event).await {
                            tracing::warn!(error = %e, ?event, "dropping activity record");
                        }
                    }
                    OutboxMessage::Flush(done) => { let _ = done.send(()); }
                }
            }
            tracing::debug!("audit outbox drained");
        });
        (Self { tx }, worker)
    }

    /// Never blocks; a full queue drops the record with a warning.
    pub fn enqueue(&self, event: PointsEvent) {
        if let Err(e) = self.tx.try_send(OutboxMessage::Event(event)) {
            let reason = match &e { mpsc::error::TrySendError::Full(_) => "full", mpsc::error::TrySendError::Closed(_) => "closed" };
            tracing::warn!(outbox = reason, "activity record not queued");
        }
    }

    /// Waits until everything queued before this call has been delivered.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (done, wait) = oneshot::channel();
        self.tx.send(OutboxMessage::Flush(done)).await.map_err(|_| AuditError::Closed)?;
        wait.await.map_err(|_| AuditError::Closed)
    }
}

/// Writes the trail to the `loyalty::activity` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

#[async_trait]
impl ActivityLog for TracingActivityLog {
    async fn log_points_earned(&self, user_id: &UserId, amount: i64, reason: &Reason) -> Result<(), AuditError> {
        tracing::info!(target: "loyalty::activity", %user_id, amount, %reason, "points earned");
        Ok(())
    }

    async fn log_points_spent(&self, user_id: &UserId, amount: i64, reason: &Reason) -> Result<(), AuditError> {
        tracing::info!(target: "loyalty::activity", %user_id, amount, %reason, "points spent");
        Ok(())
    }

    async fn log_admin_change(&self, user_id: &UserId, field: &'static str, old_value: i64, new_value: i64, admin_id: &AdminId, reason: &Reason) -> Result<(), AuditError> {
        tracing::info!(target: "loyalty::activity", %user_id, field, old_value, new_value, %admin_id, %reason, "admin changed {field} from {old_value} to {new_value}");
        Ok(())
    }
}

/// Publishes each record as JSON on `loyalty.activity.<kind>`.
#[derive(Clone, Debug)]
pub struct NatsActivityLog {
    client: async_nats::Client,
}

impl NatsActivityLog {
    pub fn new(client: async_nats::Client) -> Self { Self { client } }

    async fn publish(&self, kind: &str, event: &PointsEvent) -> Result<(), AuditError> {
        let payload = serde_json::to_vec(event).map_err(|e| AuditError::Sink(e.to_string()))?;
        self.client
            .publish(format!("loyalty.activity.{kind}"), payload.into())
            .await
            .map_err(|e| AuditError::Sink(e.to_string()))
    }
}

#[async_trait]
impl ActivityLog for NatsActivityLog {
    async fn log_points_earned(&self, user_id: &UserId, amount: i64, reason: &Reason) -> Result<(), AuditError> {
        self.publish("earned", &PointsEvent::Earned { user_id: user_id.clone(), amount, reason: reason.clone() }).await
    }

    async fn log_points_spent(&self, user_id: &UserId, amount: i64, reason: &Reason) -> Result<(), AuditError> {
        self.publish("spent", &PointsEvent::Spent { user_id: user_id.clone(), amount, reason: reason.clone() }).await
    }

    async fn log_admin_change(&self, user_id: &UserId, field: &'static str, old_value: i64, new_value: i64, admin_id: &AdminId, reason: &Reason) -> Result<(), AuditError> {
        let event = PointsEvent::AdminChanged {
            user_id: user_id.clone(), field, old_value, new_value, admin_id: admin_id.clone(), reason: reason.clone(),
        };
        self.publish("admin_change", &event).await
    }
}

/// Keeps every record in memory; handy in tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryActivityLog {
    records: Mutex<Vec<PointsEvent>>,
}

impl MemoryActivityLog {
    pub fn new() -> Self { Self::default() }

    pub fn records(&self) -> Vec<PointsEvent> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push(&self, event: PointsEvent) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

#[async_trait]
impl ActivityLog for MemoryActivityLog {
    async fn log_points_earned(&self, user_id: &UserId, amount: i64, reason: &Reason) -> Result<(), AuditError> {
        self.push(PointsEvent::Earned { user_id: user_id.clone(), amount, reason: reason.clone() });
        Ok(())
    }

    async fn log_points_spent(&self, user_id: &UserId, amount: i64, reason: &Reason) -> Result<(), AuditError> {
        self.push(PointsEvent::Spent { user_id: user_id.clone(), amount, reason: reason.clone() });
        Ok(())
    }

    async fn log_admin_change(&self, user_id: &UserId, field: &'static str, old_value: i64, new_value: i64, admin_id: &AdminId, reason: &Reason) -> Result<(), AuditError> {
        self.push(PointsEvent::AdminChanged {
            user_id: user_id.clone(), field, old_value, new_value, admin_id: admin_id.clone(), reason: reason.clone(),
        });
        Ok(())
    }
}
