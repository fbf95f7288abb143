//! Best-effort notification fan-out.
//!
//! Producers push onto a bounded queue and never wait: a full or closed queue
//! drops the message with a warning. A background worker drains the queue
//! into a [`Notifier`]; delivery failures are logged and forgotten.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelatedEntity {
    pub kind: String,
    pub id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient_id: String,
    pub message: String,
    pub severity: Severity,
    pub related_entity: Option<RelatedEntity>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            recipient = %n.recipient_id,
            severity = ?n.severity,
            related = ?n.related_entity,
            "{}",
            n.message
        );
        Ok(())
    }
}

/// POSTs each notification as JSON to the notification service.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &Notification) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(n)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    /// Queue plus the receiving end, for callers that drive the worker themselves.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue with a worker already spawned on the current runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (queue, rx) = Self::channel(capacity);
        let handle = tokio::spawn(run_worker(rx, notifier));
        (queue, handle)
    }

    /// Returns `false` when the message was dropped.
    pub fn enqueue(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                tracing::warn!(recipient = %n.recipient_id, "notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                tracing::warn!(recipient = %n.recipient_id, "notification worker gone, dropping");
                false
            }
        }
    }
}

pub async fn run_worker(mut rx: mpsc::Receiver<Notification>, notifier: Arc<dyn Notifier>) {
    while let Some(notification) = rx.recv().await {
        if let Err(e) = notifier.notify(&notification).await {
            tracing::warn!(
                error = %e,
                recipient = %notification.recipient_id,
                "notification not delivered"
            );
        }
    }
    tracing::debug!("notification worker stopped");
}
