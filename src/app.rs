use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::catalog::BadgeCatalog;
use crate::certificates::CertificateRegistry;
use crate::config::Config;
use crate::error::ProgressResult;
use crate::ledger::AchievementLedger;
use crate::notify::{LogNotifier, NotificationQueue, Notifier, WebhookNotifier};
use crate::orchestrator::CompletionOrchestrator;
use crate::store::ProgressStore;
use crate::tracker::EnrollmentTracker;

pub type AppState = Arc<CompletionOrchestrator>;

pub fn notifier_from(config: &Config) -> Arc<dyn Notifier> {
    match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    }
}

/// Wires every component over one backend. The badge catalog is read once
/// here; must run inside a tokio runtime (the notification worker is spawned).
pub async fn build<S>(
    store: Arc<S>,
    config: &Config,
    notifier: Arc<dyn Notifier>,
) -> ProgressResult<(AppState, JoinHandle<()>)>
where
    S: ProgressStore + 'static,
{
    let catalog = Arc::new(BadgeCatalog::new(store.list_badges().await?)?);
    if catalog.is_empty() {
        tracing::warn!("badge catalog is empty, no badges will be issued");
    }

    let ledger = Arc::new(AchievementLedger::new(catalog, store.clone()));
    let certificates =
        CertificateRegistry::new(store.clone(), ledger.clone(), config.serial_max_attempts);
    let tracker = EnrollmentTracker::new(store.clone(), store.clone(), config.toggle_max_retries);
    let (notifications, worker) =
        NotificationQueue::spawn(notifier, config.notify_queue_capacity);

    let orchestrator =
        CompletionOrchestrator::new(tracker, store, ledger, certificates, notifications);
    Ok((Arc::new(orchestrator), worker))
}
