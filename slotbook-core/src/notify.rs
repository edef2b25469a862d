use async_trait::async_trait;

use slotbook_shared::models::events::NotificationRequest;

#[derive(Debug, thiserror::Error)]
#[error("Notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Notification and calendar collaborators. Best effort, at least once.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: &NotificationRequest) -> Result<(), NotifyError>;
}
