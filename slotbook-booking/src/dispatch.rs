use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use slotbook_core::notify::Notifier;
use slotbook_shared::models::events::NotificationRequest;

/// Fire-and-forget submission of notification/calendar requests.
///
/// `dispatch` never blocks and never fails the caller; delivery happens on the
/// task running [`run_dispatch_loop`], after booking state is committed.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<NotificationRequest>,
}

impl NotificationDispatcher {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn dispatch(&self, request: NotificationRequest) {
        let kind = request.event_type;
        let reservation_id = request.reservation_id;
        if self.tx.send(request).is_err() {
            warn!(
                reservation_id = %reservation_id,
                event_type = kind.as_str(),
                "Notification dropped: dispatcher is shut down"
            );
        }
    }
}

pub async fn run_dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<NotificationRequest>,
    notifier: Arc<dyn Notifier>,
) {
    info!("Notification dispatcher started");
    while let Some(request) = rx.recv().await {
        match notifier.notify(&request).await {
            Ok(()) => info!(
                notification_id = %request.notification_id,
                event_type = request.event_type.as_str(),
                "Notification delivered"
            ),
            Err(e) => error!(
                notification_id = %request.notification_id,
                event_type = request.event_type.as_str(),
                "Notification failed: {}",
                e
            ),
        }
    }
    info!("Notification dispatcher stopped");
}
