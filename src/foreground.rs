use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::delivery_filter::{
    admit, Admission, DeliveryLedger, Presentation, PresentedNotification, RegistryHandle,
};
use crate::models::InboundPush;

/// In-app rendering surface for messages that arrive while a tab is focused.
pub trait ToastSink: Send + Sync {
    fn toast(&self, notification: &PresentedNotification);
}

/// Handles pushes in a focused tab. Applies the same rule as the background
/// context and renders a toast instead of a system notification.
pub struct ForegroundListener<T> {
    registry: RegistryHandle,
    ledger: DeliveryLedger,
    sink: T,
}

impl<T: ToastSink> ForegroundListener<T> {
    pub fn new(registry: RegistryHandle, ledger: DeliveryLedger, sink: T) -> Self {
        Self {
            registry,
            ledger,
            sink,
        }
    }

    pub async fn on_message(&self, push: &InboundPush) -> Presentation {
        match admit(push, &self.registry, &self.ledger).await {
            Admission::Present(notification) => {
                self.sink.toast(&notification);
                Presentation::Toast
            }
            Admission::Skip(presentation) => presentation,
        }
    }
}

/// Sends a push to the focused tab when there is one, otherwise to the
/// background context. Returns the foreground outcome, or None when the
/// push was handed to the background.
pub async fn route_inbound<T: ToastSink>(
    push: InboundPush,
    focused: Option<&ForegroundListener<T>>,
    background: &mpsc::Sender<InboundPush>,
) -> Option<Presentation> {
    if let Some(listener) = focused {
        let presentation = listener.on_message(&push).await;
        debug!(message_id = %push.message_id, presentation = ?presentation, "Handled foreground push");
        return Some(presentation);
    }

    if let Err(e) = background.send(push).await {
        warn!(message_id = %e.0.message_id, "Background context unavailable; push dropped");
    }
    None
}
