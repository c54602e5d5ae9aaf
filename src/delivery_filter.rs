//! Client-side delivery filter.
//!
//! Server-side targeting can be stale by the time a push lands: a token is
//! shared by every role logged in on the browser, and logouts race in-flight
//! messages. Before anything is shown, the payload target is re-checked
//! against the users this browser currently has registered.
//!
//! Decision rule, first match wins:
//! 1. no target in the payload: show (broadcast)
//! 2. no users known locally, or the registry did not answer: show (fail-open)
//! 3. `userId` present: show iff that user is registered here under any role
//! 4. only `userType` present: show iff some registered user has that role

use moka::future::Cache;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::models::{DeviceToken, InboundPush, NotificationData, UserSubscription, UserType};
use crate::registry::MemoryRegistry;

const DEFAULT_TITLE: &str = "Sniket";

/// What this browser knows about its registered users at decision time.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryView {
    Known(Vec<UserSubscription>),
    /// The registry did not answer in time.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowReason {
    Broadcast,
    RegistryEmpty,
    RegistryUnknown,
    TargetActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Show(ShowReason),
    Suppress,
}

pub fn evaluate(data: &NotificationData, view: &RegistryView) -> Decision {
    if !data.has_target() {
        return Decision::Show(ShowReason::Broadcast);
    }

    let active = match view {
        RegistryView::Unknown => return Decision::Show(ShowReason::RegistryUnknown),
        RegistryView::Known(active) if active.is_empty() => {
            return Decision::Show(ShowReason::RegistryEmpty)
        }
        RegistryView::Known(active) => active,
    };

    let matched = match data.user_id.as_deref().filter(|id| !id.is_empty()) {
        Some(user_id) => active.iter().any(|s| s.user_id == user_id),
        None => match data.user_type.as_deref().map(str::parse::<UserType>) {
            Some(Ok(user_type)) => active.iter().any(|s| s.user_type == user_type),
            // A role nobody here can hold
            _ => false,
        },
    };

    if matched {
        Decision::Show(ShowReason::TargetActive)
    } else {
        Decision::Suppress
    }
}

/// How an inbound push ended up being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    SystemNotification,
    Toast,
    Suppressed,
    /// Already presented by the other delivery path.
    Duplicate,
}

/// A notification ready to be rendered, either as a system notification or a toast.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentedNotification {
    pub message_id: String,
    pub title: String,
    pub body: String,
    pub kind: Option<String>,
    pub click_action: Option<String>,
    pub data: HashMap<String, String>,
}

impl PresentedNotification {
    fn from_push(push: &InboundPush) -> Self {
        Self {
            message_id: push.message_id.clone(),
            title: push
                .title
                .clone()
                .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            body: push.body.clone().unwrap_or_default(),
            kind: push.data.kind.clone(),
            click_action: push.data.click_action.clone(),
            data: push.data.extra.clone(),
        }
    }
}

/// Message ids already presented in this browser, shared by the foreground
/// and background paths so one event never alerts twice.
#[derive(Clone)]
pub struct DeliveryLedger {
    presented: Cache<String, ()>,
}

impl Default for DeliveryLedger {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl DeliveryLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            presented: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    /// True the first time a message id is claimed.
    pub async fn claim(&self, message_id: &str) -> bool {
        if message_id.is_empty() {
            return true;
        }
        self.presented
            .entry(message_id.to_string())
            .or_insert(())
            .await
            .is_fresh()
    }
}

pub(crate) enum Admission {
    Present(PresentedNotification),
    Skip(Presentation),
}

/// Applies the decision rule and the duplicate check shared by both delivery paths.
pub(crate) async fn admit(
    push: &InboundPush,
    registry: &RegistryHandle,
    ledger: &DeliveryLedger,
) -> Admission {
    let view = registry.active_users().await;
    let decision = evaluate(&push.data, &view);

    match decision {
        Decision::Suppress => {
            metrics::FILTER_DECISIONS.with_label_values(&["suppressed"]).inc();
            debug!(
                message_id = %push.message_id,
                user_id = ?push.data.user_id,
                user_type = ?push.data.user_type,
                "Suppressed notification for a user not active here"
            );
            Admission::Skip(Presentation::Suppressed)
        }
        Decision::Show(reason) => {
            metrics::FILTER_DECISIONS.with_label_values(&["shown"]).inc();
            if !ledger.claim(&push.message_id).await {
                debug!(message_id = %push.message_id, "Notification already presented");
                return Admission::Skip(Presentation::Duplicate);
            }
            debug!(message_id = %push.message_id, reason = ?reason, "Showing notification");
            Admission::Present(PresentedNotification::from_push(push))
        }
    }
}

pub enum RegistryCommand {
    /// Replace what is known about a token with the given subscriptions.
    Sync {
        device: DeviceToken,
        subscriptions: Vec<UserSubscription>,
    },
    Query {
        reply: oneshot::Sender<Vec<UserSubscription>>,
    },
}

/// Open-tab side of the channel into the background context's registry.
#[derive(Clone)]
pub struct RegistryHandle {
    commands: mpsc::Sender<RegistryCommand>,
    timeout: Duration,
}

impl RegistryHandle {
    pub fn new(commands: mpsc::Sender<RegistryCommand>, timeout: Duration) -> Self {
        Self { commands, timeout }
    }

    pub async fn sync(&self, device: DeviceToken, subscriptions: Vec<UserSubscription>) {
        let command = RegistryCommand::Sync {
            device,
            subscriptions,
        };
        if self.commands.send(command).await.is_err() {
            debug!("Background context is gone; registry update dropped");
        }
    }

    /// Times out to `Unknown`, which the filter treats as fail-open.
    pub async fn active_users(&self) -> RegistryView {
        let (reply, response) = oneshot::channel();
        let exchange = async {
            self.commands
                .send(RegistryCommand::Query { reply })
                .await
                .ok()?;
            response.await.ok()
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Some(subscriptions)) => RegistryView::Known(subscriptions),
            Ok(None) => {
                debug!("Background registry unavailable");
                RegistryView::Unknown
            }
            Err(_) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "Background registry query timed out");
                RegistryView::Unknown
            }
        }
    }
}

pub async fn run_registry_worker(
    registry: MemoryRegistry,
    mut commands: mpsc::Receiver<RegistryCommand>,
) {
    debug!("Starting background registry");

    while let Some(command) = commands.recv().await {
        match command {
            RegistryCommand::Sync {
                device,
                subscriptions,
            } => {
                if let Err(e) = registry.replace_token(&device, &subscriptions) {
                    warn!(error = %e, "Failed to apply registry update");
                }
            }
            RegistryCommand::Query { reply } => {
                let subscriptions = registry.subscriptions().unwrap_or_else(|e| {
                    warn!(error = %e, "Failed to read background registry");
                    Vec::new()
                });
                let _ = reply.send(subscriptions);
            }
        }
    }

    debug!("Background registry stopped");
}

pub fn spawn_registry_worker(
    registry: MemoryRegistry,
    timeout: Duration,
) -> (RegistryHandle, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(64);
    let handle = tokio::spawn(run_registry_worker(registry, receiver));
    (RegistryHandle::new(sender, timeout), handle)
}

/// Renders OS-level notifications from the background context.
pub trait SystemNotifier: Send + Sync {
    fn show(&self, notification: &PresentedNotification);
}

/// The background (service-worker) delivery path, active with or without an open tab.
pub struct BackgroundContext<N> {
    registry: RegistryHandle,
    ledger: DeliveryLedger,
    notifier: N,
}

impl<N: SystemNotifier> BackgroundContext<N> {
    pub fn new(registry: RegistryHandle, ledger: DeliveryLedger, notifier: N) -> Self {
        Self {
            registry,
            ledger,
            notifier,
        }
    }

    pub async fn on_push(&self, push: &InboundPush) -> Presentation {
        match admit(push, &self.registry, &self.ledger).await {
            Admission::Present(notification) => {
                self.notifier.show(&notification);
                Presentation::SystemNotification
            }
            Admission::Skip(presentation) => presentation,
        }
    }
}

pub async fn run_background_context<N: SystemNotifier>(
    context: BackgroundContext<N>,
    mut pushes: mpsc::Receiver<InboundPush>,
) {
    info!("Starting background delivery context");

    while let Some(push) = pushes.recv().await {
        let presentation = context.on_push(&push).await;
        debug!(message_id = %push.message_id, presentation = ?presentation, "Handled background push");
    }

    info!("Background delivery context stopped");
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct RecordingNotifier {
        pub shown: Arc<Mutex<Vec<PresentedNotification>>>,
    }

    impl RecordingNotifier {
        pub fn count(&self) -> usize {
            self.shown.lock().unwrap().len()
        }
    }

    impl SystemNotifier for RecordingNotifier {
        fn show(&self, notification: &PresentedNotification) {
            self.shown.lock().unwrap().push(notification.clone());
        }
    }

    pub fn push(message_id: &str, user_id: Option<&str>, user_type: Option<&str>) -> InboundPush {
        InboundPush {
            message_id: message_id.to_string(),
            title: Some("Booking update".to_string()),
            body: Some("Your technician is on the way".to_string()),
            data: NotificationData {
                user_id: user_id.map(String::from),
                user_type: user_type.map(String::from),
                ..NotificationData::default()
            },
        }
    }

    /// A handle whose worker never answers.
    pub fn silent_handle(timeout: Duration) -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (sender, receiver) = mpsc::channel(8);
        (RegistryHandle::new(sender, timeout), receiver)
    }
}
