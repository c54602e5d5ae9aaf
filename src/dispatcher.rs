use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::crypto::token_fingerprint;
use crate::error::SendError;
use crate::metrics;
use crate::models::{NotificationRequest, SendResponse, SendResults};
use crate::registry::TokenRegistry;
use crate::resolver::TargetingResolver;

/// What actually goes to the push provider for each token.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub title: String,
    pub body: String,
    pub data: HashMap<String, String>,
    pub click_action: Option<String>,
}

impl OutboundMessage {
    /// Flattens request data to strings and stamps the target fields into it
    /// so receiving browsers can re-check who the message is for.
    pub fn from_request(request: &NotificationRequest) -> Self {
        let mut data: HashMap<String, String> = request
            .data
            .iter()
            .flatten()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect();

        match &request.target_user_id {
            Some(user_id) if !user_id.is_empty() => {
                data.insert("userId".to_string(), user_id.clone());
            }
            _ => {
                data.remove("userId");
            }
        }
        match request.target_user_type {
            Some(user_type) => {
                data.insert("userType".to_string(), user_type.to_string());
            }
            None => {
                data.remove("userType");
            }
        }
        if let Some(click_action) = &request.click_action {
            data.insert("clickAction".to_string(), click_action.clone());
        }

        Self {
            title: request.title.clone(),
            body: request.body.clone(),
            data,
            click_action: request.click_action.clone(),
        }
    }
}

#[trait_variant::make(Send)]
pub trait PushSender {
    async fn send(&self, token: &str, message: &OutboundMessage) -> Result<(), SendError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub success_count: usize,
    pub failure_count: usize,
    pub invalid_tokens: Vec<String>,
}

impl DispatchSummary {
    /// Partial failure still counts as delivered.
    pub fn is_success(&self) -> bool {
        self.failure_count == 0 || self.success_count > 0
    }
}

pub struct Dispatcher<R, S> {
    registry: R,
    sender: S,
    concurrency: usize,
}

impl<R, S> Dispatcher<R, S>
where
    R: TokenRegistry + Sync,
    S: PushSender + Sync,
{
    pub fn new(registry: R, sender: S, concurrency: usize) -> Self {
        Self {
            registry,
            sender,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn dispatch(&self, tokens: &[String], message: &OutboundMessage) -> DispatchSummary {
        let results: Vec<(String, Result<(), SendError>)> = stream::iter(tokens.iter().cloned())
            .map(|token| async move {
                let result = self.sender.send(&token, message).await;
                (token, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut summary = DispatchSummary::default();
        for (token, result) in results {
            match result {
                Ok(()) => summary.success_count += 1,
                Err(e) => {
                    summary.failure_count += 1;
                    warn!(
                        token = %token_fingerprint(&token),
                        code = e.code(),
                        error = %e,
                        "Delivery failed"
                    );
                    if let SendError::InvalidToken(_) = e {
                        summary.invalid_tokens.push(token);
                    }
                }
            }
        }

        metrics::NOTIFICATIONS_SENT.inc_by(summary.success_count as f64);
        metrics::NOTIFICATIONS_FAILED.inc_by(summary.failure_count as f64);

        self.cleanup_invalid_tokens(&summary.invalid_tokens).await;
        summary
    }

    async fn cleanup_invalid_tokens(&self, tokens: &[String]) {
        for token in tokens {
            match self.registry.remove_token(token).await {
                Ok(_) => {
                    metrics::INVALID_TOKENS_REMOVED.inc();
                    info!(token = %token_fingerprint(token), "Removed invalid token");
                }
                Err(e) => {
                    error!(
                        token = %token_fingerprint(token),
                        "Failed to remove invalid token: {}",
                        e
                    );
                }
            }
        }
    }
}

/// Resolve-then-dispatch, as used by `POST /send`.
pub struct NotificationService<R, S> {
    resolver: TargetingResolver<R>,
    dispatcher: Dispatcher<R, S>,
}

impl<R, S> NotificationService<R, S>
where
    R: TokenRegistry + Clone + Sync,
    S: PushSender + Sync,
{
    pub fn new(
        registry: R,
        sender: S,
        subscription_ttl: time::Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            resolver: TargetingResolver::new(registry.clone(), subscription_ttl),
            dispatcher: Dispatcher::new(registry, sender, concurrency),
        }
    }

    pub fn registry(&self) -> &R {
        self.resolver.registry()
    }

    /// Never errors: failures come back inside the response.
    pub async fn send(&self, request: &NotificationRequest) -> SendResponse {
        let timer = Instant::now();
        let target = request.target();

        let tokens = match self.resolver.resolve(&target).await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!(target = ?target, "Failed to resolve notification target: {}", e);
                return SendResponse {
                    success: false,
                    results: SendResults::default(),
                    error: Some("registry unavailable".to_string()),
                };
            }
        };

        if tokens.is_empty() {
            info!(target = ?target, "No devices to notify");
            return SendResponse {
                success: true,
                results: SendResults::default(),
                error: None,
            };
        }

        let message = OutboundMessage::from_request(request);
        let summary = self.dispatcher.dispatch(&tokens, &message).await;
        metrics::DISPATCH_TIME.observe(timer.elapsed().as_secs_f64());

        info!(
            target = ?target,
            success_count = summary.success_count,
            failure_count = summary.failure_count,
            invalid_tokens = summary.invalid_tokens.len(),
            "Notification dispatched"
        );

        let success = summary.is_success();
        SendResponse {
            success,
            results: SendResults {
                success_count: summary.success_count,
                failure_count: summary.failure_count,
            },
            error: (!success).then(|| "all deliveries failed".to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Records every send; tokens listed as invalid or failing are rejected.
    #[derive(Clone, Default)]
    pub struct RecordingSender {
        pub sent: Arc<Mutex<Vec<(String, OutboundMessage)>>>,
        pub invalid: HashSet<String>,
        pub failing: HashSet<String>,
    }

    impl RecordingSender {
        pub fn with_invalid(tokens: &[&str]) -> Self {
            Self {
                invalid: tokens.iter().map(|t| t.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn with_failing(tokens: &[&str]) -> Self {
            Self {
                failing: tokens.iter().map(|t| t.to_string()).collect(),
                ..Self::default()
            }
        }

        pub fn sent_tokens(&self) -> Vec<String> {
            let mut tokens: Vec<String> = self
                .sent
                .lock()
                .unwrap()
                .iter()
                .map(|(t, _)| t.clone())
                .collect();
            tokens.sort();
            tokens
        }
    }

    impl PushSender for RecordingSender {
        async fn send(&self, token: &str, message: &OutboundMessage) -> Result<(), SendError> {
            if self.invalid.contains(token) {
                return Err(SendError::InvalidToken("UNREGISTERED".to_string()));
            }
            if self.failing.contains(token) {
                return Err(SendError::Transient("HTTP 503".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((token.to_string(), message.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSender;
    use super::*;
    use crate::models::UserType;
    use crate::registry::test_support::*;
    use crate::registry::MemoryRegistry;

    fn request(user_id: Option<&str>, user_type: Option<UserType>) -> NotificationRequest {
        NotificationRequest {
            target_user_id: user_id.map(String::from),
            target_user_type: user_type,
            title: "Booking update".to_string(),
            body: "Your repair is ready".to_string(),
            data: None,
            click_action: None,
        }
    }

    async fn registry_with(tokens: &[(&str, &str, UserType)]) -> MemoryRegistry {
        let registry = MemoryRegistry::new();
        for (token, user_id, user_type) in tokens {
            registry
                .upsert(&device(token), &subscription(user_id, *user_type))
                .await
                .unwrap();
        }
        registry
    }

    fn service(
        registry: MemoryRegistry,
        sender: RecordingSender,
    ) -> NotificationService<MemoryRegistry, RecordingSender> {
        NotificationService::new(registry, sender, time::Duration::days(30), 4)
    }

    #[test]
    fn test_outbound_message_stamps_target() {
        let mut req = request(Some("u1"), Some(UserType::Customer));
        req.click_action = Some("/bookings/42".to_string());
        req.data = Some(
            serde_json::json!({ "bookingId": 42, "type": "booking_update", "userId": "spoofed" })
                .as_object()
                .cloned()
                .unwrap(),
        );

        let message = OutboundMessage::from_request(&req);
        assert_eq!(message.data["userId"], "u1");
        assert_eq!(message.data["userType"], "customer");
        assert_eq!(message.data["bookingId"], "42");
        assert_eq!(message.data["type"], "booking_update");
        assert_eq!(message.data["clickAction"], "/bookings/42");

        // Broadcasts carry no target at all
        let message = OutboundMessage::from_request(&request(None, None));
        assert!(!message.data.contains_key("userId"));
        assert!(!message.data.contains_key("userType"));
    }

    #[tokio::test]
    async fn test_send_with_no_recipients_succeeds() {
        let service = service(MemoryRegistry::new(), RecordingSender::default());
        let response = service.send(&request(Some("nobody"), None)).await;

        assert!(response.success);
        assert_eq!(response.results, SendResults::default());
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_invalid_tokens_are_cleaned_up() {
        let registry = registry_with(&[
            ("tok1", "u1", UserType::Customer),
            ("tok_dead", "u1", UserType::Customer),
        ])
        .await;
        let sender = RecordingSender::with_invalid(&["tok_dead"]);
        let service = service(registry.clone(), sender.clone());

        let response = service.send(&request(Some("u1"), None)).await;

        assert!(response.success);
        assert_eq!(response.results.success_count, 1);
        assert_eq!(response.results.failure_count, 1);
        assert_eq!(sender.sent_tokens(), vec!["tok1".to_string()]);
        assert_eq!(registry.all_tokens().await.unwrap(), vec!["tok1".to_string()]);
    }

    #[tokio::test]
    async fn test_total_failure_is_reported_not_thrown() {
        let registry = registry_with(&[("tok1", "u1", UserType::Provider)]).await;
        let service = service(registry.clone(), RecordingSender::with_failing(&["tok1"]));

        let response = service.send(&request(None, Some(UserType::Provider))).await;

        assert!(!response.success);
        assert_eq!(response.results.failure_count, 1);
        assert!(response.error.is_some());
        // Transient failures do not remove the token
        assert_eq!(registry.all_tokens().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shared_token_is_contacted_once() {
        let registry = registry_with(&[
            ("tok1", "u_cust", UserType::Customer),
            ("tok1", "u_prov", UserType::Provider),
        ])
        .await;
        let sender = RecordingSender::default();
        let service = service(registry, sender.clone());

        let response = service.send(&request(None, None)).await;

        assert!(response.success);
        assert_eq!(response.results.success_count, 1);
        assert_eq!(sender.sent_tokens(), vec!["tok1".to_string()]);
    }
}
