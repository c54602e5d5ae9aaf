use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};

use crate::crypto::{bearer_secret, secret_matches, token_fingerprint};
use crate::dispatcher::{NotificationService, PushSender};
use crate::metrics;
use crate::models::{
    ApiResponse, NotificationRequest, RegisterRequest, SendResponse, SendResults,
    UnregisterRequest,
};
use crate::registry::{TokenRegistry, UpsertOutcome};

const MAX_BODY_BYTES: usize = 64 * 1024;

// API state
pub struct ApiState<R, S> {
    pub notifier: NotificationService<R, S>,
    pub send_secret: Option<String>,
}

// Set up API router
pub fn create_api_router<R, S>(state: Arc<ApiState<R, S>>) -> Router
where
    R: TokenRegistry + Clone + Sync + 'static,
    S: PushSender + Sync + 'static,
{
    Router::new()
        .route("/register", post(register_device::<R, S>))
        .route("/unregister", post(unregister_device::<R, S>))
        .route("/send", post(send_notification::<R, S>))
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(|| async { metrics::metrics_handler() }))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
                .layer(CorsLayer::permissive()),
        )
}

fn reply(status: StatusCode, error: Option<&str>) -> (StatusCode, Json<ApiResponse>) {
    (
        status,
        Json(ApiResponse {
            success: error.is_none(),
            error: error.map(String::from),
        }),
    )
}

// API handlers
async fn register_device<R, S>(
    State(state): State<Arc<ApiState<R, S>>>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> (StatusCode, Json<ApiResponse>)
where
    R: TokenRegistry + Clone + Sync + 'static,
    S: PushSender + Sync + 'static,
{
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::warn!("Rejected registration body: {}", rejection);
            return reply(StatusCode::BAD_REQUEST, Some("invalid request body"));
        }
    };

    if req.device_token.token.trim().is_empty() {
        return reply(StatusCode::BAD_REQUEST, Some("deviceToken.token is required"));
    }
    if req.user_subscription.user_id.trim().is_empty() {
        return reply(StatusCode::BAD_REQUEST, Some("userSubscription.userId is required"));
    }

    let mut subscription = req.user_subscription;
    if subscription.topics.is_empty() {
        subscription.topics = req.topics;
    }

    tracing::info!(
        token = %token_fingerprint(&req.device_token.token),
        user_id = %subscription.user_id,
        user_type = %subscription.user_type,
        "Registering device"
    );

    match state
        .notifier
        .registry()
        .upsert(&req.device_token, &subscription)
        .await
    {
        Ok(outcome) => {
            metrics::REGISTRATIONS.inc();
            let status = match outcome {
                UpsertOutcome::Created => StatusCode::CREATED,
                UpsertOutcome::Refreshed => StatusCode::OK,
            };
            reply(status, None)
        }
        Err(e) => {
            tracing::error!("Error registering device: {}", e);
            reply(StatusCode::INTERNAL_SERVER_ERROR, Some("registry_write_failed"))
        }
    }
}

async fn unregister_device<R, S>(
    State(state): State<Arc<ApiState<R, S>>>,
    payload: Result<Json<UnregisterRequest>, JsonRejection>,
) -> (StatusCode, Json<ApiResponse>)
where
    R: TokenRegistry + Clone + Sync + 'static,
    S: PushSender + Sync + 'static,
{
    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::warn!("Rejected unregister body: {}", rejection);
            return reply(StatusCode::BAD_REQUEST, Some("invalid request body"));
        }
    };

    if req.token.trim().is_empty() || req.user_id.trim().is_empty() {
        return reply(StatusCode::BAD_REQUEST, Some("token and userId are required"));
    }

    match state
        .notifier
        .registry()
        .remove(&req.token, &req.user_id, req.user_type)
        .await
    {
        Ok(removed) => {
            metrics::UNREGISTRATIONS.inc();
            tracing::info!(
                token = %token_fingerprint(&req.token),
                user_id = %req.user_id,
                user_type = %req.user_type,
                removed,
                "Unregistered device"
            );
            reply(StatusCode::OK, None)
        }
        Err(e) => {
            tracing::error!("Error unregistering device: {}", e);
            reply(StatusCode::INTERNAL_SERVER_ERROR, Some("registry_write_failed"))
        }
    }
}

fn send_error(status: StatusCode, error: &str) -> (StatusCode, Json<SendResponse>) {
    (
        status,
        Json(SendResponse {
            success: false,
            results: SendResults::default(),
            error: Some(error.to_string()),
        }),
    )
}

async fn send_notification<R, S>(
    State(state): State<Arc<ApiState<R, S>>>,
    headers: HeaderMap,
    payload: Result<Json<NotificationRequest>, JsonRejection>,
) -> (StatusCode, Json<SendResponse>)
where
    R: TokenRegistry + Clone + Sync + 'static,
    S: PushSender + Sync + 'static,
{
    if let Some(expected) = &state.send_secret {
        let presented = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_secret);
        match presented {
            Some(presented) if secret_matches(presented, expected) => {}
            _ => return send_error(StatusCode::UNAUTHORIZED, "unauthorized"),
        }
    }

    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::warn!("Rejected send body: {}", rejection);
            return send_error(StatusCode::BAD_REQUEST, "invalid request body");
        }
    };

    if req.title.trim().is_empty() {
        return send_error(StatusCode::BAD_REQUEST, "title is required");
    }

    let response = state.notifier.send(&req).await;
    let status = if !response.success && response.results == SendResults::default() {
        // Nothing was attempted: the registry itself failed
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(response))
}
