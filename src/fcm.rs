//! Firebase Cloud Messaging (HTTP v1) sender.
//!
//! Messages are sent data-only: title and body travel inside `data`, so the
//! browser never auto-displays them and the delivery filter always gets the
//! final say.

use anyhow::{Context, Result};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::crypto::token_fingerprint;
use crate::dispatcher::{OutboundMessage, PushSender};
use crate::error::SendError;

const MAX_RETRIES: u8 = 3;

#[derive(Serialize)]
struct FcmRequest<'a> {
    message: FcmMessage<'a>,
}

#[derive(Serialize)]
struct FcmMessage<'a> {
    token: &'a str,
    data: HashMap<&'a str, &'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    webpush: Option<WebpushConfig<'a>>,
}

#[derive(Serialize)]
struct WebpushConfig<'a> {
    fcm_options: WebpushFcmOptions<'a>,
}

#[derive(Serialize)]
struct WebpushFcmOptions<'a> {
    link: &'a str,
}

#[derive(Debug, Deserialize)]
struct FcmErrorResponse {
    error: FcmErrorBody,
}

#[derive(Debug, Deserialize)]
struct FcmErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    details: Vec<FcmErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct FcmErrorDetail {
    #[serde(rename = "errorCode", default)]
    error_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    InvalidToken,
    Retryable,
    Fatal,
}

fn classify(status: u16, body: &str) -> (Failure, String) {
    let parsed = serde_json::from_str::<FcmErrorResponse>(body).ok();
    let (message, rpc_status, error_code) = match &parsed {
        Some(resp) => (
            resp.error.message.clone(),
            resp.error.status.as_str(),
            resp.error
                .details
                .iter()
                .find_map(|d| d.error_code.as_deref())
                .unwrap_or(""),
        ),
        None => (body.to_string(), "", ""),
    };

    let failure = match (status, error_code) {
        (_, "UNREGISTERED") | (404, _) => Failure::InvalidToken,
        (400, "INVALID_ARGUMENT") if message.to_lowercase().contains("token") => {
            Failure::InvalidToken
        }
        (429, _) | (500..=599, _) => Failure::Retryable,
        _ if rpc_status == "UNAVAILABLE" || rpc_status == "INTERNAL" => Failure::Retryable,
        _ => Failure::Fatal,
    };

    (failure, format!("HTTP {}: {}", status, message))
}

pub struct FcmClient {
    http_client: HttpClient,
    send_url: String,
    access_token: String,
}

impl FcmClient {
    pub fn new(endpoint: &str, project_id: &str, access_token: &str) -> Result<Self> {
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            send_url: format!(
                "{}/v1/projects/{}/messages:send",
                endpoint.trim_end_matches('/'),
                project_id
            ),
            access_token: access_token.to_string(),
        })
    }

    fn build_request<'a>(token: &'a str, message: &'a OutboundMessage) -> FcmRequest<'a> {
        let mut data: HashMap<&str, &str> = message
            .data
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        data.insert("title", &message.title);
        data.insert("body", &message.body);

        FcmRequest {
            message: FcmMessage {
                token,
                data,
                webpush: message.click_action.as_deref().map(|link| WebpushConfig {
                    fcm_options: WebpushFcmOptions { link },
                }),
            },
        }
    }

    async fn send_once(&self, token: &str, message: &OutboundMessage) -> Result<(), (Failure, String)> {
        let response = self
            .http_client
            .post(&self.send_url)
            .bearer_auth(&self.access_token)
            .json(&Self::build_request(token, message))
            .send()
            .await
            .map_err(|e| (Failure::Retryable, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify(status.as_u16(), &body))
    }
}

impl PushSender for FcmClient {
    async fn send(&self, token: &str, message: &OutboundMessage) -> Result<(), SendError> {
        let mut retry_count = 0;
        let mut backoff_ms = 100;

        loop {
            match self.send_once(token, message).await {
                Ok(()) => {
                    debug!(token = %token_fingerprint(token), "FCM accepted message");
                    return Ok(());
                }
                Err((Failure::InvalidToken, reason)) => {
                    return Err(SendError::InvalidToken(reason));
                }
                Err((Failure::Fatal, reason)) => {
                    return Err(SendError::Rejected(reason));
                }
                Err((Failure::Retryable, reason)) => {
                    retry_count += 1;
                    warn!(
                        token = %token_fingerprint(token),
                        error = %reason,
                        attempt = retry_count,
                        "Failed to send FCM message, retrying"
                    );

                    if retry_count >= MAX_RETRIES {
                        return Err(SendError::Transient(reason));
                    }

                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }
}
