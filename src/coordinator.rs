//! Browser-side registration flow: permission, token, local registry, server mirror.

use anyhow::Context;
use reqwest::Client as HttpClient;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::crypto::token_fingerprint;
use crate::delivery_filter::{spawn_registry_worker, DeliveryLedger, RegistryHandle};
use crate::error::{MirrorError, NotificationStatus, ProviderError, RegistrationError, RegistryError};
use crate::models::{
    ApiResponse, DeviceToken, RegisterRequest, UnregisterRequest, UserSubscription, UserType,
};
use crate::registry::{LocalRegistry, TokenRegistry, UpsertOutcome};

/// Browser notification permission as the platform reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    /// Not decided yet; asking is allowed.
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Granted,
    Denied,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub platform: String,
    pub browser: String,
    pub user_agent: String,
}

/// The push SDK surface the coordinator relies on.
#[trait_variant::make(Send)]
pub trait PushProvider {
    fn is_supported(&self) -> bool;

    fn permission(&self) -> PermissionState;

    async fn request_permission(&self) -> PermissionState;

    /// May return a different value than last time if the provider rotated it.
    async fn get_token(&self) -> Result<String, ProviderError>;

    /// Invalidates the current token with the provider.
    async fn delete_token(&self) -> Result<(), ProviderError>;

    fn device_info(&self) -> DeviceInfo;
}

/// Server-side copy of this browser's registrations, used for send-time targeting.
#[trait_variant::make(Send)]
pub trait RegistrationMirror {
    async fn register(&self, request: &RegisterRequest) -> Result<(), MirrorError>;

    async fn unregister(&self, request: &UnregisterRequest) -> Result<(), MirrorError>;
}

/// Talks to the `/register` and `/unregister` endpoints.
pub struct HttpMirror {
    http_client: HttpClient,
    base_url: String,
}

impl HttpMirror {
    pub fn new(base_url: &str) -> Result<Self, MirrorError> {
        Ok(Self {
            http_client: HttpClient::builder()
                .timeout(Duration::from_secs(10))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<T: serde::Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), MirrorError> {
        let response = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let parsed = response.json::<ApiResponse>().await.ok();
        match parsed {
            Some(ApiResponse { success: true, .. }) if status.is_success() => Ok(()),
            other => Err(MirrorError::Rejected {
                status: status.as_u16(),
                message: other
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "unexpected response".to_string()),
            }),
        }
    }
}

impl RegistrationMirror for HttpMirror {
    async fn register(&self, request: &RegisterRequest) -> Result<(), MirrorError> {
        self.post("/register", request).await
    }

    async fn unregister(&self, request: &UnregisterRequest) -> Result<(), MirrorError> {
        self.post("/unregister", request).await
    }
}

impl<M: RegistrationMirror + Sync> RegistrationMirror for Option<M> {
    async fn register(&self, request: &RegisterRequest) -> Result<(), MirrorError> {
        match self {
            Some(mirror) => mirror.register(request).await,
            None => Ok(()),
        }
    }

    async fn unregister(&self, request: &UnregisterRequest) -> Result<(), MirrorError> {
        match self {
            Some(mirror) => mirror.unregister(request).await,
            None => Ok(()),
        }
    }
}

/// A browser session wired from [`ClientConfig`]: the coordinator plus the
/// pieces the foreground and background delivery contexts share.
pub struct ClientSession<P> {
    pub coordinator: Coordinator<LocalRegistry, P, Option<HttpMirror>>,
    pub registry: RegistryHandle,
    pub ledger: DeliveryLedger,
    pub worker: JoinHandle<()>,
}

/// Opens the local registry, seeds the background registry worker from it and
/// builds the coordinator. The server mirror is only used when a registration
/// URL is configured.
pub async fn open_client_session<P>(config: &ClientConfig, provider: P) -> anyhow::Result<ClientSession<P>>
where
    P: PushProvider + Sync,
{
    let local = LocalRegistry::open(&config.registry_dir)
        .await
        .with_context(|| format!("Failed to open local registry in {}", config.registry_dir.display()))?;
    let seed = local.snapshot()?;

    let mirror = match &config.registration_url {
        Some(url) => Some(HttpMirror::new(url).context("Failed to create registration client")?),
        None => {
            info!("No registration URL configured; registrations stay local");
            None
        }
    };

    let (registry, worker) = spawn_registry_worker(seed, config.registry_query_timeout);
    let coordinator = Coordinator::new(local, provider, mirror)
        .with_background(registry.clone())
        .with_topics(config.topics.clone());

    Ok(ClientSession {
        coordinator,
        registry,
        ledger: DeliveryLedger::default(),
        worker,
    })
}

/// Where one (user, role) pair is in the registration flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    PermissionPending,
    PermissionDenied,
    TokenPending,
    Registered,
}

#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistrationReceipt {
    pub token: String,
    pub subscription: UserSubscription,
    pub outcome: UpsertOutcome,
}

pub struct Coordinator<R, P, M> {
    registry: R,
    provider: P,
    mirror: M,
    background: Option<RegistryHandle>,
    topics: Vec<String>,
    states: Mutex<HashMap<(String, UserType), RegistrationState>>,
}

impl<R, P, M> Coordinator<R, P, M>
where
    R: TokenRegistry + Sync,
    P: PushProvider + Sync,
    M: RegistrationMirror + Sync,
{
    pub fn new(registry: R, provider: P, mirror: M) -> Self {
        Self {
            registry,
            provider,
            mirror,
            background: None,
            topics: Vec::new(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Registry updates are pushed to the background context through `handle`.
    pub fn with_background(mut self, handle: RegistryHandle) -> Self {
        self.background = Some(handle);
        self
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn state(&self, user_id: &str, user_type: UserType) -> RegistrationState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&(user_id.to_string(), user_type)).copied())
            .unwrap_or(RegistrationState::Unregistered)
    }

    /// What the UI should show for `(user_id, user_type)` right now.
    pub fn status(&self, user_id: &str, user_type: UserType) -> NotificationStatus {
        if !self.provider.is_supported() {
            return NotificationStatus::Unsupported;
        }
        if self.provider.permission() == PermissionState::Denied {
            return NotificationStatus::Blocked;
        }
        match self.state(user_id, user_type) {
            RegistrationState::Registered => NotificationStatus::Enabled,
            RegistrationState::PermissionDenied => NotificationStatus::Blocked,
            _ => NotificationStatus::Disabled,
        }
    }

    fn set_state(&self, user_id: &str, user_type: UserType, state: RegistrationState) {
        if let Ok(mut states) = self.states.lock() {
            debug!(user_id = %user_id, user_type = %user_type, state = ?state, "Registration state");
            states.insert((user_id.to_string(), user_type), state);
        }
    }

    /// Asks the platform for permission. A denial is final: the platform is
    /// not asked again until the user changes browser settings.
    pub async fn request_permission(&self) -> PermissionOutcome {
        if !self.provider.is_supported() {
            return PermissionOutcome::Unsupported;
        }

        let state = match self.provider.permission() {
            PermissionState::Prompt => self.provider.request_permission().await,
            decided => decided,
        };

        match state {
            PermissionState::Granted => PermissionOutcome::Granted,
            PermissionState::Denied | PermissionState::Prompt => PermissionOutcome::Denied,
        }
    }

    /// Permission request followed by `register`, for the "enable notifications" action.
    pub async fn enable(
        &self,
        user_id: &str,
        user_type: UserType,
        user_info: Option<UserInfo>,
    ) -> Result<RegistrationReceipt, RegistrationError> {
        self.set_state(user_id, user_type, RegistrationState::PermissionPending);
        match self.request_permission().await {
            PermissionOutcome::Granted => self.register(user_id, user_type, user_info).await,
            PermissionOutcome::Denied => {
                self.set_state(user_id, user_type, RegistrationState::PermissionDenied);
                Err(RegistrationError::PermissionDenied)
            }
            PermissionOutcome::Unsupported => {
                self.set_state(user_id, user_type, RegistrationState::Unregistered);
                Err(RegistrationError::UnsupportedPlatform)
            }
        }
    }

    /// Registers `(user_id, user_type)` on this browser's push token. Needs
    /// permission already granted. Calling it again while registered only
    /// refreshes `lastActive`.
    pub async fn register(
        &self,
        user_id: &str,
        user_type: UserType,
        user_info: Option<UserInfo>,
    ) -> Result<RegistrationReceipt, RegistrationError> {
        if !self.provider.is_supported() {
            return Err(RegistrationError::UnsupportedPlatform);
        }
        match self.provider.permission() {
            PermissionState::Granted => {}
            PermissionState::Denied => {
                self.set_state(user_id, user_type, RegistrationState::PermissionDenied);
                return Err(RegistrationError::PermissionDenied);
            }
            PermissionState::Prompt => return Err(RegistrationError::PermissionDenied),
        }

        // A failed refresh leaves an existing registration standing
        let previous = match self.state(user_id, user_type) {
            RegistrationState::Registered => RegistrationState::Registered,
            _ => RegistrationState::Unregistered,
        };
        self.set_state(user_id, user_type, RegistrationState::TokenPending);

        let token = match self.provider.get_token().await {
            Ok(token) if !token.is_empty() => token,
            Ok(_) => {
                self.set_state(user_id, user_type, previous);
                return Err(ProviderError::NoToken.into());
            }
            Err(e) => {
                self.set_state(user_id, user_type, previous);
                return Err(e.into());
            }
        };

        let device = self.device_token(&token);
        let subscription = UserSubscription {
            user_id: user_id.to_string(),
            user_type,
            active_session_id: Some(
                user_info
                    .and_then(|info| info.session_id)
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            ),
            last_active: OffsetDateTime::now_utc(),
            topics: self.topics.clone(),
        };

        let write = async {
            let rotated = self.adopt_rotated_tokens(&device).await?;
            let outcome = self.registry.upsert(&device, &subscription).await?;
            Ok::<_, RegistryError>((rotated, outcome))
        };
        let (rotated, outcome) = match write.await {
            Ok(written) => written,
            Err(e) => {
                warn!(user_id = %user_id, user_type = %user_type, error = %e, "Could not persist registration");
                self.set_state(user_id, user_type, RegistrationState::Unregistered);
                return Err(e.into());
            }
        };

        self.sync_background(&device).await;
        self.mirror_rotation(&rotated, &device, user_id, user_type)
            .await;

        let request = RegisterRequest {
            device_token: device.clone(),
            user_subscription: subscription.clone(),
            topics: self.topics.clone(),
        };
        if let Err(e) = self.mirror.register(&request).await {
            // Keep the local entry; it only widens what this browser will show
            warn!(user_id = %user_id, user_type = %user_type, error = %e, "Server registration failed");
            self.set_state(user_id, user_type, RegistrationState::Unregistered);
            return Err(e.into());
        }

        self.set_state(user_id, user_type, RegistrationState::Registered);
        info!(
            user_id = %user_id,
            user_type = %user_type,
            token = %token_fingerprint(&token),
            outcome = ?outcome,
            "Registered for notifications"
        );

        Ok(RegistrationReceipt {
            token,
            subscription,
            outcome,
        })
    }

    /// Removes `(user_id, user_type)` from this browser. Unknown pairs are a
    /// no-op. Server failures are logged, never returned.
    pub async fn unregister(
        &self,
        user_id: &str,
        user_type: UserType,
    ) -> Result<(), RegistrationError> {
        let tokens = self.registry.all_tokens().await?;

        for token in &tokens {
            let removed = self.registry.remove(token, user_id, user_type).await?;
            if !removed {
                continue;
            }

            let request = UnregisterRequest {
                token: token.clone(),
                user_id: user_id.to_string(),
                user_type,
            };
            if let Err(e) = self.mirror.unregister(&request).await {
                warn!(user_id = %user_id, user_type = %user_type, error = %e, "Server unregister failed");
            }

            self.sync_background(&self.device_token(token)).await;
        }

        self.set_state(user_id, user_type, RegistrationState::Unregistered);
        info!(user_id = %user_id, user_type = %user_type, "Unregistered from notifications");
        Ok(())
    }

    /// Drops this browser's token entirely, for every user on it.
    pub async fn disable(&self) -> Result<(), RegistrationError> {
        for token in self.registry.all_tokens().await? {
            let subscriptions = self.registry.list_active_users(&token).await?;
            self.registry.remove_token(&token).await?;

            for subscription in &subscriptions {
                let request = UnregisterRequest {
                    token: token.clone(),
                    user_id: subscription.user_id.clone(),
                    user_type: subscription.user_type,
                };
                if let Err(e) = self.mirror.unregister(&request).await {
                    warn!(user_id = %subscription.user_id, error = %e, "Server unregister failed");
                }
                self.set_state(
                    &subscription.user_id,
                    subscription.user_type,
                    RegistrationState::Unregistered,
                );
            }

            self.sync_background(&self.device_token(&token)).await;
        }

        // Local and server state are already gone; a stale provider token reaches nobody
        if let Err(e) = self.provider.delete_token().await {
            warn!(error = %e, "Could not delete push token with the provider");
        }
        info!("Notifications disabled on this browser");
        Ok(())
    }

    /// Activity heartbeat. Returns false when the pair is not registered here.
    pub async fn heartbeat(
        &self,
        user_id: &str,
        user_type: UserType,
    ) -> Result<bool, RegistrationError> {
        let mut refreshed = false;
        for token in self.registry.all_tokens().await? {
            let subscriptions = self.registry.list_active_users(&token).await?;
            let Some(existing) = subscriptions
                .into_iter()
                .find(|s| s.matches(user_id, Some(user_type)))
            else {
                continue;
            };

            let subscription = UserSubscription {
                last_active: OffsetDateTime::now_utc(),
                ..existing
            };
            let device = self.device_token(&token);
            self.registry.upsert(&device, &subscription).await?;
            refreshed = true;

            // The server prunes on its own copy of lastActive
            let request = RegisterRequest {
                device_token: device,
                topics: subscription.topics.clone(),
                user_subscription: subscription,
            };
            if let Err(e) = self.mirror.register(&request).await {
                warn!(user_id = %user_id, user_type = %user_type, error = %e, "Server heartbeat failed");
            }
        }
        Ok(refreshed)
    }

    fn device_token(&self, token: &str) -> DeviceToken {
        let info = self.provider.device_info();
        DeviceToken {
            token: token.to_string(),
            device_id: info.device_id,
            platform: info.platform,
            browser: info.browser,
            user_agent: info.user_agent,
            registered_at: OffsetDateTime::now_utc(),
        }
    }

    /// One browser holds one token. Anything else stored locally is a
    /// token the provider has since rotated away from. Returns each old token
    /// with the subscriptions that moved off it.
    async fn adopt_rotated_tokens(
        &self,
        device: &DeviceToken,
    ) -> Result<Vec<(String, Vec<UserSubscription>)>, RegistryError> {
        let mut rotated = Vec::new();
        for old in self.registry.all_tokens().await? {
            if old == device.token {
                continue;
            }
            let subscriptions = self.registry.list_active_users(&old).await?;
            let moved = self.registry.rotate_token(&old, device).await?;
            info!(
                old = %token_fingerprint(&old),
                new = %token_fingerprint(&device.token),
                moved,
                "Push token rotated"
            );

            self.sync_background(&self.device_token(&old)).await;
            self.sync_background(device).await;
            rotated.push((old, subscriptions));
        }
        Ok(rotated)
    }

    /// Re-homes moved subscriptions on the server. Failures are logged; the
    /// next register or heartbeat of the affected role repairs them.
    async fn mirror_rotation(
        &self,
        rotated: &[(String, Vec<UserSubscription>)],
        device: &DeviceToken,
        user_id: &str,
        user_type: UserType,
    ) {
        for (old, subscriptions) in rotated {
            for moved in subscriptions {
                let request = UnregisterRequest {
                    token: old.clone(),
                    user_id: moved.user_id.clone(),
                    user_type: moved.user_type,
                };
                if let Err(e) = self.mirror.unregister(&request).await {
                    warn!(user_id = %moved.user_id, error = %e, "Server unregister of rotated token failed");
                }

                // The role being registered right now is sent by the caller
                if moved.matches(user_id, Some(user_type)) {
                    continue;
                }
                let request = RegisterRequest {
                    device_token: device.clone(),
                    user_subscription: moved.clone(),
                    topics: moved.topics.clone(),
                };
                if let Err(e) = self.mirror.register(&request).await {
                    warn!(user_id = %moved.user_id, error = %e, "Server re-registration after rotation failed");
                }
            }
        }
    }

    async fn sync_background(&self, device: &DeviceToken) {
        let Some(handle) = &self.background else {
            return;
        };
        match self.registry.list_active_users(&device.token).await {
            Ok(subscriptions) => handle.sync(device.clone(), subscriptions).await,
            Err(e) => warn!(error = %e, "Could not read registry for background sync"),
        }
    }
}
