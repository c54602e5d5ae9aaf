use thiserror::Error;

/// Failures of a token registry backend.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry storage error: {0}")]
    Storage(String),

    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("registry database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised by the push provider SDK while acquiring a token.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("push provider returned no token")]
    NoToken,

    #[error("push provider failure: {0}")]
    Failed(String),
}

/// Errors from the server-side registration mirror.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("registration endpoint rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Outcome of a failed `register`, classified for the UI layer.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("notification permission was denied")]
    PermissionDenied,

    #[error("push notifications are not supported on this platform")]
    UnsupportedPlatform,

    #[error("push token unavailable: {0}")]
    TokenUnavailable(#[from] ProviderError),

    #[error("could not persist registration: {0}")]
    RegistryWriteFailed(#[from] RegistryError),

    #[error("could not reach registration endpoint: {0}")]
    NetworkError(#[from] MirrorError),
}

impl RegistrationError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            RegistrationError::PermissionDenied => "permission_denied",
            RegistrationError::UnsupportedPlatform => "unsupported_platform",
            RegistrationError::TokenUnavailable(_) => "token_unavailable",
            RegistrationError::RegistryWriteFailed(_) => "registry_write_failed",
            RegistrationError::NetworkError(_) => "network_error",
        }
    }

    /// Permission and platform failures are terminal until the environment changes.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RegistrationError::PermissionDenied | RegistrationError::UnsupportedPlatform
        )
    }

    pub fn status(&self) -> NotificationStatus {
        match self {
            RegistrationError::PermissionDenied => NotificationStatus::Blocked,
            RegistrationError::UnsupportedPlatform => NotificationStatus::Unsupported,
            other => NotificationStatus::Failed {
                code: other.code(),
                retryable: other.is_retryable(),
            },
        }
    }
}

/// What the UI shows about notifications for the current user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStatus {
    Enabled,
    /// Not registered here; offer the enable action.
    Disabled,
    /// Denied in browser settings; show a dismissible hint, never re-prompt.
    Blocked,
    Unsupported,
    /// Transient failure; offer a manual retry.
    Failed { code: &'static str, retryable: bool },
}

/// Per-token send failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("invalid or expired token: {0}")]
    InvalidToken(String),

    #[error("transient send failure: {0}")]
    Transient(String),

    /// The provider refused the request itself (credentials, malformed payload).
    #[error("push provider rejected the message: {0}")]
    Rejected(String),
}

impl SendError {
    pub fn code(&self) -> &'static str {
        match self {
            SendError::InvalidToken(_) => "invalid_token",
            SendError::Transient(_) => "network_error",
            SendError::Rejected(_) => "provider_rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_status() {
        assert_eq!(RegistrationError::PermissionDenied.code(), "permission_denied");
        assert_eq!(
            RegistrationError::PermissionDenied.status(),
            NotificationStatus::Blocked
        );
        assert!(!RegistrationError::UnsupportedPlatform.is_retryable());

        let err = RegistrationError::from(ProviderError::NoToken);
        assert_eq!(err.code(), "token_unavailable");
        assert_eq!(
            err.status(),
            NotificationStatus::Failed {
                code: "token_unavailable",
                retryable: true
            }
        );

        let err = RegistrationError::from(RegistryError::Storage("disk full".to_string()));
        assert_eq!(err.code(), "registry_write_failed");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_send_error_codes() {
        assert_eq!(SendError::InvalidToken("gone".into()).code(), "invalid_token");
        assert_eq!(SendError::Transient("timeout".into()).code(), "network_error");
        assert_eq!(
            SendError::Rejected("401 UNAUTHENTICATED".into()).code(),
            "provider_rejected"
        );
    }
}
