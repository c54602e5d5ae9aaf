use constant_time_eq::constant_time_eq;
use sha2::{Digest, Sha256};

// Push tokens are bearer credentials for a device; logs only ever see a
// short digest of them.
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

// Check a presented bearer secret against the configured one
pub fn secret_matches(presented: &str, expected: &str) -> bool {
    constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

/// Pulls the secret out of an `Authorization: Bearer <secret>` header value.
pub fn bearer_secret(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|secret| !secret.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_fingerprint() {
        let fp1 = token_fingerprint("fcm-token-1");
        let fp2 = token_fingerprint("fcm-token-1");
        let fp3 = token_fingerprint("fcm-token-2");

        // Same token gives the same fingerprint
        assert_eq!(fp1, fp2);
        assert_ne!(fp1, fp3);
        assert_eq!(fp1.len(), 12);
        assert!(!fp1.contains("fcm"));
    }

    #[test]
    fn test_secret_checks() {
        assert!(secret_matches("s3cret", "s3cret"));
        assert!(!secret_matches("s3cret", "s3cre"));
        assert!(!secret_matches("", "s3cret"));

        assert_eq!(bearer_secret("Bearer s3cret"), Some("s3cret"));
        assert_eq!(bearer_secret("Bearer "), None);
        assert_eq!(bearer_secret("Basic abc"), None);
    }
}
