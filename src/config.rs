use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub api_bind_address: String,
    pub fcm_project_id: String,
    pub fcm_access_token: String,
    pub fcm_endpoint: String,
    pub send_api_secret: Option<String>,
    pub subscription_ttl_days: i64,
    pub dispatch_concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            fcm_project_id: env::var("FCM_PROJECT_ID").context("FCM_PROJECT_ID must be set")?,
            fcm_access_token: env::var("FCM_ACCESS_TOKEN")
                .context("FCM_ACCESS_TOKEN must be set")?,
            fcm_endpoint: env::var("FCM_ENDPOINT")
                .unwrap_or_else(|_| "https://fcm.googleapis.com".to_string()),
            send_api_secret: env::var("SEND_API_SECRET").ok().filter(|s| !s.is_empty()),
            subscription_ttl_days: parse_or("SUBSCRIPTION_TTL_DAYS", 30)?,
            dispatch_concurrency: parse_or("DISPATCH_CONCURRENCY", 16)?,
        })
    }

    pub fn subscription_ttl(&self) -> time::Duration {
        time::Duration::days(self.subscription_ttl_days)
    }
}

/// Browser-side configuration used by the coordinator and the delivery contexts.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub registration_url: Option<String>,
    pub registry_dir: PathBuf,
    pub registry_query_timeout: Duration,
    pub topics: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registration_url: None,
            registry_dir: PathBuf::from(".sniket"),
            registry_query_timeout: Duration::from_millis(500),
            topics: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            registration_url: env::var("SNIKET_REGISTRATION_URL").ok(),
            registry_dir: env::var("SNIKET_REGISTRY_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_dir),
            registry_query_timeout: Duration::from_millis(parse_or(
                "SNIKET_REGISTRY_QUERY_TIMEOUT_MS",
                500,
            )?),
            topics: env::var("SNIKET_TOPICS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .with_context(|| format!("{} must be a valid number, got {:?}", key, v)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back_when_unset() {
        let value: u64 = parse_or("SNIKET_TEST_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.registry_query_timeout, Duration::from_millis(500));
        assert!(config.registration_url.is_none());
    }

    #[test]
    fn test_client_config_from_env() {
        env::set_var("SNIKET_REGISTRY_DIR", "/tmp/sniket-config-test");
        env::set_var("SNIKET_REGISTRY_QUERY_TIMEOUT_MS", "250");
        env::set_var("SNIKET_TOPICS", "bookings, payments,,");

        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.registry_dir, PathBuf::from("/tmp/sniket-config-test"));
        assert_eq!(config.registry_query_timeout, Duration::from_millis(250));
        assert_eq!(config.topics, vec!["bookings".to_string(), "payments".to_string()]);

        env::remove_var("SNIKET_REGISTRY_DIR");
        env::remove_var("SNIKET_REGISTRY_QUERY_TIMEOUT_MS");
        env::remove_var("SNIKET_TOPICS");
    }
}
