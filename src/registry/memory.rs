use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use time::OffsetDateTime;

use super::{RegistryState, TokenRegistry, UpsertOutcome};
use crate::error::RegistryError;
use crate::models::{DeviceToken, UserSubscription, UserType};

/// Process-local registry. Cloning shares the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: RegistryState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Replaces everything known about `token` with `subscriptions`. Used by
    /// the background context when the open tab pushes a registry update.
    pub fn replace_token(
        &self,
        device: &DeviceToken,
        subscriptions: &[UserSubscription],
    ) -> Result<(), RegistryError> {
        let mut state = self.write()?;
        state.remove_token(&device.token);
        for subscription in subscriptions {
            state.upsert(device, subscription);
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> Result<Vec<UserSubscription>, RegistryError> {
        let state = self.read()?;
        Ok(state
            .entries
            .values()
            .flat_map(|entry| entry.subscriptions.iter().cloned())
            .collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RegistryState>, RegistryError> {
        self.state
            .read()
            .map_err(|_| RegistryError::Storage("registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryState>, RegistryError> {
        self.state
            .write()
            .map_err(|_| RegistryError::Storage("registry lock poisoned".to_string()))
    }
}

impl TokenRegistry for MemoryRegistry {
    async fn upsert(
        &self,
        device: &DeviceToken,
        subscription: &UserSubscription,
    ) -> Result<UpsertOutcome, RegistryError> {
        Ok(self.write()?.upsert(device, subscription))
    }

    async fn remove(
        &self,
        token: &str,
        user_id: &str,
        user_type: UserType,
    ) -> Result<bool, RegistryError> {
        Ok(self.write()?.remove(token, user_id, user_type))
    }

    async fn list_active_users(&self, token: &str) -> Result<Vec<UserSubscription>, RegistryError> {
        Ok(self.read()?.list(token))
    }

    async fn is_active(
        &self,
        user_id: &str,
        user_type: Option<UserType>,
    ) -> Result<bool, RegistryError> {
        Ok(self.read()?.is_active(user_id, user_type))
    }

    async fn tokens_for_user(
        &self,
        user_id: &str,
        user_type: Option<UserType>,
        live_since: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .read()?
            .tokens_where(live_since, |s| s.matches(user_id, user_type)))
    }

    async fn tokens_for_role(
        &self,
        user_type: UserType,
        live_since: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .read()?
            .tokens_where(live_since, |s| s.user_type == user_type))
    }

    async fn all_tokens(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.read()?.all_tokens())
    }

    async fn rotate_token(
        &self,
        old_token: &str,
        device: &DeviceToken,
    ) -> Result<u64, RegistryError> {
        Ok(self.write()?.rotate(old_token, device))
    }

    async fn remove_token(&self, token: &str) -> Result<u64, RegistryError> {
        Ok(self.write()?.remove_token(token))
    }

    async fn prune_stale(&self, before: OffsetDateTime) -> Result<u64, RegistryError> {
        Ok(self.write()?.prune(before))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::*;

    #[tokio::test]
    async fn test_register_then_remove_round_trip() {
        let registry = MemoryRegistry::new();
        let sub = subscription("u1", UserType::Customer);

        registry.upsert(&device("tok1"), &sub).await.unwrap();
        let listed = registry.list_active_users("tok1").await.unwrap();
        assert!(listed.iter().any(|s| s.matches("u1", Some(UserType::Customer))));

        assert!(registry.remove("tok1", "u1", UserType::Customer).await.unwrap());
        let listed = registry.list_active_users("tok1").await.unwrap();
        assert!(!listed.iter().any(|s| s.matches("u1", Some(UserType::Customer))));
    }

    #[tokio::test]
    async fn test_remove_missing_entry_is_noop() {
        let registry = MemoryRegistry::new();
        assert!(!registry.remove("nope", "u1", UserType::Admin).await.unwrap());

        registry
            .upsert(&device("tok1"), &subscription("u1", UserType::Customer))
            .await
            .unwrap();
        assert!(!registry.remove("tok1", "u1", UserType::Provider).await.unwrap());
        assert_eq!(registry.list_active_users("tok1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_is_active_any_role() {
        let registry = MemoryRegistry::new();
        registry
            .upsert(&device("tok1"), &subscription("u1", UserType::Provider))
            .await
            .unwrap();

        assert!(registry.is_active("u1", None).await.unwrap());
        assert!(registry.is_active("u1", Some(UserType::Provider)).await.unwrap());
        assert!(!registry.is_active("u1", Some(UserType::Customer)).await.unwrap());
        assert!(!registry.is_active("u2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_subscriptions_are_not_targeted() {
        let registry = MemoryRegistry::new();
        registry
            .upsert(&device("tok1"), &stale_subscription("u1", UserType::Customer, 45))
            .await
            .unwrap();
        registry
            .upsert(&device("tok2"), &subscription("u1", UserType::Customer))
            .await
            .unwrap();

        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(30);
        let tokens = registry.tokens_for_user("u1", None, cutoff).await.unwrap();
        assert_eq!(tokens, vec!["tok2".to_string()]);

        // Stale entries are still known devices
        assert_eq!(registry.all_tokens().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_token_overwrites_snapshot() {
        let registry = MemoryRegistry::new();
        registry
            .upsert(&device("tok1"), &subscription("u1", UserType::Customer))
            .await
            .unwrap();

        registry
            .replace_token(&device("tok1"), &[subscription("u2", UserType::Admin)])
            .unwrap();

        let subs = registry.subscriptions().unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].user_id, "u2");
    }
}
