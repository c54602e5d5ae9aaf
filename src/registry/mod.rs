//! Token registry: which logical users are registered on which push token.
//!
//! The same trait fronts the in-process store used by browser contexts and
//! tests, the file-backed browser-local store, and the Postgres mirror the
//! server targets against.

mod local;
mod memory;
mod postgres;

pub use local::{LocalRegistry, LOCAL_REGISTRY_KEY};
pub use memory::MemoryRegistry;
pub use postgres::PgRegistry;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::error::RegistryError;
use crate::models::{DeviceToken, UserSubscription, UserType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Refreshed,
}

#[trait_variant::make(Send)]
pub trait TokenRegistry {
    /// Adds or refreshes a subscription under a token. The device record is
    /// created on first use and its metadata refreshed afterwards.
    async fn upsert(
        &self,
        device: &DeviceToken,
        subscription: &UserSubscription,
    ) -> Result<UpsertOutcome, RegistryError>;

    /// Removes one (token, user, role) triple. Returns false when nothing matched.
    async fn remove(
        &self,
        token: &str,
        user_id: &str,
        user_type: UserType,
    ) -> Result<bool, RegistryError>;

    async fn list_active_users(&self, token: &str) -> Result<Vec<UserSubscription>, RegistryError>;

    /// `user_type: None` matches any role.
    async fn is_active(
        &self,
        user_id: &str,
        user_type: Option<UserType>,
    ) -> Result<bool, RegistryError>;

    async fn tokens_for_user(
        &self,
        user_id: &str,
        user_type: Option<UserType>,
        live_since: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError>;

    async fn tokens_for_role(
        &self,
        user_type: UserType,
        live_since: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError>;

    async fn all_tokens(&self) -> Result<Vec<String>, RegistryError>;

    /// Moves every subscription held by `old_token` onto `device.token`.
    async fn rotate_token(&self, old_token: &str, device: &DeviceToken)
        -> Result<u64, RegistryError>;

    /// Drops a token and all its subscriptions.
    async fn remove_token(&self, token: &str) -> Result<u64, RegistryError>;

    /// Drops subscriptions last seen before `before`, and devices left empty.
    async fn prune_stale(&self, before: OffsetDateTime) -> Result<u64, RegistryError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RegistryEntry {
    pub device: DeviceToken,
    pub subscriptions: Vec<UserSubscription>,
}

/// Registry contents keyed by token. Shared by the in-process and the
/// file-backed stores; every method is one atomic step under their lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct RegistryState {
    #[serde(default)]
    pub entries: BTreeMap<String, RegistryEntry>,
}

impl RegistryState {
    pub fn upsert(&mut self, device: &DeviceToken, subscription: &UserSubscription) -> UpsertOutcome {
        let entry = self
            .entries
            .entry(device.token.clone())
            .or_insert_with(|| RegistryEntry {
                device: device.clone(),
                subscriptions: Vec::new(),
            });

        // Keep the original registration time across metadata refreshes
        let registered_at = entry.device.registered_at;
        entry.device = device.clone();
        entry.device.registered_at = registered_at;

        match entry.subscriptions.iter_mut().find(|existing| {
            existing.user_id == subscription.user_id && existing.user_type == subscription.user_type
        }) {
            Some(existing) => {
                *existing = subscription.clone();
                UpsertOutcome::Refreshed
            }
            None => {
                entry.subscriptions.push(subscription.clone());
                UpsertOutcome::Created
            }
        }
    }

    pub fn remove(&mut self, token: &str, user_id: &str, user_type: UserType) -> bool {
        let Some(entry) = self.entries.get_mut(token) else {
            return false;
        };

        let before = entry.subscriptions.len();
        entry
            .subscriptions
            .retain(|s| !(s.user_id == user_id && s.user_type == user_type));
        let removed = entry.subscriptions.len() != before;

        if entry.subscriptions.is_empty() {
            self.entries.remove(token);
        }
        removed
    }

    pub fn list(&self, token: &str) -> Vec<UserSubscription> {
        self.entries
            .get(token)
            .map(|entry| entry.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn is_active(&self, user_id: &str, user_type: Option<UserType>) -> bool {
        self.entries
            .values()
            .flat_map(|entry| entry.subscriptions.iter())
            .any(|s| s.matches(user_id, user_type))
    }

    pub fn tokens_where(
        &self,
        live_since: OffsetDateTime,
        pred: impl Fn(&UserSubscription) -> bool,
    ) -> Vec<String> {
        // BTreeMap keys come out sorted and unique
        self.entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .subscriptions
                    .iter()
                    .any(|s| s.last_active >= live_since && pred(s))
            })
            .map(|(token, _)| token.clone())
            .collect()
    }

    pub fn all_tokens(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn rotate(&mut self, old_token: &str, device: &DeviceToken) -> u64 {
        if old_token == device.token {
            if let Some(entry) = self.entries.get_mut(old_token) {
                entry.device = device.clone();
            }
            return 0;
        }

        let Some(old) = self.entries.remove(old_token) else {
            return 0;
        };

        let mut moved = 0;
        for subscription in &old.subscriptions {
            self.upsert(device, subscription);
            moved += 1;
        }
        moved
    }

    pub fn remove_token(&mut self, token: &str) -> u64 {
        self.entries
            .remove(token)
            .map(|entry| entry.subscriptions.len() as u64)
            .unwrap_or(0)
    }

    pub fn prune(&mut self, before: OffsetDateTime) -> u64 {
        let mut pruned = 0;
        for entry in self.entries.values_mut() {
            let len = entry.subscriptions.len();
            entry.subscriptions.retain(|s| s.last_active >= before);
            pruned += (len - entry.subscriptions.len()) as u64;
        }
        self.entries.retain(|_, entry| !entry.subscriptions.is_empty());
        pruned
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use time::Duration;

    pub fn device(token: &str) -> DeviceToken {
        DeviceToken {
            token: token.to_string(),
            device_id: format!("device-{}", token),
            platform: "Linux x86_64".to_string(),
            browser: "Firefox".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            registered_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn subscription(user_id: &str, user_type: UserType) -> UserSubscription {
        UserSubscription {
            user_id: user_id.to_string(),
            user_type,
            active_session_id: Some(format!("session-{}", user_id)),
            last_active: OffsetDateTime::now_utc(),
            topics: Vec::new(),
        }
    }

    pub fn stale_subscription(user_id: &str, user_type: UserType, days: i64) -> UserSubscription {
        UserSubscription {
            last_active: OffsetDateTime::now_utc() - Duration::days(days),
            ..subscription(user_id, user_type)
        }
    }

    pub fn long_ago() -> OffsetDateTime {
        OffsetDateTime::now_utc() - Duration::days(365)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_state_upsert_is_idempotent_per_triple() {
        let mut state = RegistryState::default();
        let first = subscription("u1", UserType::Customer);
        assert_eq!(state.upsert(&device("tok1"), &first), UpsertOutcome::Created);

        let mut again = subscription("u1", UserType::Customer);
        again.last_active = first.last_active + time::Duration::minutes(5);
        assert_eq!(state.upsert(&device("tok1"), &again), UpsertOutcome::Refreshed);

        let listed = state.list("tok1");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_active, again.last_active);
    }

    #[test]
    fn test_state_rotation_moves_subscriptions() {
        let mut state = RegistryState::default();
        state.upsert(&device("old"), &subscription("u1", UserType::Customer));
        state.upsert(&device("old"), &subscription("u1", UserType::Provider));

        assert_eq!(state.rotate("old", &device("new")), 2);
        assert!(state.list("old").is_empty());
        assert_eq!(state.list("new").len(), 2);
    }

    #[test]
    fn test_state_prune_drops_empty_devices() {
        let mut state = RegistryState::default();
        state.upsert(&device("tok1"), &stale_subscription("u1", UserType::Customer, 60));
        state.upsert(&device("tok2"), &stale_subscription("u2", UserType::Customer, 60));
        state.upsert(&device("tok2"), &subscription("u3", UserType::Admin));

        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(30);
        assert_eq!(state.prune(cutoff), 2);
        assert_eq!(state.all_tokens(), vec!["tok2".to_string()]);
    }
}
