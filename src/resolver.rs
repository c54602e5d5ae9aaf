use std::collections::BTreeSet;
use time::OffsetDateTime;
use tracing::debug;

use crate::error::RegistryError;
use crate::models::Target;
use crate::registry::TokenRegistry;

/// Turns a notification target into the device tokens to contact.
pub struct TargetingResolver<R> {
    registry: R,
    subscription_ttl: time::Duration,
}

impl<R: TokenRegistry + Sync> TargetingResolver<R> {
    pub fn new(registry: R, subscription_ttl: time::Duration) -> Self {
        Self {
            registry,
            subscription_ttl,
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Sorted, duplicate-free. An empty result is a valid answer.
    pub async fn resolve(&self, target: &Target) -> Result<Vec<String>, RegistryError> {
        let live_since = OffsetDateTime::now_utc() - self.subscription_ttl;

        let tokens = match target {
            Target::User { user_id, user_type } => {
                self.registry
                    .tokens_for_user(user_id, *user_type, live_since)
                    .await?
            }
            Target::Role(user_type) => {
                self.registry
                    .tokens_for_role(*user_type, live_since)
                    .await?
            }
            Target::Broadcast => self.registry.all_tokens().await?,
        };

        // A token holding several matching roles is contacted once
        let tokens: Vec<String> = tokens.into_iter().collect::<BTreeSet<_>>().into_iter().collect();

        debug!(target = ?target, count = tokens.len(), "Resolved notification target");
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserType;
    use crate::registry::test_support::*;
    use crate::registry::MemoryRegistry;

    async fn scenario_registry() -> MemoryRegistry {
        let registry = MemoryRegistry::new();
        registry
            .upsert(&device("tok1"), &subscription("u_cust", UserType::Customer))
            .await
            .unwrap();
        registry
            .upsert(&device("tok1"), &subscription("u_prov", UserType::Provider))
            .await
            .unwrap();
        registry
            .upsert(&device("tok2"), &subscription("u_admin", UserType::Admin))
            .await
            .unwrap();
        registry
    }

    fn resolver(registry: MemoryRegistry) -> TargetingResolver<MemoryRegistry> {
        TargetingResolver::new(registry, time::Duration::days(30))
    }

    #[tokio::test]
    async fn test_role_target_on_shared_token() {
        let resolver = resolver(scenario_registry().await);
        let tokens = resolver.resolve(&Target::Role(UserType::Provider)).await.unwrap();
        assert_eq!(tokens, vec!["tok1".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_user_resolves_to_nothing() {
        let resolver = resolver(scenario_registry().await);
        let tokens = resolver
            .resolve(&Target::User {
                user_id: "u_other".to_string(),
                user_type: None,
            })
            .await
            .unwrap();
        assert!(tokens.is_empty());
    }

    #[tokio::test]
    async fn test_user_target_respects_role() {
        let resolver = resolver(scenario_registry().await);
        let wrong_role = resolver
            .resolve(&Target::User {
                user_id: "u_cust".to_string(),
                user_type: Some(UserType::Provider),
            })
            .await
            .unwrap();
        assert!(wrong_role.is_empty());

        let any_role = resolver
            .resolve(&Target::User {
                user_id: "u_cust".to_string(),
                user_type: None,
            })
            .await
            .unwrap();
        assert_eq!(any_role, vec!["tok1".to_string()]);
    }

    #[tokio::test]
    async fn test_broadcast_has_no_duplicates() {
        let resolver = resolver(scenario_registry().await);
        let tokens = resolver.resolve(&Target::Broadcast).await.unwrap();
        assert_eq!(tokens, vec!["tok1".to_string(), "tok2".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_role_members_are_skipped() {
        let registry = MemoryRegistry::new();
        registry
            .upsert(&device("tok_old"), &stale_subscription("u1", UserType::Provider, 90))
            .await
            .unwrap();
        let resolver = resolver(registry);

        let tokens = resolver.resolve(&Target::Role(UserType::Provider)).await.unwrap();
        assert!(tokens.is_empty());
    }
}
