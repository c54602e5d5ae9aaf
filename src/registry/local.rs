use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::{MemoryRegistry, RegistryState, TokenRegistry, UpsertOutcome};
use crate::error::RegistryError;
use crate::models::{DeviceToken, UserSubscription, UserType};

/// Storage key of the browser-local registry. Changing it orphans every
/// registration made by earlier versions.
pub const LOCAL_REGISTRY_KEY: &str = "sniket_fcm_registry_v1";

/// Browser-local registry persisted as one JSON document. Every mutation
/// rewrites the document; writers in other processes are last-write-wins.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    path: PathBuf,
    state: Arc<Mutex<RegistryState>>,
    // Held across the file write
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl LocalRegistry {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.json", LOCAL_REGISTRY_KEY));

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<RegistryState>(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    // A corrupt document must not block notifications entirely
                    warn!(path = %path.display(), error = %e, "Discarding unreadable local registry");
                    RegistryState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryState::default(),
            Err(e) => return Err(e.into()),
        };

        debug!(
            path = %path.display(),
            tokens = state.entries.len(),
            "Opened local registry"
        );

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(state)),
            writer: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// In-memory copy of the current contents, used to seed the background context.
    pub fn snapshot(&self) -> Result<MemoryRegistry, RegistryError> {
        Ok(MemoryRegistry::from_state(self.lock()?.clone()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, RegistryState>, RegistryError> {
        self.state
            .lock()
            .map_err(|_| RegistryError::Storage("local registry lock poisoned".to_string()))
    }

    /// Applies `f` to a copy of the state, persists the copy, then publishes
    /// it. Writers are serialized so each call is one atomic step, and
    /// readers never observe state that failed to reach disk.
    async fn mutate<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut RegistryState) -> T + Send,
        T: Send,
    {
        let _writer = self.writer.lock().await;

        let (out, next, bytes) = {
            let state = self.lock()?;
            let mut next = state.clone();
            let out = f(&mut next);
            if next == *state {
                return Ok(out);
            }
            let bytes = serde_json::to_vec_pretty(&next)?;
            (out, next, bytes)
        };

        self.persist(&bytes).await?;
        *self.lock()? = next;
        Ok(out)
    }

    async fn persist(&self, bytes: &[u8]) -> Result<(), RegistryError> {
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

impl TokenRegistry for LocalRegistry {
    async fn upsert(
        &self,
        device: &DeviceToken,
        subscription: &UserSubscription,
    ) -> Result<UpsertOutcome, RegistryError> {
        self.mutate(|state| state.upsert(device, subscription)).await
    }

    async fn remove(
        &self,
        token: &str,
        user_id: &str,
        user_type: UserType,
    ) -> Result<bool, RegistryError> {
        self.mutate(|state| state.remove(token, user_id, user_type))
            .await
    }

    async fn list_active_users(&self, token: &str) -> Result<Vec<UserSubscription>, RegistryError> {
        Ok(self.lock()?.list(token))
    }

    async fn is_active(
        &self,
        user_id: &str,
        user_type: Option<UserType>,
    ) -> Result<bool, RegistryError> {
        Ok(self.lock()?.is_active(user_id, user_type))
    }

    async fn tokens_for_user(
        &self,
        user_id: &str,
        user_type: Option<UserType>,
        live_since: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .lock()?
            .tokens_where(live_since, |s| s.matches(user_id, user_type)))
    }

    async fn tokens_for_role(
        &self,
        user_type: UserType,
        live_since: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError> {
        Ok(self
            .lock()?
            .tokens_where(live_since, |s| s.user_type == user_type))
    }

    async fn all_tokens(&self) -> Result<Vec<String>, RegistryError> {
        Ok(self.lock()?.all_tokens())
    }

    async fn rotate_token(
        &self,
        old_token: &str,
        device: &DeviceToken,
    ) -> Result<u64, RegistryError> {
        self.mutate(|state| state.rotate(old_token, device)).await
    }

    async fn remove_token(&self, token: &str) -> Result<u64, RegistryError> {
        self.mutate(|state| state.remove_token(token)).await
    }

    async fn prune_stale(&self, before: OffsetDateTime) -> Result<u64, RegistryError> {
        self.mutate(|state| state.prune(before)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::*;

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "sniket-registry-{}-{}",
            label,
            uuid::Uuid::new_v4()
        ))
    }

    #[tokio::test]
    async fn test_registrations_survive_reopen() {
        let dir = temp_dir("reopen");
        let registry = LocalRegistry::open(&dir).await.unwrap();
        registry
            .upsert(&device("tok1"), &subscription("u_cust", UserType::Customer))
            .await
            .unwrap();
        registry
            .upsert(&device("tok1"), &subscription("u_prov", UserType::Provider))
            .await
            .unwrap();
        assert!(registry
            .path()
            .ends_with(format!("{}.json", LOCAL_REGISTRY_KEY)));

        let reopened = LocalRegistry::open(&dir).await.unwrap();
        let subs = reopened.list_active_users("tok1").await.unwrap();
        assert_eq!(subs.len(), 2);
        assert!(reopened.is_active("u_prov", Some(UserType::Provider)).await.unwrap());

        std::fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[tokio::test]
    async fn test_corrupt_document_starts_empty() {
        let dir = temp_dir("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{}.json", LOCAL_REGISTRY_KEY)), b"{not json").unwrap();

        let registry = LocalRegistry::open(&dir).await.unwrap();
        assert!(registry.all_tokens().await.unwrap().is_empty());

        std::fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[tokio::test]
    async fn test_unregister_is_persisted() {
        let dir = temp_dir("unregister");
        let registry = LocalRegistry::open(&dir).await.unwrap();
        registry
            .upsert(&device("tok1"), &subscription("u1", UserType::Customer))
            .await
            .unwrap();
        registry.remove("tok1", "u1", UserType::Customer).await.unwrap();
        // Second removal is a no-op
        assert!(!registry.remove("tok1", "u1", UserType::Customer).await.unwrap());

        let reopened = LocalRegistry::open(&dir).await.unwrap();
        assert!(reopened.list_active_users("tok1").await.unwrap().is_empty());

        std::fs::remove_dir_all(&dir).expect("cleanup");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_are_all_persisted() {
        let dir = temp_dir("concurrent");
        let registry = LocalRegistry::open(&dir).await.unwrap();

        let writes = (0..64).map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .upsert(
                        &device(&format!("tok{}", i)),
                        &subscription(&format!("u{}", i), UserType::Customer),
                    )
                    .await
            })
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap().unwrap();
        }

        assert_eq!(registry.all_tokens().await.unwrap().len(), 64);
        let reopened = LocalRegistry::open(&dir).await.unwrap();
        assert_eq!(reopened.all_tokens().await.unwrap().len(), 64);

        // No temp files are left behind
        let leftovers = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        std::fs::remove_dir_all(&dir).expect("cleanup");
    }
}
