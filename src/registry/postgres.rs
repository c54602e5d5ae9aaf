use moka::future::Cache;
use sqlx::{FromRow, Pool, Postgres, Row};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

use super::{TokenRegistry, UpsertOutcome};
use crate::crypto::token_fingerprint;
use crate::error::RegistryError;
use crate::models::{DeviceToken, UserSubscription, UserType};

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    user_id: String,
    user_type: String,
    active_session_id: Option<String>,
    last_active: OffsetDateTime,
    topics: Vec<String>,
}

impl TryFrom<SubscriptionRow> for UserSubscription {
    type Error = RegistryError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let user_type = row
            .user_type
            .parse::<UserType>()
            .map_err(|e| RegistryError::Storage(e.to_string()))?;
        Ok(UserSubscription {
            user_id: row.user_id,
            user_type,
            active_session_id: row.active_session_id,
            last_active: row.last_active,
            topics: row.topics,
        })
    }
}

/// Server-side mirror of every browser's registrations.
#[derive(Clone)]
pub struct PgRegistry {
    // token -> subscriptions currently stored for it
    subscriptions_cache: Cache<String, Vec<UserSubscription>>,
    db_pool: Pool<Postgres>,
}

impl PgRegistry {
    pub fn new(db_pool: Pool<Postgres>) -> Self {
        let subscriptions_cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(300))
            .build();

        Self {
            subscriptions_cache,
            db_pool,
        }
    }

    async fn upsert_device(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        device: &DeviceToken,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO device_tokens (token, device_id, platform, browser, user_agent, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (token) DO UPDATE
            SET device_id = EXCLUDED.device_id,
                platform = EXCLUDED.platform,
                browser = EXCLUDED.browser,
                user_agent = EXCLUDED.user_agent,
                updated_at = NOW()
            "#,
        )
        .bind(&device.token)
        .bind(&device.device_id)
        .bind(&device.platform)
        .bind(&device.browser)
        .bind(&device.user_agent)
        .bind(device.registered_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete_orphaned_devices(&self) -> Result<u64, RegistryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM device_tokens d
            WHERE NOT EXISTS (SELECT 1 FROM user_subscriptions s WHERE s.token = d.token)
            "#,
        )
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_tokens(
        &self,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<String>, RegistryError> {
        let rows = query.fetch_all(&self.db_pool).await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("token").map_err(RegistryError::from))
            .collect()
    }
}

impl TokenRegistry for PgRegistry {
    async fn upsert(
        &self,
        device: &DeviceToken,
        subscription: &UserSubscription,
    ) -> Result<UpsertOutcome, RegistryError> {
        let mut tx = self.db_pool.begin().await?;

        Self::upsert_device(&mut tx, device).await?;

        let row = sqlx::query(
            r#"
            INSERT INTO user_subscriptions (token, user_id, user_type, active_session_id, last_active, topics)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (token, user_id, user_type) DO UPDATE
            SET active_session_id = EXCLUDED.active_session_id,
                last_active = EXCLUDED.last_active,
                topics = EXCLUDED.topics
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&device.token)
        .bind(&subscription.user_id)
        .bind(subscription.user_type.as_str())
        .bind(&subscription.active_session_id)
        .bind(subscription.last_active)
        .bind(&subscription.topics)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        self.subscriptions_cache.invalidate(&device.token).await;

        let inserted: bool = row.try_get("inserted")?;
        debug!(
            token = %token_fingerprint(&device.token),
            user_id = %subscription.user_id,
            user_type = %subscription.user_type,
            inserted,
            "Upserted subscription"
        );

        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Refreshed
        })
    }

    async fn remove(
        &self,
        token: &str,
        user_id: &str,
        user_type: UserType,
    ) -> Result<bool, RegistryError> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_subscriptions
            WHERE token = $1 AND user_id = $2 AND user_type = $3
            "#,
        )
        .bind(token)
        .bind(user_id)
        .bind(user_type.as_str())
        .execute(&self.db_pool)
        .await?;

        // A device with nobody left on it is no longer a delivery target
        sqlx::query(
            r#"
            DELETE FROM device_tokens d
            WHERE d.token = $1
              AND NOT EXISTS (SELECT 1 FROM user_subscriptions s WHERE s.token = d.token)
            "#,
        )
        .bind(token)
        .execute(&self.db_pool)
        .await?;

        self.subscriptions_cache.invalidate(token).await;
        Ok(result.rows_affected() > 0)
    }

    async fn list_active_users(&self, token: &str) -> Result<Vec<UserSubscription>, RegistryError> {
        if let Some(subscriptions) = self.subscriptions_cache.get(token) {
            return Ok(subscriptions);
        }

        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT user_id, user_type, active_session_id, last_active, topics
            FROM user_subscriptions
            WHERE token = $1
            ORDER BY user_id, user_type
            "#,
        )
        .bind(token)
        .fetch_all(&self.db_pool)
        .await?;

        let subscriptions = rows
            .into_iter()
            .map(UserSubscription::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        self.subscriptions_cache
            .insert(token.to_string(), subscriptions.clone())
            .await;

        Ok(subscriptions)
    }

    async fn is_active(
        &self,
        user_id: &str,
        user_type: Option<UserType>,
    ) -> Result<bool, RegistryError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM user_subscriptions
                WHERE user_id = $1 AND ($2::TEXT IS NULL OR user_type = $2)
            ) AS active
            "#,
        )
        .bind(user_id)
        .bind(user_type.map(|t| t.as_str()))
        .fetch_one(&self.db_pool)
        .await?;

        Ok(row.try_get("active")?)
    }

    async fn tokens_for_user(
        &self,
        user_id: &str,
        user_type: Option<UserType>,
        live_since: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError> {
        let query = sqlx::query(
            r#"
            SELECT DISTINCT token FROM user_subscriptions
            WHERE user_id = $1
              AND ($2::TEXT IS NULL OR user_type = $2)
              AND last_active >= $3
            ORDER BY token
            "#,
        )
        .bind(user_id)
        .bind(user_type.map(|t| t.as_str()))
        .bind(live_since);

        self.fetch_tokens(query).await
    }

    async fn tokens_for_role(
        &self,
        user_type: UserType,
        live_since: OffsetDateTime,
    ) -> Result<Vec<String>, RegistryError> {
        let query = sqlx::query(
            r#"
            SELECT DISTINCT token FROM user_subscriptions
            WHERE user_type = $1 AND last_active >= $2
            ORDER BY token
            "#,
        )
        .bind(user_type.as_str())
        .bind(live_since);

        self.fetch_tokens(query).await
    }

    async fn all_tokens(&self) -> Result<Vec<String>, RegistryError> {
        let query = sqlx::query("SELECT token FROM device_tokens ORDER BY token");
        self.fetch_tokens(query).await
    }

    async fn rotate_token(
        &self,
        old_token: &str,
        device: &DeviceToken,
    ) -> Result<u64, RegistryError> {
        if old_token == device.token {
            return Ok(0);
        }

        let mut tx = self.db_pool.begin().await?;
        Self::upsert_device(&mut tx, device).await?;

        let moved = sqlx::query(
            r#"
            INSERT INTO user_subscriptions (token, user_id, user_type, active_session_id, last_active, topics)
            SELECT $2, user_id, user_type, active_session_id, last_active, topics
            FROM user_subscriptions
            WHERE token = $1
            ON CONFLICT (token, user_id, user_type) DO UPDATE
            SET last_active = GREATEST(user_subscriptions.last_active, EXCLUDED.last_active)
            "#,
        )
        .bind(old_token)
        .bind(&device.token)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM device_tokens WHERE token = $1")
            .bind(old_token)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.subscriptions_cache.invalidate(old_token).await;
        self.subscriptions_cache.invalidate(&device.token).await;

        info!(
            old = %token_fingerprint(old_token),
            new = %token_fingerprint(&device.token),
            moved,
            "Rotated device token"
        );
        Ok(moved)
    }

    async fn remove_token(&self, token: &str) -> Result<u64, RegistryError> {
        let removed = sqlx::query(
            r#"
            DELETE FROM user_subscriptions WHERE token = $1
            "#,
        )
        .bind(token)
        .execute(&self.db_pool)
        .await?
        .rows_affected();

        sqlx::query("DELETE FROM device_tokens WHERE token = $1")
            .bind(token)
            .execute(&self.db_pool)
            .await?;

        self.subscriptions_cache.invalidate(token).await;
        Ok(removed)
    }

    async fn prune_stale(&self, before: OffsetDateTime) -> Result<u64, RegistryError> {
        let pruned = sqlx::query("DELETE FROM user_subscriptions WHERE last_active < $1")
            .bind(before)
            .execute(&self.db_pool)
            .await?
            .rows_affected();

        let devices = self.delete_orphaned_devices().await?;
        self.subscriptions_cache.invalidate_all();

        if pruned > 0 || devices > 0 {
            info!(pruned, devices, "Pruned stale registrations");
        } else {
            debug!("No stale registrations to prune");
        }
        Ok(pruned)
    }
}
