//! Backing store contracts and their implementations.
//!
//! The durable store is the source of truth for users and sessions. The
//! cache store holds a TTL-bound copy of the session validation payload and
//! may lose entries at any time.

mod error;
pub mod memory;
pub mod postgres;
pub mod redis;

pub use error::StoreError;
pub use memory::{MemoryCacheStore, MemoryDurableStore};
pub use postgres::PgDurableStore;
pub use redis::RedisCacheStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{DatabaseConfig, RedisConfig};
use crate::models::{Address, CachedSession, Credentials, LoginRecord, NewAddress, NewUser, Profile, Session, User};

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    // ==================== Users ====================

    /// Insert the user, their credentials and profile atomically.
    /// A taken email yields [`StoreError::UniqueViolation`].
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;

    async fn find_user_by_public_id(&self, public_id: Uuid) -> Result<Option<User>, StoreError>;

    /// Case-insensitive lookup of credentials by email.
    async fn find_login_by_email(&self, email: &str) -> Result<Option<LoginRecord>, StoreError>;

    async fn find_credentials(&self, user_id: i64) -> Result<Option<Credentials>, StoreError>;

    async fn find_profile(&self, user_id: i64) -> Result<Option<Profile>, StoreError>;

    async fn update_password_hash(
        &self,
        user_id: i64,
        password_hash: &str,
    ) -> Result<(), StoreError>;

    /// `Some(secret)` enables the second factor, `None` disables and clears it.
    async fn set_second_factor(
        &self,
        user_id: i64,
        secret: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Delete a user and everything they own. Returns the token hashes of
    /// the sessions removed by the cascade.
    async fn delete_user(&self, user_id: i64) -> Result<Vec<String>, StoreError>;

    // ==================== Addresses ====================

    /// Insert an address. When it is primary, any previous primary address
    /// of the same user is demoted in the same transaction.
    async fn add_address(&self, user_id: i64, address: NewAddress) -> Result<Address, StoreError>;

    async fn list_addresses(&self, user_id: i64) -> Result<Vec<Address>, StoreError>;

    // ==================== Sessions ====================

    /// Insert a session. A token hash collision yields
    /// [`StoreError::UniqueViolation`].
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn find_session(&self, token_hash: &str) -> Result<Option<Session>, StoreError>;

    /// Record activity. Neither timestamp ever moves backwards. Returns
    /// whether the session still exists.
    async fn touch_session(
        &self,
        token_hash: &str,
        last_activity: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Returns whether a row was removed.
    async fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError>;

    /// Remove every session of a user, returning their token hashes.
    async fn delete_user_sessions(&self, user_id: i64) -> Result<Vec<String>, StoreError>;

    /// Remove up to `limit` sessions whose expiry is at or before `now`,
    /// returning their token hashes.
    async fn delete_expired_sessions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    async fn put_session(
        &self,
        token_hash: &str,
        session: &CachedSession,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    async fn get_session(&self, token_hash: &str) -> Result<Option<CachedSession>, StoreError>;

    async fn delete_sessions(&self, token_hashes: &[String]) -> Result<(), StoreError>;
}

/// Cache key for a session token hash.
pub fn session_key(token_hash: &str) -> String {
    format!("session:{}", token_hash)
}

/// Per-call time limits for each store.
#[derive(Debug, Clone, Copy)]
pub struct StoreTimeouts {
    pub durable: Duration,
    pub cache: Duration,
}

impl StoreTimeouts {
    pub fn from_config(database: &DatabaseConfig, redis: &RedisConfig) -> Self {
        Self {
            durable: database.operation_timeout(),
            cache: redis.operation_timeout(),
        }
    }
}

impl Default for StoreTimeouts {
    fn default() -> Self {
        Self {
            durable: Duration::from_secs(2),
            cache: Duration::from_millis(250),
        }
    }
}

/// Run a store call, failing with [`StoreError::Timeout`] past `limit`.
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<(), StoreError> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(session_key("abc"), "session:abc");
    }
}
