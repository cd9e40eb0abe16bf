//! Redis cache store.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, FromRedisValue};
use secrecy::ExposeSecret;
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::{session_key, CacheStore, StoreError};
use crate::config::RedisConfig;
use crate::models::CachedSession;

/// Session cache backed by Redis.
///
/// Holds `min_idle_connections` multiplexed connections, used round-robin,
/// and admits at most `pool_size` commands in flight. Transient failures are
/// retried up to `max_retries` times.
#[derive(Clone)]
pub struct RedisCacheStore {
    connections: Arc<Vec<ConnectionManager>>,
    next: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
}

impl RedisCacheStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self, redis::RedisError> {
        tracing::info!(
            pool_size = config.pool_size,
            min_idle = config.min_idle_connections,
            "Connecting to Redis"
        );
        let client = Client::open(config.url.expose_secret().as_str())?;

        let idle = config.min_idle_connections.max(1);
        let mut connections = Vec::with_capacity(idle);
        for _ in 0..idle {
            let manager = client.get_connection_manager().await.map_err(|e| {
                tracing::error!("Failed to get Redis connection manager: {}", e);
                e
            })?;
            connections.push(manager);
        }

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            connections: Arc::new(connections),
            next: Arc::new(AtomicUsize::new(0)),
            permits: Arc::new(Semaphore::new(config.pool_size.max(1))),
            retry: RetryConfig::quick(config.max_retries),
        })
    }

    fn connection(&self) -> ConnectionManager {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[i].clone()
    }

    async fn query<T>(&self, operation: &str, cmd: redis::Cmd) -> Result<T, StoreError>
    where
        T: FromRedisValue + Send,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::Unavailable("redis pool closed".into()))?;

        retry_with_backoff(&self.retry, operation, || {
            let cmd = cmd.clone();
            let mut conn = self.connection();
            async move {
                let value: T = cmd.query_async(&mut conn).await?;
                Ok::<T, StoreError>(value)
            }
        })
        .await
    }
}

/// Redis rejects `PX 0`; sub-millisecond TTLs round up.
fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_millis() as u64;
    if ttl.subsec_nanos() % 1_000_000 > 0 {
        millis + 1
    } else {
        millis.max(1)
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        let _: String = self.query("redis.ping", redis::cmd("PING")).await?;
        Ok(())
    }

    async fn put_session(
        &self,
        token_hash: &str,
        session: &CachedSession,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(session)?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(session_key(token_hash))
            .arg(payload)
            .arg("PX")
            .arg(ttl_millis(ttl));

        self.query::<()>("redis.put_session", cmd).await
    }

    async fn get_session(&self, token_hash: &str) -> Result<Option<CachedSession>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(session_key(token_hash));

        let raw: Option<String> = self.query("redis.get_session", cmd).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete_sessions(&self, token_hashes: &[String]) -> Result<(), StoreError> {
        if token_hashes.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = token_hashes.iter().map(|h| session_key(h)).collect();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);

        let _: i64 = self.query("redis.delete_sessions", cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use secrecy::Secret;
    use uuid::Uuid;

    #[test]
    fn ttl_is_never_zero_and_rounds_up() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_micros(1500)), 2);
        assert_eq!(ttl_millis(Duration::from_secs(300)), 300_000);
    }

    #[tokio::test]
    async fn malformed_url_fails_as_a_redis_error() {
        let config = RedisConfig {
            url: Secret::new("not a redis url".to_string()),
            pool_size: 1,
            min_idle_connections: 1,
            max_retries: 0,
            operation_timeout_ms: 100,
        };
        let err = match RedisCacheStore::connect(&config).await {
            Ok(_) => panic!("malformed URL connected"),
            Err(e) => e,
        };
        let app_err = service_core::error::AppError::from(err);
        assert!(matches!(app_err, service_core::error::AppError::RedisError(_)));
        assert_eq!(app_err.exit_code(), 69);
    }

    #[tokio::test]
    #[ignore] // Requires running Redis
    async fn test_put_get_delete() {
        let config = RedisConfig {
            url: Secret::new("redis://127.0.0.1:6379".to_string()),
            pool_size: 4,
            min_idle_connections: 2,
            max_retries: 1,
            operation_timeout_ms: 500,
        };
        let store = RedisCacheStore::connect(&config).await.unwrap();
        store.health_check().await.unwrap();

        let hash = Uuid::new_v4().to_string();
        let payload = CachedSession {
            user_public_id: Uuid::new_v4(),
            created_utc: Utc::now(),
            last_activity_utc: Utc::now(),
            expiry_utc: Utc::now() + chrono::Duration::minutes(5),
        };
        store
            .put_session(&hash, &payload, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(store.get_session(&hash).await.unwrap(), Some(payload));

        store.delete_sessions(&[hash.clone()]).await.unwrap();
        assert_eq!(store.get_session(&hash).await.unwrap(), None);
    }
}
