use chrono::{DateTime, Utc};
use secrecy::Secret;
use service_core::config::{self as core_config, get_env, get_env_parsed};
use service_core::error::AppError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AuthCoreConfig {
    pub common: core_config::Config,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub session: SessionConfig,
    pub password: PasswordConfig,
    pub totp: TotpConfig,
}

/// Relational store endpoint and pool tuning.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_open_connections: u32,
    pub max_idle_connections: u32,
    pub connection_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    /// Upper bound on a single store call.
    pub operation_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Default pool tuning for `url`.
    pub fn for_url(url: &str) -> Self {
        Self {
            url: Secret::new(url.to_string()),
            max_open_connections: 20,
            max_idle_connections: 5,
            connection_timeout_secs: 5,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            operation_timeout_ms: 2000,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Cache store endpoint and pool tuning.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: Secret<String>,
    pub pool_size: usize,
    pub min_idle_connections: usize,
    pub max_retries: u32,
    pub operation_timeout_ms: u64,
}

impl RedisConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// Expiry is fixed at login.
    Fixed,
    /// Each validated use pushes expiry out, never past the absolute cap.
    Sliding,
}

impl std::str::FromStr for ExpiryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" => Ok(ExpiryPolicy::Fixed),
            "sliding" => Ok(ExpiryPolicy::Sliding),
            _ => Err(format!("Invalid session expiry policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub lifetime_secs: u64,
    pub policy: ExpiryPolicy,
    /// How far a validated use pushes expiry under [`ExpiryPolicy::Sliding`].
    pub sliding_extension_secs: u64,
    /// Absolute cap on a session's age under [`ExpiryPolicy::Sliding`].
    pub max_lifetime_secs: u64,
    /// Upper bound on a cache entry's TTL.
    pub cache_ttl_secs: u64,
    /// Minimum gap between recorded activity updates for one session.
    pub activity_interval_secs: u64,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime_secs: 24 * 3600,
            policy: ExpiryPolicy::Fixed,
            sliding_extension_secs: 3600,
            max_lifetime_secs: 7 * 24 * 3600,
            cache_ttl_secs: 300,
            activity_interval_secs: 60,
            sweep_interval_secs: 60,
            sweep_batch_size: 500,
        }
    }
}

impl SessionConfig {
    pub fn lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lifetime_secs as i64)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn activity_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.activity_interval_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Expiry to record after a validated use at `now`, or `None` when the
    /// policy leaves it unchanged. Never earlier than `current`, never past
    /// `created + max_lifetime`.
    pub fn extended_expiry(
        &self,
        created: DateTime<Utc>,
        current: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self.policy {
            ExpiryPolicy::Fixed => None,
            ExpiryPolicy::Sliding => {
                let cap = created + chrono::Duration::seconds(self.max_lifetime_secs as i64);
                let candidate =
                    (now + chrono::Duration::seconds(self.sliding_extension_secs as i64)).min(cap);
                (candidate > current).then_some(candidate)
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.lifetime_secs == 0 {
            return Err("SESSION_LIFETIME_SECS must be positive".into());
        }
        if self.cache_ttl_secs == 0 {
            return Err("SESSION_CACHE_TTL_SECS must be positive".into());
        }
        if self.sweep_interval_secs == 0 || self.sweep_batch_size <= 0 {
            return Err("Session sweep interval and batch size must be positive".into());
        }
        if self.policy == ExpiryPolicy::Sliding {
            if self.sliding_extension_secs == 0 {
                return Err("SESSION_SLIDING_EXTENSION_SECS must be positive".into());
            }
            if self.max_lifetime_secs < self.lifetime_secs {
                return Err(
                    "SESSION_MAX_LIFETIME_SECS must not be shorter than SESSION_LIFETIME_SECS"
                        .into(),
                );
            }
        }
        Ok(())
    }
}

/// Argon2id cost parameters for new password hashes.
#[derive(Debug, Clone)]
pub struct PasswordConfig {
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            argon2_memory_kib: 19 * 1024,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        }
    }
}

/// RFC 6238 parameters.
#[derive(Debug, Clone)]
pub struct TotpConfig {
    pub step_secs: u64,
    pub digits: usize,
    /// Steps accepted either side of the current one.
    pub skew_steps: u8,
    pub issuer: String,
}

impl Default for TotpConfig {
    fn default() -> Self {
        Self {
            step_secs: 30,
            digits: 6,
            skew_steps: 1,
            issuer: "auth-core".to_string(),
        }
    }
}

impl AuthCoreConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = common.is_prod();

        let config = AuthCoreConfig {
            database: DatabaseConfig {
                url: Secret::new(get_env("DATABASE_URL", None, is_prod)?),
                max_open_connections: get_env_parsed("DATABASE_MAX_OPEN_CONNECTIONS", Some("20"), is_prod)?,
                max_idle_connections: get_env_parsed("DATABASE_MAX_IDLE_CONNECTIONS", Some("5"), is_prod)?,
                connection_timeout_secs: get_env_parsed("DATABASE_CONNECTION_TIMEOUT_SECS", Some("5"), is_prod)?,
                idle_timeout_secs: get_env_parsed("DATABASE_IDLE_TIMEOUT_SECS", Some("600"), is_prod)?,
                max_lifetime_secs: get_env_parsed("DATABASE_MAX_LIFETIME_SECS", Some("1800"), is_prod)?,
                operation_timeout_ms: get_env_parsed("DATABASE_OPERATION_TIMEOUT_MS", Some("2000"), is_prod)?,
            },
            redis: RedisConfig {
                url: Secret::new(get_env("REDIS_URL", None, is_prod)?),
                pool_size: get_env_parsed("REDIS_POOL_SIZE", Some("16"), is_prod)?,
                min_idle_connections: get_env_parsed("REDIS_MIN_IDLE_CONNECTIONS", Some("2"), is_prod)?,
                max_retries: get_env_parsed("REDIS_MAX_RETRIES", Some("2"), is_prod)?,
                operation_timeout_ms: get_env_parsed("REDIS_OPERATION_TIMEOUT_MS", Some("250"), is_prod)?,
            },
            session: SessionConfig {
                lifetime_secs: get_env_parsed("SESSION_LIFETIME_SECS", Some("86400"), is_prod)?,
                policy: get_env("SESSION_EXPIRY_POLICY", Some("fixed"), is_prod)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
                sliding_extension_secs: get_env_parsed("SESSION_SLIDING_EXTENSION_SECS", Some("3600"), is_prod)?,
                max_lifetime_secs: get_env_parsed("SESSION_MAX_LIFETIME_SECS", Some("604800"), is_prod)?,
                cache_ttl_secs: get_env_parsed("SESSION_CACHE_TTL_SECS", Some("300"), is_prod)?,
                activity_interval_secs: get_env_parsed("SESSION_ACTIVITY_INTERVAL_SECS", Some("60"), is_prod)?,
                sweep_interval_secs: get_env_parsed("SESSION_SWEEP_INTERVAL_SECS", Some("60"), is_prod)?,
                sweep_batch_size: get_env_parsed("SESSION_SWEEP_BATCH_SIZE", Some("500"), is_prod)?,
            },
            password: PasswordConfig {
                argon2_memory_kib: get_env_parsed("ARGON2_MEMORY_KIB", Some("19456"), is_prod)?,
                argon2_iterations: get_env_parsed("ARGON2_ITERATIONS", Some("2"), is_prod)?,
                argon2_parallelism: get_env_parsed("ARGON2_PARALLELISM", Some("1"), is_prod)?,
            },
            totp: TotpConfig {
                step_secs: get_env_parsed("TOTP_STEP_SECS", Some("30"), is_prod)?,
                digits: get_env_parsed("TOTP_DIGITS", Some("6"), is_prod)?,
                skew_steps: get_env_parsed("TOTP_SKEW_STEPS", Some("1"), is_prod)?,
                issuer: get_env("TOTP_ISSUER", Some("auth-core"), is_prod)?,
            },
            common,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let fail = |msg: String| Err(AppError::ConfigError(anyhow::anyhow!(msg)));

        if self.database.max_open_connections == 0 {
            return fail("DATABASE_MAX_OPEN_CONNECTIONS must be greater than 0".into());
        }
        if self.database.max_idle_connections > self.database.max_open_connections {
            return fail("DATABASE_MAX_IDLE_CONNECTIONS must not exceed DATABASE_MAX_OPEN_CONNECTIONS".into());
        }
        if self.database.operation_timeout_ms == 0 || self.redis.operation_timeout_ms == 0 {
            return fail("Store operation timeouts must be positive".into());
        }
        if self.redis.pool_size == 0 {
            return fail("REDIS_POOL_SIZE must be greater than 0".into());
        }
        if self.redis.min_idle_connections > self.redis.pool_size {
            return fail("REDIS_MIN_IDLE_CONNECTIONS must not exceed REDIS_POOL_SIZE".into());
        }
        if let Err(msg) = self.session.validate() {
            return fail(msg);
        }
        if self.totp.step_secs == 0 || !(6..=8).contains(&self.totp.digits) {
            return fail("TOTP_STEP_SECS must be positive and TOTP_DIGITS between 6 and 8".into());
        }

        if self.common.is_prod() && self.password.argon2_memory_kib < PasswordConfig::default().argon2_memory_kib {
            tracing::warn!("Argon2 memory cost is below the recommended minimum in production");
        }

        Ok(())
    }
}
