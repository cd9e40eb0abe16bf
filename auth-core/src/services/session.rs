//! Login, validation and revocation.
//!
//! The durable store is the source of truth. Every session is written there
//! before it is cached, validation falls back to it whenever the cache has
//! nothing usable, and revocation deletes there first. Cache entries live at
//! most `cache_ttl` and never past the session's own expiry, which bounds
//! how long a revoked token can still pass a cache hit.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::AuthError;
use super::token::{fingerprint, hash_token, SessionToken};
use super::verifier::CredentialVerifier;
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::models::{CachedSession, ClientMeta, LoginRecord, Session};
use crate::store::{with_timeout, CacheStore, DurableStore, StoreError, StoreTimeouts};

/// Fresh tokens drawn per login before a collision is treated as a fault.
const TOKEN_ATTEMPTS: u32 = 2;

#[derive(Debug)]
pub struct LoginOutcome {
    pub token: SessionToken,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSession {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub durable: bool,
    pub cache: bool,
}

pub struct SessionManager {
    durable: Arc<dyn DurableStore>,
    cache: Arc<dyn CacheStore>,
    verifier: Arc<CredentialVerifier>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    timeouts: StoreTimeouts,
}

impl SessionManager {
    pub fn new(
        durable: Arc<dyn DurableStore>,
        cache: Arc<dyn CacheStore>,
        verifier: Arc<CredentialVerifier>,
        clock: Arc<dyn Clock>,
        config: SessionConfig,
        timeouts: StoreTimeouts,
    ) -> Result<Self, AuthError> {
        config.validate().map_err(AuthError::Configuration)?;

        Ok(Self {
            durable,
            cache,
            verifier,
            clock,
            config,
            timeouts,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn durable_store(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    pub(crate) fn verifier(&self) -> &Arc<CredentialVerifier> {
        &self.verifier
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn timeouts(&self) -> StoreTimeouts {
        self.timeouts
    }

    // ==================== Login ====================

    /// Verify credentials and open a new session.
    #[instrument(skip_all)]
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        second_factor: Option<&str>,
        client: ClientMeta,
    ) -> Result<LoginOutcome, AuthError> {
        let record = self
            .durable_call(self.durable.find_login_by_email(email))
            .await?;

        let record = match record {
            Some(record) => record,
            None => {
                // Same Argon2 work as a wrong password.
                let verifier = self.verifier.clone();
                let presented = password.to_owned();
                tokio::task::spawn_blocking(move || verifier.verify_against_dummy(&presented))
                    .await?;
                info!("Login rejected: invalid credentials");
                return Err(AuthError::InvalidCredentials);
            }
        };

        if !self
            .check_password(&record.credentials.password_hash, password)
            .await?
        {
            info!(user_id = %record.public_id, "Login rejected: invalid credentials");
            return Err(AuthError::InvalidCredentials);
        }

        if let Some(secret) = record.credentials.second_factor_secret() {
            let now = self.clock.now();
            let accepted = second_factor
                .map(|code| self.verifier.verify_second_factor_at(secret, code, now))
                .unwrap_or(false);
            if !accepted {
                warn!(
                    user_id = %record.public_id,
                    code_present = second_factor.is_some(),
                    "Login rejected: second factor"
                );
                return Err(AuthError::InvalidSecondFactor);
            }
        }

        let (token, session) = self.open_session(&record, &client).await?;
        self.cache_session(&session.token_hash, &CachedSession::from(&session))
            .await;

        info!(
            user_id = %record.public_id,
            session = %fingerprint(&session.token_hash),
            expires_at = %session.expiry_utc,
            "Login succeeded"
        );

        Ok(LoginOutcome {
            token,
            user_id: record.public_id,
            expires_at: session.expiry_utc,
        })
    }

    async fn check_password(&self, stored_hash: &str, presented: &str) -> Result<bool, AuthError> {
        let verifier = self.verifier.clone();
        let stored_hash = stored_hash.to_owned();
        let presented = presented.to_owned();
        let matched =
            tokio::task::spawn_blocking(move || verifier.verify_password(&stored_hash, &presented))
                .await?;
        Ok(matched)
    }

    /// Persist a new session row. The token's uniqueness is left to the
    /// store's constraint; a collision gets one retry with a fresh token.
    async fn open_session(
        &self,
        record: &LoginRecord,
        client: &ClientMeta,
    ) -> Result<(SessionToken, Session), AuthError> {
        for attempt in 1..=TOKEN_ATTEMPTS {
            let token = SessionToken::generate();
            let session = Session::new(
                token.hash(),
                record.credentials.user_id,
                record.public_id,
                self.clock.now(),
                self.config.lifetime(),
                client,
            );

            match with_timeout(self.timeouts.durable, self.durable.insert_session(&session)).await {
                Ok(()) => return Ok((token, session)),
                Err(StoreError::UniqueViolation(constraint)) => {
                    warn!(
                        user_id = %record.public_id,
                        constraint = %constraint,
                        attempt,
                        "Session token collided"
                    );
                }
                Err(e) => {
                    error!(user_id = %record.public_id, error = %e, "Failed to persist session");
                    return Err(e.into());
                }
            }
        }

        error!(user_id = %record.public_id, "Session token collided on every attempt");
        Err(AuthError::Internal("could not allocate a unique session token".into()))
    }

    // ==================== Validation ====================

    /// Resolve a presented token to its user.
    #[instrument(skip_all)]
    pub async fn validate(&self, token: &str) -> Result<ValidatedSession, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidSession);
        }
        let token_hash = hash_token(token);
        let now = self.clock.now();

        match with_timeout(self.timeouts.cache, self.cache.get_session(&token_hash)).await {
            Ok(Some(cached)) if cached.is_valid_at(now) => {
                let user_id = cached.user_public_id;
                let expires_at = self.record_activity(&token_hash, cached, now);
                return Ok(ValidatedSession {
                    user_id,
                    expires_at,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    session = %fingerprint(&token_hash),
                    error = %e,
                    "Session cache unavailable, using durable store"
                );
            }
        }

        let session = match self
            .durable_call(self.durable.find_session(&token_hash))
            .await?
        {
            Some(session) => session,
            None => {
                debug!(session = %fingerprint(&token_hash), "Unknown session");
                return Err(AuthError::InvalidSession);
            }
        };

        if session.is_expired_at(now) {
            self.expire(&token_hash).await;
            return Err(AuthError::InvalidSession);
        }

        let payload = CachedSession::from(&session);
        self.cache_session(&token_hash, &payload).await;
        let expires_at = self.record_activity(&token_hash, payload, now);

        Ok(ValidatedSession {
            user_id: session.user_public_id,
            expires_at,
        })
    }

    /// Apply the activity and expiry policy to a validated use. At most one
    /// write per `activity_interval`, sliding extensions included. Writes
    /// happen in the background; the returned expiry is the one they record.
    fn record_activity(
        &self,
        token_hash: &str,
        payload: CachedSession,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if now - payload.last_activity_utc < self.config.activity_interval() {
            return payload.expiry_utc;
        }
        let extended = self
            .config
            .extended_expiry(payload.created_utc, payload.expiry_utc, now);

        let mut updated = payload;
        updated.last_activity_utc = updated.last_activity_utc.max(now);
        if let Some(expiry) = extended {
            updated.expiry_utc = expiry;
        }
        let expires_at = updated.expiry_utc;

        let durable = self.durable.clone();
        let cache = self.cache.clone();
        let timeouts = self.timeouts;
        let cache_ttl = self.cache_ttl(expires_at, now);
        let token_hash = token_hash.to_owned();

        tokio::spawn(async move {
            let touched = with_timeout(
                timeouts.durable,
                durable.touch_session(&token_hash, updated.last_activity_utc, updated.expiry_utc),
            )
            .await;

            match touched {
                Ok(true) => {
                    if let Some(ttl) = cache_ttl {
                        if let Err(e) = with_timeout(
                            timeouts.cache,
                            cache.put_session(&token_hash, &updated, ttl),
                        )
                        .await
                        {
                            warn!(session = %fingerprint(&token_hash), error = %e, "Failed to refresh cached session");
                        }
                    }
                }
                // Revoked meanwhile; keep it out of the cache.
                Ok(false) => {
                    let _ = with_timeout(
                        timeouts.cache,
                        cache.delete_sessions(std::slice::from_ref(&token_hash)),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(session = %fingerprint(&token_hash), error = %e, "Failed to record session activity");
                }
            }
        });

        expires_at
    }

    /// Lazy expiry: drop a session found past its expiry.
    async fn expire(&self, token_hash: &str) {
        match with_timeout(self.timeouts.durable, self.durable.delete_session(token_hash)).await {
            Ok(_) => debug!(session = %fingerprint(token_hash), "Expired session removed"),
            Err(e) => {
                warn!(session = %fingerprint(token_hash), error = %e, "Failed to remove expired session")
            }
        }
        self.evict(&[token_hash.to_owned()]).await;
    }

    // ==================== Revocation ====================

    /// Revoke one session. Unknown tokens are acknowledged.
    #[instrument(skip_all)]
    pub async fn logout(&self, token: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Ok(());
        }
        let token_hash = hash_token(token);

        let removed = self
            .durable_call(self.durable.delete_session(&token_hash))
            .await?;
        self.evict(&[token_hash.clone()]).await;

        info!(session = %fingerprint(&token_hash), removed, "Logout");
        Ok(())
    }

    /// Revoke every session of a user. Returns how many were removed.
    #[instrument(skip(self))]
    pub async fn logout_all(&self, user_id: Uuid) -> Result<usize, AuthError> {
        let user = match self
            .durable_call(self.durable.find_user_by_public_id(user_id))
            .await?
        {
            Some(user) => user,
            None => return Ok(0),
        };

        let revoked = self.revoke_user_sessions(user.user_id).await?;
        info!(user_id = %user_id, revoked, "Logged out everywhere");
        Ok(revoked)
    }

    pub(crate) async fn revoke_user_sessions(&self, user_id: i64) -> Result<usize, AuthError> {
        let hashes = self
            .durable_call(self.durable.delete_user_sessions(user_id))
            .await?;
        self.evict(&hashes).await;
        Ok(hashes.len())
    }

    /// Best-effort removal of cache entries.
    pub(crate) async fn evict(&self, token_hashes: &[String]) {
        if token_hashes.is_empty() {
            return;
        }
        if let Err(e) =
            with_timeout(self.timeouts.cache, self.cache.delete_sessions(token_hashes)).await
        {
            warn!(
                count = token_hashes.len(),
                error = %e,
                "Failed to evict cached sessions; entries lapse with their TTL"
            );
        }
    }

    // ==================== Health ====================

    pub async fn health(&self) -> HealthReport {
        let durable = with_timeout(self.timeouts.durable, self.durable.health_check())
            .await
            .is_ok();
        let cache = with_timeout(self.timeouts.cache, self.cache.health_check())
            .await
            .is_ok();
        HealthReport { durable, cache }
    }

    // ==================== Helpers ====================

    /// A durable call under its timeout, logged when it fails.
    pub(crate) async fn durable_call<T, F>(&self, call: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        with_timeout(self.timeouts.durable, call).await.map_err(|e| {
            error!(error = %e, "Durable store call failed");
            AuthError::from(e)
        })
    }

    async fn cache_session(&self, token_hash: &str, payload: &CachedSession) {
        let ttl = match self.cache_ttl(payload.expiry_utc, self.clock.now()) {
            Some(ttl) => ttl,
            None => return,
        };
        if let Err(e) = with_timeout(
            self.timeouts.cache,
            self.cache.put_session(token_hash, payload, ttl),
        )
        .await
        {
            warn!(session = %fingerprint(token_hash), error = %e, "Failed to cache session");
        }
    }

    /// `cache_ttl`, shortened to the time the session has left.
    fn cache_ttl(&self, expiry: DateTime<Utc>, now: DateTime<Utc>) -> Option<Duration> {
        let remaining = (expiry - now).to_std().ok()?;
        if remaining.is_zero() {
            return None;
        }
        Some(remaining.min(self.config.cache_ttl()))
    }
}
