//! Login session model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::net::IpAddr;
use uuid::Uuid;

/// Durable session row.
///
/// Sessions are keyed by the SHA-256 of the bearer token; the raw token is
/// only ever held by the client.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub token_hash: String,
    pub user_id: i64,
    pub user_public_id: Uuid,
    pub created_utc: DateTime<Utc>,
    pub last_activity_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Session {
    /// Create a session starting at `now`. `lifetime` must be positive.
    pub fn new(
        token_hash: String,
        user_id: i64,
        user_public_id: Uuid,
        now: DateTime<Utc>,
        lifetime: Duration,
        client: &ClientMeta,
    ) -> Self {
        debug_assert!(lifetime > Duration::zero());
        Self {
            token_hash,
            user_id,
            user_public_id,
            created_utc: now,
            last_activity_utc: now,
            expiry_utc: now + lifetime,
            ip_address: client.ip_address.map(|ip| ip.to_string()),
            user_agent: client.user_agent.clone(),
        }
    }

    /// Valid strictly before `expiry_utc`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry_utc
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_valid_at(now)
    }
}

/// Where a login came from.
#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip_address: Option<IpAddr>,
    pub user_agent: Option<String>,
}

impl ClientMeta {
    pub fn new(ip_address: Option<IpAddr>, user_agent: Option<String>) -> Self {
        Self {
            ip_address,
            user_agent,
        }
    }
}

/// Minimal validation payload kept in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSession {
    pub user_public_id: Uuid,
    pub created_utc: DateTime<Utc>,
    pub last_activity_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
}

impl CachedSession {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expiry_utc
    }
}

impl From<&Session> for CachedSession {
    fn from(s: &Session) -> Self {
        Self {
            user_public_id: s.user_public_id,
            created_utc: s.created_utc,
            last_activity_utc: s.last_activity_utc,
            expiry_utc: s.expiry_utc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_at(now: DateTime<Utc>) -> Session {
        Session::new(
            "ab".repeat(32),
            1,
            Uuid::new_v4(),
            now,
            Duration::seconds(60),
            &ClientMeta::new(Some("10.0.0.1".parse().unwrap()), Some("curl/8".into())),
        )
    }

    #[test]
    fn expiry_is_after_creation() {
        let now = Utc::now();
        let s = session_at(now);
        assert!(s.expiry_utc > s.created_utc);
        assert_eq!(s.last_activity_utc, s.created_utc);
        assert_eq!(s.ip_address.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn validity_boundary_is_exclusive() {
        let now = Utc::now();
        let s = session_at(now);
        let one = Duration::milliseconds(1);
        assert!(s.is_valid_at(s.expiry_utc - one));
        assert!(s.is_expired_at(s.expiry_utc));
        assert!(s.is_expired_at(s.expiry_utc + one));
    }

    #[test]
    fn cached_payload_mirrors_the_row() {
        let s = session_at(Utc::now());
        let cached = CachedSession::from(&s);
        assert_eq!(cached.user_public_id, s.user_public_id);
        assert_eq!(cached.expiry_utc, s.expiry_utc);
    }
}
