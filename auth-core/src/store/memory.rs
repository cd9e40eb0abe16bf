//! In-process store implementations with fault injection.
//!
//! They honour the same contracts as the PostgreSQL and Redis adapters and
//! back the test suite and local experiments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{CacheStore, DurableStore, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::models::{
    normalize_email, Address, CachedSession, Credentials, LoginRecord, NewAddress, NewUser,
    Profile, Session, User,
};

/// Switches shared by both in-memory stores.
#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl Faults {
    async fn apply(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|e| StoreError::Backend(format!("Memory store mutex poisoned: {}", e)))
}

#[derive(Default)]
struct DurableState {
    next_user_id: i64,
    next_address_id: i64,
    users: HashMap<i64, User>,
    credentials: HashMap<i64, Credentials>,
    profiles: HashMap<i64, Profile>,
    addresses: Vec<Address>,
    sessions: HashMap<String, Session>,
}

impl DurableState {
    fn remove_sessions_where(&mut self, pred: impl Fn(&Session) -> bool) -> Vec<String> {
        let hashes: Vec<String> = self
            .sessions
            .values()
            .filter(|s| pred(s))
            .map(|s| s.token_hash.clone())
            .collect();
        for h in &hashes {
            self.sessions.remove(h);
        }
        hashes
    }
}

pub struct MemoryDurableStore {
    state: Mutex<DurableState>,
    clock: Arc<dyn Clock>,
    faults: Faults,
    forced_session_collisions: AtomicU32,
    touches: AtomicU64,
}

impl Default for MemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(DurableState::default()),
            clock,
            faults: Faults::default(),
            forced_session_collisions: AtomicU32::new(0),
            touches: AtomicU64::new(0),
        }
    }

    /// Make every call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Report a token collision on the next `n` session inserts.
    pub fn force_session_collisions(&self, n: u32) {
        self.forced_session_collisions.store(n, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        lock(&self.state).map(|s| s.sessions.len()).unwrap_or(0)
    }

    pub fn session(&self, token_hash: &str) -> Option<Session> {
        lock(&self.state)
            .ok()
            .and_then(|s| s.sessions.get(token_hash).cloned())
    }

    pub fn contains_session(&self, token_hash: &str) -> bool {
        self.session(token_hash).is_some()
    }

    pub fn address_count(&self) -> usize {
        lock(&self.state).map(|s| s.addresses.len()).unwrap_or(0)
    }

    /// Activity writes that reached the store.
    pub fn touch_count(&self) -> u64 {
        self.touches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.faults.apply().await
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        self.faults.apply().await?;
        let mut state = lock(&self.state)?;

        let email = normalize_email(&user.email);
        if state
            .credentials
            .values()
            .any(|c| normalize_email(&c.email) == email)
        {
            return Err(StoreError::UniqueViolation("user_credentials_email_key".into()));
        }
        if state.users.values().any(|u| u.public_id == user.public_id) {
            return Err(StoreError::UniqueViolation("users_public_id_key".into()));
        }

        state.next_user_id += 1;
        let user_id = state.next_user_id;
        let now = self.clock.now();
        let record = User {
            user_id,
            public_id: user.public_id,
            created_utc: now,
            updated_utc: now,
        };

        state.users.insert(user_id, record.clone());
        state.credentials.insert(
            user_id,
            Credentials {
                user_id,
                email: user.email,
                password_hash: user.password_hash,
                two_factor_enabled: false,
                two_factor_secret: None,
            },
        );
        state.profiles.insert(
            user_id,
            Profile {
                user_id,
                first_name: user.profile.first_name,
                last_name: user.profile.last_name,
                date_of_birth: user.profile.date_of_birth,
                phone_number: user.profile.phone_number,
                profile_picture: user.profile.profile_picture,
            },
        );

        Ok(record)
    }

    async fn find_user_by_public_id(&self, public_id: Uuid) -> Result<Option<User>, StoreError> {
        self.faults.apply().await?;
        let state = lock(&self.state)?;
        Ok(state.users.values().find(|u| u.public_id == public_id).cloned())
    }

    async fn find_login_by_email(&self, email: &str) -> Result<Option<LoginRecord>, StoreError> {
        self.faults.apply().await?;
        let state = lock(&self.state)?;
        let email = normalize_email(email);

        let found = state
            .credentials
            .values()
            .find(|c| normalize_email(&c.email) == email)
            .and_then(|c| {
                state.users.get(&c.user_id).map(|u| LoginRecord {
                    public_id: u.public_id,
                    credentials: c.clone(),
                })
            });
        Ok(found)
    }

    async fn find_credentials(&self, user_id: i64) -> Result<Option<Credentials>, StoreError> {
        self.faults.apply().await?;
        Ok(lock(&self.state)?.credentials.get(&user_id).cloned())
    }

    async fn find_profile(&self, user_id: i64) -> Result<Option<Profile>, StoreError> {
        self.faults.apply().await?;
        Ok(lock(&self.state)?.profiles.get(&user_id).cloned())
    }

    async fn update_password_hash(
        &self,
        user_id: i64,
        password_hash: &str,
    ) -> Result<(), StoreError> {
        self.faults.apply().await?;
        let mut state = lock(&self.state)?;
        let now = self.clock.now();
        let creds = state
            .credentials
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("credentials for user {}", user_id)))?;
        creds.password_hash = password_hash.to_string();
        if let Some(user) = state.users.get_mut(&user_id) {
            user.updated_utc = now;
        }
        Ok(())
    }

    async fn set_second_factor(
        &self,
        user_id: i64,
        secret: Option<&str>,
    ) -> Result<(), StoreError> {
        self.faults.apply().await?;
        let mut state = lock(&self.state)?;
        let creds = state
            .credentials
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("credentials for user {}", user_id)))?;
        creds.two_factor_enabled = secret.is_some();
        creds.two_factor_secret = secret.map(str::to_string);
        Ok(())
    }

    async fn delete_user(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        self.faults.apply().await?;
        let mut state = lock(&self.state)?;
        if state.users.remove(&user_id).is_none() {
            return Ok(Vec::new());
        }
        state.credentials.remove(&user_id);
        state.profiles.remove(&user_id);
        state.addresses.retain(|a| a.user_id != user_id);
        Ok(state.remove_sessions_where(|s| s.user_id == user_id))
    }

    async fn add_address(&self, user_id: i64, address: NewAddress) -> Result<Address, StoreError> {
        self.faults.apply().await?;
        let mut state = lock(&self.state)?;
        if !state.users.contains_key(&user_id) {
            return Err(StoreError::NotFound(format!("user {}", user_id)));
        }

        if address.is_primary {
            for existing in state.addresses.iter_mut().filter(|a| a.user_id == user_id) {
                existing.is_primary = false;
            }
        }

        state.next_address_id += 1;
        let record = Address {
            address_id: state.next_address_id,
            user_id,
            address_line_1: address.address_line_1,
            address_line_2: address.address_line_2,
            city: address.city,
            state: address.state,
            country: address.country,
            postal_code: address.postal_code,
            is_primary: address.is_primary,
        };
        state.addresses.push(record.clone());
        Ok(record)
    }

    async fn list_addresses(&self, user_id: i64) -> Result<Vec<Address>, StoreError> {
        self.faults.apply().await?;
        let state = lock(&self.state)?;
        Ok(state
            .addresses
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.faults.apply().await?;

        let forced = self
            .forced_session_collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced {
            return Err(StoreError::UniqueViolation("user_sessions_pkey".into()));
        }

        let mut state = lock(&self.state)?;
        if !state.users.contains_key(&session.user_id) {
            return Err(StoreError::Backend(format!(
                "foreign key violation: user {}",
                session.user_id
            )));
        }
        if state.sessions.contains_key(&session.token_hash) {
            return Err(StoreError::UniqueViolation("user_sessions_pkey".into()));
        }
        state
            .sessions
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, token_hash: &str) -> Result<Option<Session>, StoreError> {
        self.faults.apply().await?;
        Ok(lock(&self.state)?.sessions.get(token_hash).cloned())
    }

    async fn touch_session(
        &self,
        token_hash: &str,
        last_activity: DateTime<Utc>,
        expiry: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.faults.apply().await?;
        self.touches.fetch_add(1, Ordering::SeqCst);
        let mut state = lock(&self.state)?;
        match state.sessions.get_mut(token_hash) {
            Some(session) => {
                session.last_activity_utc = session.last_activity_utc.max(last_activity);
                session.expiry_utc = session.expiry_utc.max(expiry);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_session(&self, token_hash: &str) -> Result<bool, StoreError> {
        self.faults.apply().await?;
        Ok(lock(&self.state)?.sessions.remove(token_hash).is_some())
    }

    async fn delete_user_sessions(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        self.faults.apply().await?;
        Ok(lock(&self.state)?.remove_sessions_where(|s| s.user_id == user_id))
    }

    async fn delete_expired_sessions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, StoreError> {
        self.faults.apply().await?;
        let mut state = lock(&self.state)?;
        let mut expired: Vec<(DateTime<Utc>, String)> = state
            .sessions
            .values()
            .filter(|s| s.expiry_utc <= now)
            .map(|s| (s.expiry_utc, s.token_hash.clone()))
            .collect();
        expired.sort();
        expired.truncate(limit.max(0) as usize);

        let hashes: Vec<String> = expired.into_iter().map(|(_, h)| h).collect();
        for h in &hashes {
            state.sessions.remove(h);
        }
        Ok(hashes)
    }
}

struct CacheEntry {
    session: CachedSession,
    evict_at: DateTime<Utc>,
}

pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    faults: Faults,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Entries are evicted once `clock` passes their TTL.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            faults: Faults::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.faults
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drop every entry, as a cache restart would.
    pub fn flush(&self) {
        if let Ok(mut entries) = lock(&self.entries) {
            entries.clear();
        }
    }

    /// Whether a live entry exists, without touching the hit counters.
    pub fn contains(&self, token_hash: &str) -> bool {
        self.peek(token_hash).is_some()
    }

    pub fn peek(&self, token_hash: &str) -> Option<CachedSession> {
        let now = self.clock.now();
        lock(&self.entries).ok().and_then(|e| {
            e.get(token_hash)
                .filter(|entry| now < entry.evict_at)
                .map(|entry| entry.session.clone())
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.faults.apply().await
    }

    async fn put_session(
        &self,
        token_hash: &str,
        session: &CachedSession,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.faults.apply().await?;
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Backend(format!("invalid ttl: {}", e)))?;
        let evict_at = self.clock.now() + ttl;
        lock(&self.entries)?.insert(
            token_hash.to_string(),
            CacheEntry {
                session: session.clone(),
                evict_at,
            },
        );
        Ok(())
    }

    async fn get_session(&self, token_hash: &str) -> Result<Option<CachedSession>, StoreError> {
        self.faults.apply().await?;
        let now = self.clock.now();
        let mut entries = lock(&self.entries)?;

        let live = match entries.get(token_hash) {
            Some(entry) if now < entry.evict_at => Some(entry.session.clone()),
            Some(_) => {
                entries.remove(token_hash);
                None
            }
            None => None,
        };

        if live.is_some() {
            self.hits.fetch_add(1, Ordering::SeqCst);
        } else {
            self.misses.fetch_add(1, Ordering::SeqCst);
        }
        Ok(live)
    }

    async fn delete_sessions(&self, token_hashes: &[String]) -> Result<(), StoreError> {
        self.faults.apply().await?;
        let mut entries = lock(&self.entries)?;
        for h in token_hashes {
            entries.remove(h);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{ClientMeta, NewProfile};

    fn new_user(email: &str) -> NewUser {
        NewUser {
            public_id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            profile: NewProfile {
                first_name: "Ada".to_string(),
                ..Default::default()
            },
        }
    }

    fn session_for(user: &User, hash: &str, now: DateTime<Utc>, secs: i64) -> Session {
        Session::new(
            hash.to_string(),
            user.user_id,
            user.public_id,
            now,
            chrono::Duration::seconds(secs),
            &ClientMeta::default(),
        )
    }

    #[tokio::test]
    async fn email_uniqueness_ignores_case() {
        let store = MemoryDurableStore::new();
        store.create_user(new_user("a@x.com")).await.unwrap();
        let err = store.create_user(new_user("A@X.COM")).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        let found = store.find_login_by_email("A@x.Com").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn touch_never_moves_backwards() {
        let store = MemoryDurableStore::new();
        let user = store.create_user(new_user("a@x.com")).await.unwrap();
        let now = Utc::now();
        let session = session_for(&user, "h1", now, 60);
        store.insert_session(&session).await.unwrap();

        let touched = store
            .touch_session("h1", now - chrono::Duration::seconds(30), now)
            .await
            .unwrap();
        assert!(touched);
        assert!(!store.touch_session("missing", now, now).await.unwrap());
        let stored = store.session("h1").unwrap();
        assert_eq!(stored.last_activity_utc, session.last_activity_utc);
        assert_eq!(stored.expiry_utc, session.expiry_utc);
    }

    #[tokio::test]
    async fn deleting_a_user_cascades() {
        let store = MemoryDurableStore::new();
        let user = store.create_user(new_user("a@x.com")).await.unwrap();
        let now = Utc::now();
        store.insert_session(&session_for(&user, "h1", now, 60)).await.unwrap();
        store
            .add_address(user.user_id, NewAddress::default())
            .await
            .unwrap();

        let removed = store.delete_user(user.user_id).await.unwrap();
        assert_eq!(removed, vec!["h1".to_string()]);
        assert_eq!(store.session_count(), 0);
        assert_eq!(store.address_count(), 0);
        assert!(store.find_login_by_email("a@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_sessions_are_removed_earliest_first_up_to_limit() {
        let store = MemoryDurableStore::new();
        let user = store.create_user(new_user("a@x.com")).await.unwrap();
        let now = Utc::now();
        store.insert_session(&session_for(&user, "first", now, 1)).await.unwrap();
        store.insert_session(&session_for(&user, "second", now, 2)).await.unwrap();
        store.insert_session(&session_for(&user, "live", now, 3600)).await.unwrap();

        let later = now + chrono::Duration::seconds(10);
        let first = store.delete_expired_sessions(later, 1).await.unwrap();
        assert_eq!(first, vec!["first".to_string()]);
        let rest = store.delete_expired_sessions(later, 10).await.unwrap();
        assert_eq!(rest, vec!["second".to_string()]);
        assert!(store.contains_session("live"));
    }

    #[tokio::test]
    async fn forced_collisions_are_consumed() {
        let store = MemoryDurableStore::new();
        let user = store.create_user(new_user("a@x.com")).await.unwrap();
        store.force_session_collisions(1);

        let s = session_for(&user, "h1", Utc::now(), 60);
        assert!(matches!(
            store.insert_session(&s).await,
            Err(StoreError::UniqueViolation(_))
        ));
        store.insert_session(&s).await.unwrap();
    }

    #[tokio::test]
    async fn outage_is_reported_as_transient() {
        let store = MemoryDurableStore::new();
        store.set_unavailable(true);
        let err = store.find_session("h").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn cache_entries_expire_with_the_clock() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = MemoryCacheStore::with_clock(clock.clone());
        let payload = CachedSession {
            user_public_id: Uuid::new_v4(),
            created_utc: clock.now(),
            last_activity_utc: clock.now(),
            expiry_utc: clock.now() + chrono::Duration::seconds(300),
        };

        cache
            .put_session("h1", &payload, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get_session("h1").await.unwrap(), Some(payload));

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(cache.get_session("h1").await.unwrap(), None);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }
}
