//! Shared harness for the session engine integration tests.
//!
//! Everything runs in-process: in-memory stores driven by a manual clock,
//! and Argon2 parameters cheap enough for a test suite.

#![allow(dead_code)]

use auth_core::{
    config::{PasswordConfig, SessionConfig, TotpConfig},
    models::{ClientMeta, NewProfile},
    services::{AccountService, CredentialVerifier, SessionManager},
    store::{MemoryCacheStore, MemoryDurableStore, StoreTimeouts},
    Clock, ManualClock,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const PASSWORD: &str = "correct horse battery";

pub fn cheap_password_config() -> PasswordConfig {
    PasswordConfig {
        argon2_memory_kib: 8,
        argon2_iterations: 1,
        argon2_parallelism: 1,
    }
}

pub struct TestApp {
    pub clock: Arc<ManualClock>,
    pub durable: Arc<MemoryDurableStore>,
    pub cache: Arc<MemoryCacheStore>,
    pub verifier: Arc<CredentialVerifier>,
    pub sessions: Arc<SessionManager>,
    pub accounts: AccountService,
}

impl TestApp {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            session: SessionConfig::default(),
            password: cheap_password_config(),
            timeouts: StoreTimeouts::default(),
        }
    }

    /// Register a user with [`PASSWORD`] and return their public id.
    pub async fn register(&self, email: &str) -> Uuid {
        self.accounts
            .register(
                email,
                PASSWORD,
                NewProfile {
                    first_name: "Test".to_string(),
                    ..Default::default()
                },
            )
            .await
            .expect("registration should succeed")
    }

    /// Log in with [`PASSWORD`] and return the raw bearer token.
    pub async fn login(&self, email: &str) -> String {
        self.sessions
            .login(email, PASSWORD, None, ClientMeta::default())
            .await
            .expect("login should succeed")
            .token
            .into_string()
    }

    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }

    /// Current authenticator code for `secret`, shifted by `offset` steps.
    pub fn totp_code(&self, secret: &str, offset: i64) -> String {
        let step = self.verifier.time_step(self.clock.now()) as i64 + offset;
        self.verifier
            .second_factor_code(secret, step as u64)
            .expect("secret should decode")
    }
}

pub struct TestAppBuilder {
    session: SessionConfig,
    password: PasswordConfig,
    timeouts: StoreTimeouts,
}

impl TestAppBuilder {
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn password(mut self, password: PasswordConfig) -> Self {
        self.password = password;
        self
    }

    pub fn timeouts(mut self, timeouts: StoreTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn build(self) -> TestApp {
        let clock = Arc::new(ManualClock::starting_now());
        let durable = Arc::new(MemoryDurableStore::with_clock(clock.clone()));
        let cache = Arc::new(MemoryCacheStore::with_clock(clock.clone()));
        let verifier = Arc::new(
            CredentialVerifier::new(&self.password, TotpConfig::default())
                .expect("test Argon2 parameters are valid"),
        );
        let sessions = Arc::new(
            SessionManager::new(
                durable.clone(),
                cache.clone(),
                verifier.clone(),
                clock.clone(),
                self.session,
                self.timeouts,
            )
            .expect("test session config is valid"),
        );
        let accounts = AccountService::new(sessions.clone());

        TestApp {
            clock,
            durable,
            cache,
            verifier,
            sessions,
            accounts,
        }
    }
}

/// Poll `condition` until it holds, for background writes to land.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 1s");
}
