//! Store outages, timeouts, token collisions and enumeration resistance.

mod common;

use auth_core::{
    config::PasswordConfig,
    models::ClientMeta,
    services::{token::hash_token, AuthError},
    store::StoreTimeouts,
};
use common::{TestApp, PASSWORD};
use std::time::{Duration, Instant};

fn short_timeouts() -> StoreTimeouts {
    StoreTimeouts {
        durable: Duration::from_millis(50),
        cache: Duration::from_millis(20),
    }
}

// ============================================================================
// Cache failures
// ============================================================================

#[tokio::test]
async fn cache_outage_does_not_block_login_or_validation() {
    let app = TestApp::new();
    let user_id = app.register("ann@example.com").await;
    app.cache.set_unavailable(true);

    let token = app.login("ann@example.com").await;
    assert_eq!(app.sessions.validate(&token).await.unwrap().user_id, user_id);

    app.cache.set_unavailable(false);
    assert!(!app.cache.contains(&hash_token(&token)));
    assert_eq!(app.sessions.validate(&token).await.unwrap().user_id, user_id);
}

#[tokio::test]
async fn cache_outage_after_login_falls_back_to_durable() {
    let app = TestApp::new();
    let user_id = app.register("ben@example.com").await;
    let token = app.login("ben@example.com").await;

    app.cache.set_unavailable(true);
    assert_eq!(app.sessions.validate(&token).await.unwrap().user_id, user_id);
}

#[tokio::test]
async fn logout_during_cache_outage_still_revokes() {
    let app = TestApp::new();
    app.register("cyd@example.com").await;
    let token = app.login("cyd@example.com").await;

    app.cache.set_unavailable(true);
    app.sessions.logout(&token).await.unwrap();
    assert!(!app.durable.contains_session(&hash_token(&token)));
    assert!(matches!(
        app.sessions.validate(&token).await.unwrap_err(),
        AuthError::InvalidSession
    ));
}

#[tokio::test]
async fn slow_cache_is_bypassed() {
    let app = TestApp::builder().timeouts(short_timeouts()).build();
    let user_id = app.register("dot@example.com").await;
    let token = app.login("dot@example.com").await;

    app.cache.set_latency(Duration::from_millis(200));
    let started = Instant::now();
    assert_eq!(app.sessions.validate(&token).await.unwrap().user_id, user_id);
    assert!(started.elapsed() < Duration::from_millis(200));
}

// ============================================================================
// Durable failures
// ============================================================================

#[tokio::test]
async fn slow_durable_store_is_transient_not_an_auth_failure() {
    let app = TestApp::builder().timeouts(short_timeouts()).build();
    app.register("eli@example.com").await;
    let token = app.login("eli@example.com").await;
    app.cache.flush();

    app.durable.set_latency(Duration::from_millis(200));

    let err = app
        .sessions
        .login("eli@example.com", PASSWORD, None, ClientMeta::default())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(!err.is_authentication_failure());

    let err = app.sessions.validate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::Transient(_)));
}

#[tokio::test]
async fn durable_outage_is_transient_for_every_operation() {
    let app = TestApp::new();
    let user_id = app.register("fin@example.com").await;
    let token = app.login("fin@example.com").await;
    app.cache.flush();

    app.durable.set_unavailable(true);

    let login = app
        .sessions
        .login("fin@example.com", PASSWORD, None, ClientMeta::default())
        .await;
    assert!(matches!(login.unwrap_err(), AuthError::Transient(_)));
    assert!(matches!(
        app.sessions.validate(&token).await.unwrap_err(),
        AuthError::Transient(_)
    ));
    assert!(matches!(
        app.sessions.logout(&token).await.unwrap_err(),
        AuthError::Transient(_)
    ));
    assert!(matches!(
        app.sessions.logout_all(user_id).await.unwrap_err(),
        AuthError::Transient(_)
    ));

    app.durable.set_unavailable(false);
    assert!(app.sessions.validate(&token).await.is_ok());
}

#[tokio::test]
async fn cached_session_survives_durable_outage() {
    let app = TestApp::new();
    let user_id = app.register("gil@example.com").await;
    let token = app.login("gil@example.com").await;

    app.durable.set_unavailable(true);
    assert_eq!(app.sessions.validate(&token).await.unwrap().user_id, user_id);
}

// ============================================================================
// Token collisions
// ============================================================================

#[tokio::test]
async fn single_token_collision_is_retried() {
    let app = TestApp::new();
    app.register("hub@example.com").await;
    app.durable.force_session_collisions(1);

    let token = app.login("hub@example.com").await;
    assert!(app.sessions.validate(&token).await.is_ok());
    assert_eq!(app.durable.session_count(), 1);
}

#[tokio::test]
async fn repeated_token_collisions_fail_internally() {
    let app = TestApp::new();
    app.register("ida@example.com").await;
    app.durable.force_session_collisions(2);

    let err = app
        .sessions
        .login("ida@example.com", PASSWORD, None, ClientMeta::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Internal(_)));
    assert_eq!(app.durable.session_count(), 0);
}

// ============================================================================
// Enumeration resistance
// ============================================================================

#[tokio::test]
async fn unknown_email_and_wrong_password_look_the_same() {
    let app = TestApp::new();
    app.register("jo@example.com").await;

    let unknown = app
        .sessions
        .login("nobody@example.com", PASSWORD, None, ClientMeta::default())
        .await
        .unwrap_err();
    let wrong = app
        .sessions
        .login("jo@example.com", "not the password", None, ClientMeta::default())
        .await
        .unwrap_err();

    assert!(matches!(unknown, AuthError::InvalidCredentials));
    assert!(matches!(wrong, AuthError::InvalidCredentials));
    assert_eq!(unknown.to_string(), wrong.to_string());
    assert_eq!(unknown.user_message(), wrong.user_message());
}

#[tokio::test]
async fn unknown_email_costs_a_password_check() {
    let app = TestApp::builder()
        .password(PasswordConfig {
            argon2_memory_kib: 1024,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        })
        .build();
    app.register("kit@example.com").await;

    let mut unknown = Vec::new();
    let mut wrong = Vec::new();
    for _ in 0..5 {
        let started = Instant::now();
        let _ = app
            .sessions
            .login("nobody@example.com", PASSWORD, None, ClientMeta::default())
            .await;
        unknown.push(started.elapsed());

        let started = Instant::now();
        let _ = app
            .sessions
            .login("kit@example.com", "not the password", None, ClientMeta::default())
            .await;
        wrong.push(started.elapsed());
    }
    unknown.sort();
    wrong.sort();

    let ratio = unknown[2].as_secs_f64() / wrong[2].as_secs_f64();
    assert!(
        (0.33..3.0).contains(&ratio),
        "median latency ratio {:.2} (unknown {:?}, wrong {:?})",
        ratio,
        unknown[2],
        wrong[2]
    );
}
