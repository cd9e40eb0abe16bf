use auth_core::{
    config::AuthCoreConfig,
    db,
    services::{CredentialVerifier, ExpirySweeper, SessionManager},
    store::{PgDurableStore, RedisCacheStore, StoreTimeouts},
    SystemClock,
};
use service_core::error::AppError;
use service_core::observability::init_tracing;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Service stopped with an error");
            eprintln!("auth-core: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = AuthCoreConfig::from_env()?;

    init_tracing(
        &config.common.service_name,
        &config.common.log_level,
        config.common.otlp_endpoint.as_deref(),
    )?;

    tracing::info!(
        service = %config.common.service_name,
        version = env!("CARGO_PKG_VERSION"),
        environment = ?config.common.environment,
        policy = ?config.session.policy,
        "Starting session engine"
    );

    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;
    let durable = Arc::new(PgDurableStore::new(pool.clone()));

    let cache = Arc::new(RedisCacheStore::connect(&config.redis).await?);

    let clock = Arc::new(SystemClock);
    let timeouts = StoreTimeouts::from_config(&config.database, &config.redis);

    let verifier = CredentialVerifier::new(&config.password, config.totp.clone())
        .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e.to_string())))?;
    let sessions = SessionManager::new(
        durable.clone(),
        cache.clone(),
        Arc::new(verifier),
        clock.clone(),
        config.session.clone(),
        timeouts,
    )
    .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e.to_string())))?;

    let health = sessions.health().await;
    tracing::info!(durable = health.durable, cache = health.cache, "Store health");
    if !health.durable {
        return Err(AppError::DatabaseError(anyhow::anyhow!(
            "PostgreSQL health check failed"
        )));
    }

    let shutdown = CancellationToken::new();
    let sweeper = ExpirySweeper::new(durable, cache, clock, &config.session, timeouts);
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.clone()));

    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = sweeper_task.await {
        tracing::error!(error = %e, "Session sweeper task failed");
    }
    pool.close().await;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
