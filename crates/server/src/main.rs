use anyhow::Result;
use avocado_ai::OpenAiPlannerConnector;
use avocado_caldav::HttpCalDavConnector;
use avocado_store::{ConfigStore, StateStore};
use avocado_sync::{Scheduler, SyncEngine};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // The guard must stay alive for the process lifetime so file logs flush.
    let _guard = init_tracing();

    tracing::info!("starting avocado reconciliation service");

    let server_config = config::ServerConfig::from_env();
    let config_store = Arc::new(ConfigStore::open(&server_config.config_path)?);
    let state_store = StateStore::open(&server_config.state_path).await?;
    tracing::info!(
        config_path = %server_config.config_path,
        state_path = %server_config.state_path,
        "stores ready"
    );

    let engine = Arc::new(SyncEngine::new(
        Arc::clone(&config_store),
        state_store,
        Arc::new(HttpCalDavConnector),
        Arc::new(OpenAiPlannerConnector),
    ));

    let scheduler = Arc::new(Scheduler::new(Arc::clone(&engine)));
    scheduler.start();
    tracing::info!("scheduler started");

    let router = api::create_router(api::AppState {
        engine,
        scheduler: Arc::clone(&scheduler),
    });
    let listener = tokio::net::TcpListener::bind(&server_config.bind_addr).await?;
    tracing::info!(addr = %server_config.bind_addr, "admin API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    tracing::info!("shutdown signal received, stopping scheduler");
    scheduler.stop().await;
    tracing::info!("stopped cleanly");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,avocado_sync=debug,api=debug,sqlx=warn".into());

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    let enable_file_logging = std::env::var("ENABLE_FILE_LOGGING")
        .map(|v| v.to_lowercase() != "false" && v != "0")
        .unwrap_or(true);

    if enable_file_logging {
        let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let file_appender = tracing_appender::rolling::daily(log_dir, "avocado.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking)
            .json();

        registry.with(file_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    }
}
