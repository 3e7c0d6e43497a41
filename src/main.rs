use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attachment_manager::{
    api,
    config::{Config, StorageBackend},
    kv_store::{KvStore, RedbKvStore},
    object_store::{LocalStore, ObjectStore},
    storage::Database,
    token::AccessPolicyRegistry,
    AppState,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "attachment-manager starting");

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db = Database::open(&config.data_dir)?;
    info!("Database opened at: {}", config.data_dir);

    // Blob stores for the two visibility classes
    let public_store = build_store(config.storage.public_backend, &config.storage.public_path)?;
    let private_store = build_store(config.storage.private_backend, &config.storage.private_path)?;
    info!(
        public_backend = ?config.storage.public_backend,
        public = %config.storage.public_path,
        private_backend = ?config.storage.private_backend,
        private = %config.storage.private_path,
        "Storage backends initialized"
    );

    // Token store shares the redb instance with the attachment tables
    let kv: Arc<dyn KvStore> = Arc::new(RedbKvStore::new(db.clone()));

    // Access policies are registered by deployments embedding this crate;
    // the standalone binary ships none, so private downloads are denied
    // until a policy grants them.
    let policies = AccessPolicyRegistry::default();

    let state = Arc::new(AppState::build(
        config.clone(),
        db,
        public_store,
        private_store,
        kv,
        policies,
    ));

    // Background orphan sweep
    let gc_handle = if config.gc.interval_seconds > 0 {
        let gc_state = Arc::clone(&state);
        let interval = Duration::from_secs(config.gc.interval_seconds);
        info!(interval_seconds = config.gc.interval_seconds, "Background cleanup enabled");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match gc_state.manager.cleanup(None, false, None).await {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "Background cleanup removed orphaned attachments")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Background cleanup failed"),
                }
            }
        }))
    } else {
        None
    };

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!("Listening on: {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = gc_handle {
        info!("Shutting down background tasks");
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

fn build_store(backend: StorageBackend, path: &str) -> anyhow::Result<Arc<dyn ObjectStore>> {
    match backend {
        StorageBackend::Local => Ok(Arc::new(LocalStore::new(path)?)),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
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

    info!("Shutdown signal received, draining connections");
}
