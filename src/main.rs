use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use haex_sync::config::Config;
use haex_sync::credentials::CredentialService;
use haex_sync::gateway::S3Gateway;
use haex_sync::identity::IdentityClient;
use haex_sync::storage::{partitions, Database};
use haex_sync::{api, AppState};

/// Database pool size shared by every request.
const DB_POOL_SIZE: u32 = 10;

#[tokio::main]
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

    info!(version = env!("CARGO_PKG_VERSION"), "haex-sync starting");

    // Load configuration
    let config = Config::load()?;
    info!(environment = %config.environment, "Loaded configuration");

    // Connect and bootstrap the database
    let db = Database::connect(&config.database_url, DB_POOL_SIZE).await?;
    db.ensure_schema().await?;
    partitions::bootstrap(&db).await?;
    info!("Database ready");

    // Outbound clients: one for the identity provider, one (streaming,
    // without a global deadline) for the object backend.
    let identity_http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;
    let identity = IdentityClient::new(&config.auth, identity_http);

    let gateway = match &config.storage {
        Some(storage_config) => {
            let s3_http = reqwest::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()?;
            let gateway = S3Gateway::from_config(storage_config, s3_http)?;
            info!(endpoint = %storage_config.endpoint, "Object storage gateway enabled");
            Some(gateway)
        }
        None => None,
    };

    let credentials = CredentialService::new(config.storage_encryption_key.as_deref());

    let port = config.port;
    let state = Arc::new(AppState {
        config,
        credentials,
        db,
        gateway,
        identity,
    });

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
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
