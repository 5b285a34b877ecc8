use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnero::api::{self, AppState};
use turnero::catalog::{CatalogCache, JsonFileCatalog};
use turnero::checkout::Checkout;
use turnero::config::Config;
use turnero::engine::Engine;
use turnero::hold::HoldManager;
use turnero::notify::NotifyHub;
use turnero::payment::{CredentialChain, FileCredentialLoader, HttpProcessor, IntentBridge};
use turnero::reconcile::Reconciler;
use turnero::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    turnero::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.wal_path(), notify)?);
    info!("restored {} reservations", engine.stored_count());

    let catalog = CatalogCache::new(Arc::new(JsonFileCatalog::new(config.catalog_path.clone())));
    let holds = Arc::new(HoldManager::new(
        engine.clone(),
        catalog,
        config.hold_ttl_minutes,
        config.utc_offset,
    ));

    let loader = Arc::new(FileCredentialLoader::new(
        config.credentials_path.clone(),
        config.env_token.clone(),
    ));
    let credentials = Arc::new(CredentialChain::load(config.credential_order.clone(), loader).await?);
    let processor = Arc::new(HttpProcessor::new(&config.processor_url, config.processor_timeout)?);

    let bridge = IntentBridge::new(
        engine.clone(),
        processor.clone(),
        credentials.clone(),
        config.processor_timeout,
        config.notification_url(),
    );
    let checkout = Arc::new(Checkout::new(holds, bridge));
    let reconciler = Arc::new(Reconciler::new(
        engine.clone(),
        processor,
        credentials,
        config.orphan_policy,
    ));

    tokio::spawn(sweeper::run_sweeper(engine.clone(), config.sweep_interval));
    tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.sweep_interval,
        config.compact_threshold,
        config.intent_retention,
    ));

    let app = api::router(AppState { checkout, reconciler });

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("turnero listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  catalog: {}", config.catalog_path.display());
    info!("  hold ttl: {} min", config.hold_ttl_minutes);
    info!("  orphan approvals: {:?}", config.orphan_policy);
    info!(
        "  webhook: {}",
        config.notification_url().unwrap_or_else(|| "not advertised".into())
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("turnero stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining requests");
}
