use anyhow::{Context, Result};
use sniket_push_router::{
    api, config, db, dispatcher::NotificationService, fcm::FcmClient, logging,
    registry::{PgRegistry, TokenRegistry},
};
use std::sync::Arc;
use tokio::{signal, sync::oneshot};
use tracing::info;

fn main() -> Result<()> {
    // Build custom runtime with explicit thread configuration
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get);

    println!("Starting with {} Tokio worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    runtime.block_on(async {
        // Initialize logging first thing
        logging::setup_logging();

        // Load environment variables from .env file if present
        dotenv::dotenv().ok();

        info!("Starting Sniket push router");

        let config = config::Config::from_env()?;

        let db_pool = db::init_db_pool(&config.database_url).await?;
        let registry = PgRegistry::new(db_pool);

        // Drop subscriptions that have not been refreshed within the TTL
        let registry_clone = registry.clone();
        let ttl = config.subscription_ttl();
        let prune_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3600)); // hourly
            loop {
                interval.tick().await;
                let cutoff = time::OffsetDateTime::now_utc() - ttl;
                match registry_clone.prune_stale(cutoff).await {
                    Ok(0) => {}
                    Ok(pruned) => info!("Pruned {} stale subscriptions", pruned),
                    Err(e) => tracing::error!("Error pruning stale subscriptions: {}", e),
                }
            }
        });

        let fcm_client = FcmClient::new(
            &config.fcm_endpoint,
            &config.fcm_project_id,
            &config.fcm_access_token,
        )?;

        if config.send_api_secret.is_none() {
            tracing::warn!("SEND_API_SECRET is not set; /send accepts unauthenticated requests");
        }

        let api_state = Arc::new(api::ApiState {
            notifier: NotificationService::new(
                registry,
                fcm_client,
                ttl,
                config.dispatch_concurrency,
            ),
            send_secret: config.send_api_secret.clone(),
        });
        let api_router = api::create_api_router(api_state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        info!("Starting API server on {}", config.api_bind_address);
        let listener = tokio::net::TcpListener::bind(&config.api_bind_address)
            .await
            .with_context(|| format!("Failed to bind {}", config.api_bind_address))?;

        let api_handle = tokio::spawn(async move {
            let server = axum::serve(listener, api_router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::error!("API server error: {}", e);
            }
        });

        // Handle graceful shutdown
        signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        info!("Received shutdown signal, shutting down gracefully");

        let _ = shutdown_tx.send(());
        prune_handle.abort();
        let _ = api_handle.await;

        info!("Shutdown complete");
        Ok(())
    })
}
