use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ad_rewards_service::config::{Config, StoreBackend};
use ad_rewards_service::engine::AdsEngine;
use ad_rewards_service::handlers::{self, AppState};
use ad_rewards_service::models::Signalling;
use ad_rewards_service::provider::{AwaitedProvider, CallbackProvider, ProviderRegistry};
use ad_rewards_service::scheduler::ResetScheduler;
use ad_rewards_service::store::{KvStore, MemoryStore, NatsKvStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ad_rewards_service=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Ad Rewards Service");

    // Load configuration
    let config = Config::load("config.yaml")?;
    tracing::info!("Configuration loaded successfully");

    // Connect the shared state store
    let store: Arc<dyn KvStore> = match config.store.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Nats => {
            Arc::new(NatsKvStore::connect(&config.store.nats_url, &config.store.bucket).await?)
        }
    };

    // Register provider integrations. Playback stand-ins run where no vendor
    // SDK bridge is wired in; a deployment installs real entry points here.
    let mut registry = ProviderRegistry::new();
    for provider in &config.providers {
        let playback = Duration::from_secs(provider.minimum_watch_seconds);
        match provider.signalling {
            Signalling::Awaited => registry.register(Arc::new(AwaitedProvider::with_playback(
                provider.provider.clone(),
                playback,
            ))),
            Signalling::Callback => registry.register(Arc::new(CallbackProvider::with_playback(
                provider.provider.clone(),
                playback,
            ))),
        }
    }

    // Bring up the orchestration engine and its config feed
    let engine = Arc::new(AdsEngine::new(store.clone(), registry, &config)?);
    engine.start().await?;
    tracing::info!("Ad reward engine initialized");

    // Daily reset scheduler: one check at startup, then on a fixed interval
    let scheduler = ResetScheduler::new(
        store.clone(),
        config.reset.timezone()?,
        config.reset.cutoff_hour,
        Duration::from_secs(config.reset.check_interval_seconds),
    );
    tokio::spawn(scheduler.run());

    // Create shared state
    let state = AppState {
        config: Arc::new(config.clone()),
        engine,
    };

    // Build application router
    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/v1/ads/watch", post(handlers::watch_ad))
        .route("/api/v1/ads/status/{account_id}", get(handlers::ad_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
