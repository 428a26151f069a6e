//! Storefront Checkout - cart, checkout and order placement service

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use storefront_checkout::config::AppConfig;
use storefront_checkout::http::{router, AppState};
use storefront_checkout::store::{CommerceStore, MemoryStore, PgStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store: Arc<dyn CommerceStore> = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.database_max_connections).await.context("connecting to PostgreSQL")?;
            store.migrate().await.context("running migrations")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryStore::with_default_settings())
        }
    };

    let nats = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable, events will only be logged");
                None
            }
        },
        None => None,
    };

    let app = router(AppState::new(store, nats));
    let addr = config.listen_addr()?;
    tracing::info!("🚀 Storefront checkout listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
