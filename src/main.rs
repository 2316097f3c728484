use std::sync::Arc;

use btca_server::collections::CollectionAssembler;
use btca_server::config::ConfigStore;
use btca_server::http::{App, router};
use btca_server::resources::ResourceStore;
use btca_server::search::{Ripgrep, Searcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    tracing::info!("btca-server starting");

    let config = Arc::new(ConfigStore::load().await?);
    tracing::info!(path = %config.path().display(), "config loaded");

    for provider in ["openrouter", "openai", "anthropic"] {
        let var = btca_server::provider::api_key_var(provider).unwrap_or_default();
        if std::env::var(var).ok().filter(|k| !k.is_empty()).is_none() {
            tracing::warn!("{var} not set — {provider} models unavailable");
        }
    }

    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("no user data directory"))?
        .join("btca");
    let resources_dir = data_dir.join("resources");
    let collections_dir = data_dir.join("collections");

    let searcher: Arc<dyn Searcher> = Arc::new(Ripgrep::locate().await?);

    let resources = Arc::new(ResourceStore::new(resources_dir, Arc::clone(&config)));
    let resources_loader: Arc<dyn btca_server::resources::ResourceLoader> = Arc::clone(&resources) as Arc<dyn btca_server::resources::ResourceLoader>;
    let collections = CollectionAssembler::new(collections_dir, resources_loader);

    let app = Arc::new(App {
        config,
        resources,
        collections,
        searcher,
    });

    let port: u16 = std::env::var("BTCA_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4100);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");

    axum::serve(listener, router(app)).await?;

    tracing::info!("btca-server shutting down");
    Ok(())
}
