use std::sync::Arc;

use anyhow::Result;
use git_mirror_engine::{config::EngineConfig, engine::Engine, store::InMemoryRepoPairStore};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("git_mirror_engine=info")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    // The repo-pair store, REST surface, and auth layer are external
    // collaborators — this binary only demonstrates wiring the engine up
    // against the in-memory reference store.
    let store = Arc::new(InMemoryRepoPairStore::new());

    let engine = Arc::new(Engine::new(config, store));
    engine.start().await?;
    info!("git-mirror-engine running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    engine.stop().await?;

    Ok(())
}
