use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracksync_server::Actor;

use crate::engine;

pub fn run(config_path: &Path) -> Result<()> {
    let config = engine::load_config(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        let storage = engine::open_storage(&config.storage)?;
        let plugins = engine::connect_trackers(&config).await?;
        let listener = tokio::net::TcpListener::bind(config.server.listen)
            .await
            .with_context(|| format!("binding {}", config.server.listen))?;

        let actor = Actor::new(
            Arc::new(config.clone()),
            plugins.registry.clone(),
            storage,
            &config.server.base_url,
        )
        .run_timeout(config.server.run_timeout());

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received, shutting down");
                    cancel.cancel();
                }
            });
        }

        println!(
            "tracksync listening on {} (webhooks at {})",
            config.server.listen, config.server.base_url
        );
        let result = actor.run(listener, cancel).await;
        plugins.shutdown().await;
        result.context("sync engine stopped")
    })
}
