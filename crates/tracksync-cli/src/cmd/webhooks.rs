use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracksync_server::Actor;

use crate::engine;
use crate::output::print_json;

pub fn run(config_path: &Path, tracker: Option<&str>, json: bool) -> Result<()> {
    let config = engine::load_config(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        let storage = engine::open_storage(&config.storage)?;
        let plugins = engine::connect_trackers(&config).await?;
        let actor = Actor::new(
            Arc::new(config.clone()),
            plugins.registry.clone(),
            storage,
            &config.server.base_url,
        );

        let scope = tracker.unwrap_or_default();
        let total = actor.subscriptions().list(scope).await?.len();
        let removed = actor.remove_subscriptions(scope).await;
        plugins.shutdown().await;

        if json {
            print_json(&serde_json::json!({ "removed": removed, "total": total }))?;
        } else {
            println!("removed {removed} of {total} subscriptions");
        }
        if removed < total {
            anyhow::bail!("{} subscriptions could not be removed", total - removed);
        }
        Ok(())
    })
}
