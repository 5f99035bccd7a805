//! Turns a configuration into live storage and trackers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracksync_core::config::{Config, StorageConfig, TrackerConfig};
use tracksync_core::storage::{MemoryStorage, RedbStorage, Storage};
use tracksync_core::tracker::TrackerRegistry;
use tracksync_plugin::{PluginProcess, PluginTracker, RetryPolicy};

pub fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading {}", path.display()))
}

pub fn open_storage(cfg: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match cfg {
        StorageConfig::Redb { path } => {
            let storage = RedbStorage::open(path)
                .with_context(|| format!("opening database {}", path.display()))?;
            info!(path = %path.display(), "storage opened");
            Ok(Arc::new(storage))
        }
        StorageConfig::Memory => {
            info!("using in-memory storage; nothing survives a restart");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

/// Connected plugin trackers plus the processes started for them.
///
/// Dropping `Plugins` kills every process it started.
pub struct Plugins {
    pub registry: TrackerRegistry,
    processes: Vec<PluginProcess>,
}

impl Plugins {
    pub async fn shutdown(self) {
        for p in self.processes {
            p.shutdown().await;
        }
    }
}

pub async fn connect_trackers(config: &Config) -> Result<Plugins> {
    let mut plugins = Plugins {
        registry: TrackerRegistry::new(),
        processes: Vec::new(),
    };
    for tracker in &config.trackers {
        if !tracker.plugin.command.is_empty() {
            let process =
                PluginProcess::spawn(&tracker.name, &tracker.plugin.command, &tracker.plugin.address)
                    .with_context(|| format!("starting plugin for '{}'", tracker.name))?;
            plugins.processes.push(process);
        }
        let client = PluginTracker::connect(&tracker.name, &tracker.plugin.address, policy(tracker))
            .await
            .with_context(|| {
                format!("connecting to '{}' at {}", tracker.name, tracker.plugin.address)
            })?;
        info!(tracker = %tracker.name, address = %tracker.plugin.address, "tracker connected");
        plugins.registry.register(Arc::new(client));
    }
    Ok(plugins)
}

fn policy(tracker: &TrackerConfig) -> RetryPolicy {
    RetryPolicy {
        attempts: tracker.plugin.attempts,
        delay: Duration::from_millis(tracker.plugin.delay_ms),
    }
}
