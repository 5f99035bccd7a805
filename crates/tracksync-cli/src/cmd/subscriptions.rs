use std::path::Path;

use anyhow::Result;
use clap::Subcommand;
use tracksync_core::storage::SubscriptionStore;

use crate::engine;
use crate::output::{print_json, print_table};

// ---------------------------------------------------------------------------
// Subcommand definition
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
pub enum SubscriptionsSubcommand {
    /// List persisted subscriptions
    List {
        /// Only this tracker's subscriptions
        #[arg(long)]
        tracker: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub fn run(config_path: &Path, subcommand: SubscriptionsSubcommand, json: bool) -> Result<()> {
    match subcommand {
        SubscriptionsSubcommand::List { tracker } => list(config_path, tracker.as_deref(), json),
    }
}

fn list(config_path: &Path, tracker: Option<&str>, json: bool) -> Result<()> {
    let config = engine::load_config(config_path)?;
    let rt = tokio::runtime::Runtime::new()?;
    let subs = rt.block_on(async {
        let storage = engine::open_storage(&config.storage)?;
        anyhow::Ok(storage.list_subscriptions(tracker).await?)
    })?;

    if json {
        return print_json(&subs);
    }
    if subs.is_empty() {
        println!("no subscriptions");
        return Ok(());
    }
    let rows = subs
        .iter()
        .map(|s| {
            vec![
                s.id.clone(),
                s.tracker_name.clone(),
                s.trigger_name.clone(),
                s.tracker_ref.clone().unwrap_or_else(|| "-".into()),
                s.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(&["ID", "TRACKER", "TRIGGER", "REF", "CREATED"], rows);
    Ok(())
}
