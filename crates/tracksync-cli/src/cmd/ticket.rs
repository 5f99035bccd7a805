use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use tracksync_core::model::Locator;
use tracksync_core::storage::{TicketQuery, TicketStore};

use crate::engine;
use crate::output::print_json;

#[derive(Subcommand, Debug)]
pub enum TicketSubcommand {
    /// Print a stored ticket as JSON
    Get {
        /// Look the id up in this tracker's namespace; without it `--id` is
        /// the ticket's own id
        #[arg(long)]
        tracker: Option<String>,
        #[arg(long)]
        id: String,
    },
}

pub fn run(config_path: &Path, subcommand: TicketSubcommand) -> Result<()> {
    match subcommand {
        TicketSubcommand::Get { tracker, id } => {
            let query = match tracker {
                Some(tracker) => TicketQuery::Locator(Locator::new(tracker, id)),
                None => TicketQuery::Id(id),
            };
            let config = engine::load_config(config_path)?;
            let rt = tokio::runtime::Runtime::new()?;
            let ticket = rt
                .block_on(async {
                    let storage = engine::open_storage(&config.storage)?;
                    anyhow::Ok(storage.get_ticket(&query).await?)
                })
                .with_context(|| format!("ticket {query}"))?;
            print_json(&ticket)
        }
    }
}
