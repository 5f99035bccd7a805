mod cmd;
mod engine;
mod output;

use clap::{Parser, Subcommand};
use cmd::{subscriptions::SubscriptionsSubcommand, ticket::TicketSubcommand};
use std::path::PathBuf;
use tracksync_core::config::DEFAULT_CONFIG_FILE;

#[derive(Parser)]
#[command(
    name = "tracksync",
    about = "Keep tickets in sync across task trackers",
    version,
    propagate_version = true
)]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, env = "TRACKSYNC_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register webhooks and sync tickets until interrupted
    Serve,

    /// Check the configuration file
    Validate,

    /// Unsubscribe and delete persisted webhook subscriptions
    RemoveWebhooks {
        /// Only this tracker's subscriptions
        #[arg(long)]
        tracker: Option<String>,
    },

    /// Inspect persisted subscriptions
    Subscriptions {
        #[command(subcommand)]
        subcommand: SubscriptionsSubcommand,
    },

    /// Inspect stored tickets
    Ticket {
        #[command(subcommand)]
        subcommand: TicketSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve | Commands::RemoveWebhooks { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve => cmd::serve::run(&cli.config),
        Commands::Validate => cmd::validate::run(&cli.config, cli.json),
        Commands::RemoveWebhooks { tracker } => {
            cmd::webhooks::run(&cli.config, tracker.as_deref(), cli.json)
        }
        Commands::Subscriptions { subcommand } => {
            cmd::subscriptions::run(&cli.config, subcommand, cli.json)
        }
        Commands::Ticket { subcommand } => cmd::ticket::run(&cli.config, subcommand),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
