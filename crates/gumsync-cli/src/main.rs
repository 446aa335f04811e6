use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gumsync")]
#[command(about = "Mirror Gumroad product sales into a Notion database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync forever, rebuilding from Notion after any failure (default).
    Run,
    /// Bootstrap, run a single cycle and exit.
    Once,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => gumsync_sync::run_from_env().await?,
        Commands::Once => {
            let summary = gumsync_sync::run_once_from_env().await?;
            tracing::info!(
                cycle_id = %summary.cycle_id,
                fetched = summary.fetched,
                created = summary.created,
                updated = summary.updated,
                "single cycle complete"
            );
        }
    }

    Ok(())
}
