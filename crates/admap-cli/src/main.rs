use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "admap-cli")]
#[command(about = "admap listing sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the sync pipeline once for every configured target.
    Sync,
    /// Serve the HTTP trigger, plus the cron scheduler when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summaries = admap_sync::run_sync_once_from_env().await?;
            for summary in summaries {
                println!(
                    "sync complete: target={} run_id={} fetched={} candidates={} staged={} net_new={}",
                    summary.target,
                    summary.run_id,
                    summary.fetched_summaries,
                    summary.candidates,
                    summary.staged,
                    summary.net_new
                );
            }
        }
        Commands::Serve => admap_web::serve_from_env().await?,
    }

    Ok(())
}
