use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labstock_sync::{
    open_tracked_store, run_import, AppConfig, ImportOptions, MergeEngine, MergeOutcome,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "labstock")]
#[command(about = "Lab inventory tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the web UI (default).
    Serve,
    /// Run a CSV file through the import reconciler.
    Import { path: PathBuf },
    /// Export the full record set to a CSV file.
    Export { path: PathBuf },
    /// Write the import template CSV.
    Template { path: PathBuf },
    /// Fold duplicate records sharing a composite key.
    Merge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(".")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => labstock_web::serve(config).await?,
        Commands::Import { path } => {
            let (store, remote) = open_tracked_store(&config).await?;
            let bytes =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let outcome = run_import(&store, &bytes, ImportOptions::default()).await?;
            if let Some(remote) = &remote {
                if let Err(err) = remote.push(&store).await {
                    eprintln!("warning: remote push failed: {err}");
                }
            }
            println!(
                "CSV imported: {} new records, {} duplicates skipped.",
                outcome.inserted, outcome.skipped
            );
        }
        Commands::Export { path } => {
            let (store, _remote) = open_tracked_store(&config).await?;
            let records = store.list_all().await?;
            let text = labstock_csv::export_csv(&records)?;
            std::fs::write(&path, text)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("exported {} records to {}", records.len(), path.display());
        }
        Commands::Template { path } => {
            std::fs::write(&path, labstock_csv::template_csv()?)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote import template to {}", path.display());
        }
        Commands::Merge => {
            let (store, remote) = open_tracked_store(&config).await?;
            match MergeEngine::run(&store).await? {
                MergeOutcome::NoDuplicates => println!("no duplicates found"),
                MergeOutcome::Merged { groups, removed } => {
                    if let Some(remote) = &remote {
                        if let Err(err) = remote.push(&store).await {
                            eprintln!("warning: remote push failed: {err}");
                        }
                    }
                    println!("merged {groups} duplicate groups, removed {removed} rows");
                }
            }
        }
    }

    Ok(())
}
