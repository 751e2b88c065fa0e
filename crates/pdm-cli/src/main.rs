use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pdm_merge::{connect_store, list_potential_duplicates, run_merge, MergeConfig};
use pdm_store::MemoryProjectStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pdm")]
#[command(about = "Find and merge duplicate portfolio projects")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge duplicates in three passes (exact, normalized, city+state)
    Merge(MergeArgs),
    /// Write a Markdown listing of potential duplicates without changing anything
    List(ListArgs),
}

#[derive(Debug, Args, Default)]
struct MergeArgs {
    /// Log what would be merged without writing (same as MERGE_DRY_RUN=1)
    #[arg(long)]
    dry_run: bool,
    /// Read projects from a JSON snapshot instead of the database
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// With --snapshot, save the merged snapshot here
    #[arg(long, requires = "snapshot")]
    write_snapshot: Option<PathBuf>,
    /// Skip writing run reports
    #[arg(long)]
    no_reports: bool,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Read projects from a JSON snapshot instead of the database
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Markdown output path; prints to stdout when omitted
    #[arg(long, short)]
    output: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn merge(args: MergeArgs) -> Result<()> {
    let mut config = MergeConfig::from_env()?;
    config.dry_run |= args.dry_run;
    config.write_reports &= !args.no_reports;

    let summary = match &args.snapshot {
        Some(path) => {
            let store = MemoryProjectStore::from_json_file(path).await?;
            let summary = run_merge(&store, &config).await?;
            if let Some(out) = &args.write_snapshot {
                let bytes = serde_json::to_vec_pretty(&store.snapshot().await)
                    .context("serializing merged snapshot")?;
                tokio::fs::write(out, bytes)
                    .await
                    .with_context(|| format!("writing {}", out.display()))?;
            }
            summary
        }
        None => {
            let store = connect_store(&config).await?;
            let summary = run_merge(&store, &config).await;
            store.close().await;
            summary?
        }
    };

    println!(
        "merge complete: run_id={} passes={} merged={}",
        summary.run_id,
        summary.passes.len(),
        summary.merged
    );
    println!("{}", summary.headline());
    Ok(())
}

async fn list(args: ListArgs) -> Result<()> {
    let listing = match &args.snapshot {
        Some(path) => {
            let store = MemoryProjectStore::from_json_file(path).await?;
            list_potential_duplicates(&store).await?
        }
        None => {
            let config = MergeConfig::from_env()?;
            let store = connect_store(&config).await?;
            let listing = list_potential_duplicates(&store).await;
            store.close().await;
            listing?
        }
    };

    let markdown = listing.to_markdown();
    match &args.output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
            tokio::fs::write(path, markdown)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            println!(
                "exact groups={} likely pairs={} city/state pairs={} report={}",
                listing.exact_groups.len(),
                listing.likely_pairs.len(),
                listing.city_state_pairs.len(),
                path.display()
            );
        }
        None => println!("{markdown}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Merge(MergeArgs::default())) {
        Commands::Merge(args) => merge(args).await?,
        Commands::List(args) => list(args).await?,
    }

    Ok(())
}
