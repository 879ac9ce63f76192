use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use mpof_store::OpportunityStore;
use mpof_sync::{export_csv, run_pipeline, store_stats, PipelineConfig, RunnerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mpof")]
#[command(about = "Medical physics opportunity scraper")]
struct Cli {
    /// Path to the source registry file.
    #[arg(long, global = true, default_value = "data/sources.yaml")]
    config: PathBuf,
    /// Directory holding the active and archived record stores.
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape all active sources and update the store.
    Run {
        /// Show the browser window for rendered sources.
        #[arg(long)]
        headed: bool,
    },
    /// Export the active record set as CSV.
    Export {
        #[arg(long, default_value = "data/opportunities.csv")]
        output: PathBuf,
    },
    /// Print statistics over the active record set.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { headed: false }) {
        Commands::Run { headed } => {
            let summary = run_pipeline(PipelineConfig {
                sources_path: cli.config,
                data_dir: cli.data_dir,
                runner: RunnerConfig {
                    headless: !headed,
                    ..RunnerConfig::default()
                },
            })
            .await?;

            println!();
            println!("{}", "=".repeat(50));
            println!("SCRAPING SUMMARY");
            println!("{}", "=".repeat(50));
            println!("Total Opportunities Found: {}", summary.total_opportunities);
            println!("Sources Scraped: {}", summary.sources_scraped);
            println!("Errors: {}", summary.total_errors);
            println!("Scraping Completed: {}", summary.scraping_timestamp);

            if !summary.errors.is_empty() {
                println!("\nErrors encountered:");
                for entry in &summary.errors {
                    println!("  - {}: {}", entry.source, entry.error);
                }
                std::process::exit(1);
            }
        }
        Commands::Export { output } => {
            let store = OpportunityStore::new(&cli.data_dir);
            let records = store.load_active().await;
            let csv = export_csv(&records);
            tokio::fs::write(&output, csv)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Exported {} records to {}", records.len(), output.display());
        }
        Commands::Stats => {
            let store = OpportunityStore::new(&cli.data_dir);
            let records = store.load_active().await;
            let stats = store_stats(&records, Utc::now().date_naive());
            println!("Active opportunities: {}", stats.total);
            println!("Deadlines within 30 days: {}", stats.expiring_soon);
            println!("By source:");
            for (source, count) in &stats.by_source {
                println!("  - {source}: {count}");
            }
        }
    }

    Ok(())
}
