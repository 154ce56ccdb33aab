use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use ukjobs_web::AppState;

#[derive(Debug, Parser)]
#[command(name = "ukjobs-cli")]
#[command(about = "UK skilled-jobs scraping pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape across all available sources, then exit.
    Scrape {
        /// Scrape date as YYYY-MM-DD; defaults to today (UTC).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Serve the JSON API, with the daily scheduler when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ukjobs=info".parse()?))
        .init();

    let cli = Cli::parse();
    let pipeline = ukjobs_engine::build_from_env().await?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Scrape { date } => {
            let run = pipeline.coordinator.trigger(date).await?;
            println!(
                "scrape complete: run_id={} status={} found={} new={} duplicates={} failed_sources={}",
                run.id,
                run.status,
                run.jobs_found,
                run.new_jobs,
                run.duplicates,
                run.failed_sources.join(",")
            );
        }
        Commands::Serve => {
            let scheduler = ukjobs_engine::maybe_build_scheduler(
                pipeline.coordinator.clone(),
                &pipeline.config,
            )
            .await?;
            if let Some(sched) = scheduler {
                sched.start().await?;
                info!(cron = %pipeline.config.scrape_cron, "daily scrape scheduler started");
            }
            ukjobs_web::serve(AppState::new(pipeline.coordinator)).await?;
        }
    }

    Ok(())
}
