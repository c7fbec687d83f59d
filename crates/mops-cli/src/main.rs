use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mops_sync::{parse_stock_ids, DisclosurePipeline, ReportConfig};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mops-cli")]
#[command(about = "MOPS disclosure digest command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Listing start date, in the format the listing service expects
    #[arg(long, global = true)]
    start_date: Option<String>,

    #[arg(long, global = true)]
    end_date: Option<String>,

    /// Comma or space separated stock ids; order is kept in the report
    #[arg(long, global = true)]
    ids: Option<String>,

    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Build the report and write it to the output directory
    Run,
    /// Build the report and print it to stdout
    Print,
}

impl Cli {
    fn apply_overrides(&self, config: &mut ReportConfig) {
        if let Some(start) = &self.start_date {
            config.start_date = Some(start.clone());
        }
        if let Some(end) = &self.end_date {
            config.end_date = Some(end.clone());
        }
        if let Some(ids) = &self.ids {
            config.stock_ids = parse_stock_ids(ids);
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!(error = ?err, "mops run failed");
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = ReportConfig::from_env();
    cli.apply_overrides(&mut config);
    let request = config.run_request()?;
    let pipeline = DisclosurePipeline::from_config(&config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let output = config.report_output()?;
            let summary = pipeline.run_once(&request, &output).await?;
            info!(
                path = %summary.report_path,
                hash = %summary.content_hash,
                elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
                "mops run complete"
            );
            println!(
                "report complete: requested={} listed={} detailed={} no_detail={} unmatched={} path={}",
                summary.requested,
                summary.listed_records,
                summary.counts.detailed,
                summary.counts.no_detail,
                summary.counts.unmatched,
                summary.report_path
            );
        }
        Commands::Print => {
            let compiled = pipeline
                .compile(&request)
                .await
                .context("fetching disclosure listing")?;
            info!(fragments = compiled.document.fragments().len(), "report printed");
            println!("{}", compiled.document.html());
        }
    }

    Ok(())
}
