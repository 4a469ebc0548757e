use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use roster_core::{normalize_email, normalize_phone, normalize_profile_url};
use roster_pipeline::{DatabaseIndex, Pipeline, PipelineConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "roster-cli")]
#[command(about = "Candidate profile extraction and contact enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process every profile in the input directory and write reports.
    Run {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        #[arg(long)]
        database_csv: Option<PathBuf>,
        #[arg(long)]
        max_concurrent_extractions: Option<usize>,
    },
    /// Load the contact directory and print its column mapping and stats.
    Index {
        #[arg(long)]
        database_csv: Option<PathBuf>,
    },
    /// Print the normalized URL, email and phone forms of a value.
    Normalize { value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        core = roster_core::CRATE_NAME,
        pipeline = roster_pipeline::CRATE_NAME,
        version = env!("CARGO_PKG_VERSION"),
        "roster starting"
    );
    let mut config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        data_dir: None,
        database_csv: None,
        max_concurrent_extractions: None,
    }) {
        Commands::Run {
            data_dir,
            database_csv,
            max_concurrent_extractions,
        } => {
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(path) = database_csv {
                config.database_csv = path;
            }
            if let Some(limit) = max_concurrent_extractions {
                config.max_concurrent_extractions = limit;
            }
            info!(data_dir = %config.data_dir.display(), "starting run");

            let summary = Pipeline::new(config)?.run_once().await?;
            let c = summary.counters;
            println!(
                "run complete: run_id={} inputs={} matched={} no_linkedin={} no_match={} cache_hits={} extractor_calls={} extraction_failures={}",
                summary.run_id,
                c.inputs,
                c.matched,
                c.no_linkedin,
                c.no_match,
                c.cache_hits,
                c.extractor_calls,
                c.extraction_failures
            );
            println!("participants: {}", summary.participants_csv);
            println!("match report: {}", summary.match_report_csv);
        }
        Commands::Index { database_csv } => {
            let path = database_csv.unwrap_or(config.database_csv);
            let index = DatabaseIndex::load(&path)?;
            let columns = index.columns();
            let stats = index.stats();
            let show = |c: &Option<String>| c.clone().unwrap_or_else(|| "-".to_string());
            println!(
                "columns: linkedin={} email={} phone={} name={}",
                show(&columns.linkedin),
                show(&columns.email),
                show(&columns.phone),
                show(&columns.name)
            );
            println!(
                "rows={} indexed={} skipped_without_url={} unreadable_rows={} merged_collisions={}",
                stats.rows,
                stats.indexed,
                stats.skipped_without_url,
                stats.unreadable_rows,
                stats.merged_collisions
            );
        }
        Commands::Normalize { value } => {
            let show = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
            println!("linkedin: {}", show(normalize_profile_url(&value)));
            println!("email: {}", show(normalize_email(&value)));
            println!("phone: {}", show(normalize_phone(&value)));
        }
    }

    Ok(())
}
