use std::path::PathBuf;

use anyhow::{Context, Result};
use chemfetch_adapters::{resolve_identifier, HttpEntityApi};
use chemfetch_core::TargetNames;
use chemfetch_storage::HttpFetcher;
use chemfetch_sync::{load_names, report, retain_targets, PipelineConfig, SyncPipeline};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chemfetch")]
#[command(about = "Resolve drug names to canonical ids and collect their records")]
struct Cli {
    /// YAML settings file; defaults to ./chemfetch.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve and enrich every name in a file, then write the run outputs.
    Run(RunArgs),
    /// Resolve a single name and print the chosen id.
    Resolve { name: String },
    /// Re-project a saved results.json into the flat CSV.
    Flatten {
        #[arg(long)]
        results: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// One name per line.
    #[arg(long)]
    input: PathBuf,
    /// Only process names also listed in this file.
    #[arg(long)]
    only: Option<PathBuf>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    assets_dir: Option<PathBuf>,
    /// Write results in input order instead of completion order.
    #[arg(long)]
    input_order: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(v) = self.concurrency {
            config.concurrency = v;
        }
        if let Some(v) = &self.base_url {
            config.base_url = v.clone();
        }
        if let Some(v) = &self.output_dir {
            config.output_dir = v.clone();
        }
        if let Some(v) = &self.assets_dir {
            config.assets_dir = v.clone();
        }
        if self.input_order {
            config.input_order = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            args.apply(&mut config);
            let mut names = load_names(&args.input)?;
            if let Some(only) = &args.only {
                let targets: TargetNames = load_names(only)?.into_iter().collect();
                let before = names.len();
                names = retain_targets(names, &targets);
                info!(kept = names.len(), dropped = before - names.len(), "applied target filter");
            }

            let summary = SyncPipeline::new(config)?.run_once(&names).await?;
            println!(
                "run complete: run_id={} names={} resolved={} not_found={} \
                 with_errors={} assets_written={} output={}",
                summary.run_id,
                summary.total,
                summary.resolved,
                summary.not_found,
                summary.with_errors,
                summary.assets_written,
                summary.output_dir
            );
        }
        Commands::Resolve { name } => {
            let http = HttpFetcher::new(config.http_config())?;
            let api = HttpEntityApi::new(http, &config.api_config())?;
            let entity = resolve_identifier(&api, &name)
                .await
                .with_context(|| format!("resolving {name:?}"))?;
            println!("{}\t{}", entity.raw_name, entity.canonical_id.unwrap_or_default());
        }
        Commands::Flatten { results, out } => {
            let outcomes = report::load_results(&results)?;
            let rows = report::flat_rows(&outcomes);
            report::write_flat_csv(&out, &rows)?;
            println!("wrote {} rows to {}", rows.len(), out.display());
        }
    }

    Ok(())
}
