use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use marquee_publish::{ContentApiConfig, ContentApiSink};
use marquee_sync::{SyncConfig, SyncPipeline};
use marquee_transform::RuntimeHours;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "marquee")]
#[command(about = "Build the curated movie dataset from the public title snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, curate and export one snapshot (the default).
    Sync(SyncArgs),
    /// Remove staged archives and tables.
    Clean {
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Number of export partitions.
    #[arg(long)]
    parts: Option<usize>,
    #[arg(long)]
    workdir: Option<PathBuf>,
    #[arg(long)]
    export_dir: Option<PathBuf>,
    /// Derive hours from the leading digit of the runtime.
    #[arg(long)]
    legacy_runtime_hours: bool,
    /// Keep the title identifier as the first export column.
    #[arg(long)]
    include_id: bool,
    /// Upload partitions to the configured content repository.
    #[arg(long)]
    publish: bool,
}

impl SyncArgs {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(workdir) = &self.workdir {
            config.workdir = workdir.clone();
            if self.export_dir.is_none() {
                config.export_dir = workdir.clone();
            }
        }
        if let Some(export_dir) = &self.export_dir {
            config.export_dir = export_dir.clone();
        }
        if let Some(parts) = self.parts {
            config.parts = parts;
        }
        if self.legacy_runtime_hours {
            config.runtime_hours = RuntimeHours::LegacyLeadingDigit;
        }
        if self.include_id {
            config.export_include_id = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let mut config = SyncConfig::from_env();
            args.apply(&mut config);

            let mut pipeline = SyncPipeline::new(config)?;
            if args.publish {
                let sink = ContentApiSink::new(ContentApiConfig::from_env()?)?;
                pipeline = pipeline.with_sink(Box::new(sink));
            }

            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} movies={} partitions={} published={} manifest={}",
                summary.run_id,
                summary.movies,
                summary.partitions.len(),
                summary.published,
                summary.manifest
            );
        }
        Commands::Clean { workdir } => {
            let mut config = SyncConfig::from_env();
            if let Some(workdir) = workdir {
                config.workdir = workdir;
            }
            let removed = SyncPipeline::new(config)?.clean().await?;
            println!("clean complete: removed={removed}");
        }
    }

    Ok(())
}
