use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use video_curation_pipeline::engine::SystemClock;
use video_curation_pipeline::stages::{init_workspace, status_digest};
use video_curation_pipeline::{output, Cli, Commands, Config, ExecutionContext, PipelineRunner};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "video_curation_pipeline=debug"
    } else {
        "video_curation_pipeline=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Run { stage, max_items } => {
            let config = Config::load(cli.config.as_deref()).await?;
            let context =
                ExecutionContext::new(Arc::new(SystemClock::new())).with_progress(!cli.quiet);
            let runner = PipelineRunner::new(config, context).with_max_items(max_items);

            tracing::info!("Starting pipeline run: {}", stage);
            let started = Instant::now();
            let results = runner.run(stage).await;
            output::print_run_summary(&results, started.elapsed().as_secs_f64());
        }
        Commands::Status => {
            let config = Config::load(cli.config.as_deref()).await?;
            output::print_status(&status_digest(&config));
        }
        Commands::Init => {
            let path = cli.config.unwrap_or_else(|| PathBuf::from("config.yaml"));
            let config = if path.exists() {
                Config::load_from(&path)?
            } else {
                let config = Config::default();
                config.save(&path).await?;
                println!("Configuration written to: {}", path.display());
                config
            };

            let created = init_workspace(&config)?;
            if created.is_empty() {
                println!("Workspace already initialised");
            }
            for path in created {
                println!("Created: {}", path.display());
            }
        }
        Commands::Config { show } => {
            let config = Config::load(cli.config.as_deref()).await?;
            if show {
                config.display();
            } else {
                let path = match cli.config {
                    Some(path) => path,
                    None => Config::config_path()?,
                };
                println!("Configuration file: {}", path.display());
                println!("Run with --show to print the active settings");
            }
        }
        Commands::Stages => {
            output::print_stages();
        }
    }

    Ok(())
}
