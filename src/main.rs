//! Service launcher for the research agent.
//!
//! Exit codes: `0` clean shutdown, `1` fatal configuration error,
//! `2` runtime abort.

use anyhow::Context;
use clap::Parser;
use deep_research_agent::{PipelinePool, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "research-agentd", about = "LLM agent orchestration service")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration.
    #[arg(long)]
    listen: Option<String>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

async fn build_pool(cli: &Cli) -> anyhow::Result<Arc<PipelinePool>> {
    let mut settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = &cli.listen {
        settings.listen_addr = listen.clone();
    }
    PipelinePool::initialize(Arc::new(settings))
        .await
        .context("initializing pipeline pool")
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let pool = match build_pool(&cli).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("startup failed: {:#}", e);
            return ExitCode::from(1);
        }
    };

    match deep_research_agent::server::serve(pool).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("runtime abort: {}", e);
            ExitCode::from(2)
        }
    }
}
