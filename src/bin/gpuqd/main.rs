use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Gpuqd::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();
    tracing::debug!("Parsed CLI arguments: {args:?}");

    let config = gpuq::config::load_config(args.config.as_ref())
        .map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;

    gpuq::server::run(config).await
}
