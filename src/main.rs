use anyhow::Context;
use clap::Parser;

use nsi_provider_agent::domain::clock::clock::WallClock;
use nsi_provider_agent::domain::provider::backend::backend_type::BackendType;
use nsi_provider_agent::domain::provider::provider_agent::ProviderAgent;
use nsi_provider_agent::{load_provider_config, logger};

#[derive(Parser, Debug)]
#[command(name = "nsi-provider-agent", about = "Provider agent for the NSI connection service")]
struct Args {
    /// Path to the provider configuration file.
    #[arg(short, long, default_value = "data/provider.json")]
    config: String,

    /// Overrides `logging.level` from the configuration.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_provider_config(&args.config).with_context(|| format!("loading configuration '{}'", args.config))?;
    logger::init(args.log_level.as_deref().unwrap_or(&config.log_level));

    let backend = BackendType::get_instance(&config.backend).context("creating NRM backend")?;
    let agent = ProviderAgent::start(config, backend, WallClock::shared()).await.context("starting provider agent")?;

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    log::info!("Shutdown requested.");
    agent.shutdown().await;

    Ok(())
}
