use anyhow::Result;
use clap::Parser;

mod config;
mod etcd;
mod logging;
mod operator;
mod providers;

use config::ConfigLoader;
use operator::Operator;

#[derive(Parser)]
#[command(name = "eco-operator")]
#[command(version)]
#[command(about = "Converges an elastic group of machines into a healthy etcd cluster")]
struct Cli {
    /// Load configuration from the specified file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the configured logging level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new(cli.config.as_deref()).load()?;
    logging::init_logging(&config.logging, cli.log_level.as_deref())?;

    tracing::info!(
        check_interval = ?config.check_interval,
        asg_provider = %config.asg.provider,
        snapshot_provider = %config.snapshot.provider,
        "starting operator"
    );

    let mut operator = Operator::new(config).await?;
    operator.run().await
}
