//! Daemon entrypoint: runs the aggregator until interrupted.

use clap::Parser;
use tokio_util::sync::CancellationToken;

use xchain_aggregator::aggregator::Aggregator;
use xchain_aggregator::config::Config;

#[derive(Parser)]
#[command(name = "xchaind", about = "EVM-to-Filecoin data bridge aggregator daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "./config.toml")]
    config: std::path::PathBuf,

    /// Name of the source chain to subscribe to, as configured under
    /// `[sources.<name>]`.
    #[arg(long)]
    source_chain: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    xchain_aggregator::logger::init();
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    let aggregator = Aggregator::new(config, args.source_chain);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received interrupt, shutting down");
            cancel.cancel();
        }
    });

    aggregator.run(cancel).await?;
    Ok(())
}
