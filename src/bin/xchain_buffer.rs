//! Standalone buffer service entrypoint, for deployments that run the
//! upload buffer on a separate host from the aggregator daemon.

use clap::Parser;

use xchain_aggregator::buffer::{router, BufferState};

#[derive(Parser)]
#[command(name = "xchain-buffer", about = "standalone piece upload buffer")]
struct Args {
    #[arg(long, default_value = "./buffer")]
    buffer_path: std::path::PathBuf,

    #[arg(long, default_value_t = 5077)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    xchain_aggregator::logger::init();
    let args = Args::parse();

    let state = BufferState::new(args.buffer_path)?;
    let app = router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "buffer service listening");
    axum::serve(listener, app).await?;
    Ok(())
}
