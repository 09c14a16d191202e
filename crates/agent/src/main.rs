mod config;
mod pool;
mod server;

use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = Config::load()?;

    tokio::select! {
        result = server::run(&config) => {
            result?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}
