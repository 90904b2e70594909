//! memcached-lite server binary.
//!
//! Configuration via CLI arguments, `HOST`/`PORT` environment variables,
//! or a TOML file. Runs on a single-threaded runtime; connections are
//! multiplexed cooperatively and serialized only at the store lock.

use memcached_lite::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        store = %config.store_path.display(),
        greeting = config.greeting,
        max_delay_ms = config.max_delay.as_millis() as u64,
        on_malformed = ?config.on_malformed,
        "Starting memcached-lite server"
    );

    let server = Server::bind(&config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
