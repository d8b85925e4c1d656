//! socket-table server
//!
//! Serves an in-memory key-value table to TCP clients speaking
//! newline-delimited JSON. Configuration comes from CLI arguments or a TOML
//! file; keys listed under `watch` get a logging callback.

use socket_table::callback::LoggingCallback;
use socket_table::config::Config;
use socket_table::runtime;
use socket_table::store::Store;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
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
        listen = %config.listen,
        max_connections = config.max_connections,
        read_buffer_size = config.read_buffer_size,
        max_frame_size = config.max_frame_size,
        watched = config.watch.len(),
        "Starting socket-table server"
    );

    let mut store = Store::new();
    for key in &config.watch {
        store.register_callback(key.clone(), LoggingCallback::new(key.clone()));
        info!(key = %key, "Watching key");
    }

    let store = runtime::run(&config, store)?;
    info!(entries = store.len(), "Server stopped");
    Ok(())
}
