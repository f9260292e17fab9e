pub mod config;
pub mod db;
pub mod hardware;
pub mod models;
pub mod pipeline;
pub mod pipeline_config; // Pool sizing from host resources

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over `debug`.
pub fn init_tracing(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter(debug))),
        )
        .with_thread_names(true)
        .try_init();
}
