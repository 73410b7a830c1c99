//! drip-httpd: a minimal readiness-driven HTTP/1.1 server.
//!
//! The server answers GET and HEAD with a fixed demo payload and everything
//! else with 501. The interesting machinery is underneath: an incremental
//! resumable request parser, pooled chunked buffers, and a bounded handler
//! pool, all driven by a single-threaded mio event loop.
//!
//! Features:
//! - Incremental parsing that suspends and resumes at any byte boundary
//! - Bounded memory via a recycling chunk pool
//! - Connection cap with accept-and-drop overload behavior
//! - Configuration via CLI arguments or TOML file

mod config;
mod http;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        chunk_size = config.chunk_size,
        max_pooled_chunks = config.max_pooled_chunks,
        max_handlers = config.max_handlers,
        "Starting drip-httpd"
    );

    runtime::run(config)?;
    Ok(())
}
