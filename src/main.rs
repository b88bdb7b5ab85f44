//! hellod: a minimal event-driven TCP greeting server
//!
//! One thread owns a readiness-based event loop. Connections are accepted
//! non-blockingly, every successful read is answered with `Hello\n`, and the
//! connection stays open until the client closes it or an error occurs.
//!
//! Features:
//! - Single-threaded reactor (epoll/kqueue via mio)
//! - Pooled read buffers with exact acquire/release pairing
//! - Configuration via CLI arguments or TOML file

mod config;
mod reactor;

use config::Config;
use reactor::Reactor;
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

    // The encrypted transport is a seam, not an implementation.
    if config.secure {
        return Err("secure transport is not implemented; run without --secure".into());
    }

    info!(
        bind = %config.bind,
        port = config.port,
        backlog = config.backlog,
        "Starting hellod"
    );

    let mut reactor = Reactor::new(config.listener())?;
    reactor.run()?;
    Ok(())
}
