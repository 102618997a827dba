//! echoserve: a reactor-pattern TCP echo server
//!
//! A bounded pool of event-loop threads accepts connections, multiplexes
//! readiness across many sockets, and runs each connection's bytes
//! through a per-connection pipeline that echoes them back.
//!
//! Features:
//! - Boss/worker event-loop groups with round-robin connection handoff
//! - Optional TLS (rustls) as the first pipeline stage
//! - Graceful shutdown on SIGINT/SIGTERM with bounded drain
//! - Configuration via CLI arguments or TOML file

mod config;
mod pipeline;
mod reactor;
mod server;

use config::Config;
use server::Server;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::Arc;
use std::thread;
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
        host = %config.host,
        port = config.port,
        tls = config.tls,
        boss_threads = config.boss_threads,
        worker_threads = config.worker_count(),
        "Starting echoserve"
    );

    let server = Arc::new(Server::start(&config)?);

    // Translate SIGINT/SIGTERM into a close request.
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    {
        let server = Arc::clone(&server);
        thread::Builder::new()
            .name("signals".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!(signal, "shutdown signal received");
                    server.close();
                }
            })?;
    }

    // Block until close is requested, then drain in order.
    server.await_close();
    server.shutdown_gracefully();

    Ok(())
}
