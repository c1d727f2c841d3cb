//! iso8583-listener: TCP listener for length-prefixed ISO-8583 messages
//!
//! Features:
//! - 4-digit ASCII length framing
//! - Single reactor thread with a bounded worker pool
//! - Peer allow-list
//! - Configuration via CLI arguments or TOML file

use iso8583_listener::config::{Config, SinkKind};
use iso8583_listener::{EchoSink, InjectionSink, Listener, LogSink, RawPacker};
use std::sync::Arc;
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
        allow_list = config.allow_list.is_restricted(),
        core_threads = config.pool.core_threads,
        max_threads = config.pool.max_threads,
        queue_len = config.pool.queue_len,
        sink = ?config.sink,
        "Starting iso8583-listener"
    );

    let sink: Arc<dyn InjectionSink> = match config.sink {
        SinkKind::Echo => Arc::new(EchoSink),
        SinkKind::Log => Arc::new(LogSink),
    };

    let listener = Listener::new(config, Arc::new(RawPacker), sink);
    listener.start()?;
    listener.join();

    Ok(())
}
