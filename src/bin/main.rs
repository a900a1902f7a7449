use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use webserv::application::server::{Reactor, ReactorSettings};
use webserv::config::load_config;
use webserv::core::net::socket::ignore_sigpipe;
use webserv::http::Limits;
use webserv::routing::ConfigRouter;

#[derive(Parser, Debug)]
#[command(name = "webserv", version, about = "Single-process HTTP/1.1 server")]
struct Args {
    /// Configuration file
    #[arg(env = "WEBSERV_CONFIG", default_value = "default/default.conf")]
    config: PathBuf,

    /// Log filter, e.g. `info` or `webserv=debug`. Falls back to RUST_LOG.
    #[arg(long, env = "WEBSERV_LOG_LEVEL")]
    log_level: Option<String>,

    /// Seconds a client may stay idle before it is dropped
    #[arg(long, env = "WEBSERV_TIMEOUT", default_value_t = 7)]
    timeout: u64,

    /// Largest accepted request head in bytes
    #[arg(long, env = "WEBSERV_MAX_HEADER_SIZE", default_value_t = 16 * 1024)]
    max_header_size: usize,

    /// Directory with the fallback `<code>.html` error pages
    #[arg(long, env = "WEBSERV_ERROR_PAGES", default_value = "default/errors")]
    error_pages: PathBuf,

    /// poll(2) timeout per tick; 0 never blocks
    #[arg(long, env = "WEBSERV_POLL_TIMEOUT_MS", default_value_t = 0)]
    poll_timeout_ms: i32,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());
    ignore_sigpipe();

    let config = load_config(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    let listens = config.listen_addrs();
    info!(servers = config.servers.len(), listeners = listens.len(), "configuration loaded");

    let settings = ReactorSettings {
        idle_timeout: Duration::from_secs(args.timeout),
        poll_timeout_ms: args.poll_timeout_ms,
        limits: Limits { max_head_size: args.max_header_size, ..Limits::default() },
        error_pages: args.error_pages,
    };
    let mut reactor = Reactor::bind(ConfigRouter::new(config), &listens, settings)
        .context("binding listeners")?;
    reactor.run().context("event loop failed")
}
