//! search-mock-server - Unix socket front end for the scripted search mock
//!
//! Usage:
//!   search-mock-server [--socket /tmp/search-mock.sock] [--host shard0 --host shard1]
//!                      [--config mock.json] [--strict-match] [--no-order-check]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]

use std::path::PathBuf;
use std::thread;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use search_mock::{MatchMode, MockServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "search-mock-server", version, about = "Scripted mock of a remote search backend")]
struct Args {
    /// JSON configuration file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unix socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Host to create at startup (repeatable)
    #[arg(long = "host")]
    hosts: Vec<String>,

    /// Compare requests exactly instead of as a subset of the expectation
    #[arg(long)]
    strict_match: bool,

    /// Let initiating queries claim any matching fresh cursor
    #[arg(long)]
    no_order_check: bool,

    #[arg(long)]
    max_frame_bytes: Option<usize>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        for host in self.hosts {
            if !config.hosts.contains(&host) {
                config.hosts.push(host);
            }
        }
        if self.strict_match {
            config.match_mode = MatchMode::Exact;
        }
        if self.no_order_check {
            config.order_check = false;
        }
        if let Some(max) = self.max_frame_bytes {
            config.max_frame_bytes = max;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("search_mock=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Args::parse().into_config()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        hosts = ?config.hosts,
        match_mode = config.match_mode.as_str(),
        order_check = config.order_check,
        "starting search-mock-server"
    );

    let server = MockServer::new(&config).context("failed to create configured hosts")?;

    // Set up signal handler for teardown reporting
    let router = server.router();
    let socket_path = config.socket_path.clone();
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("failed to register signal handlers")?;

    thread::spawn(move || {
        for sig in signals.forever() {
            tracing::info!(signal = sig, "received signal, checking for unused history");

            let problems = router.check_all_unused();
            for problem in &problems {
                tracing::error!("{}", problem);
            }

            let _ = std::fs::remove_file(&socket_path);
            tracing::info!("exiting");
            std::process::exit(if problems.is_empty() { 0 } else { 1 });
        }
    });

    server.serve().await.context("server failed")?;
    Ok(())
}
