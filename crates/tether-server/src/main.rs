//! tether-server entry point.
//!
//! Loads the configuration, applies command-line overrides, starts the
//! WebSocket echo listener and runs until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()            -- TOML file, defaults when absent
//!  └─ NetContext::new()        -- multiplexer, session table, logger
//!  └─ Server::start_listening()
//!       └─ ConnectionListener  (accept thread)
//!            └─ WorkerPool     (WebSocketEchoHandler per connection)
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_net::NetContext;
use tether_server::application::echo::WebSocketEchoFactory;
use tether_server::infrastructure::network::listener::ConnectionListener;
use tether_server::infrastructure::network::server::Server;
use tether_server::infrastructure::storage::config::{load_config, load_config_from};

#[derive(Debug, Parser)]
#[command(name = "tether-server", version, about = "WebSocket echo server with resumable sessions")]
struct Cli {
    /// Configuration file (defaults to the platform config directory).
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind, overriding `server.bind_address`.
    #[arg(long, env = "TETHER_BIND")]
    bind: Option<String>,

    /// Port to listen on; repeat for several.  Overrides `server.ports`.
    #[arg(long, short, env = "TETHER_PORT", value_delimiter = ',')]
    port: Vec<u16>,

    /// Serve reads through the shared multiplexer.
    #[arg(long, env = "TETHER_MULTIPLEXED")]
    multiplexed: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => load_config().context("loading configuration")?,
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }
    if !cli.port.is_empty() {
        config.server.ports = cli.port;
    }
    if cli.multiplexed {
        config.server.multiplexed = true;
    }

    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    info!("tether-server starting");

    // ── Networking context ────────────────────────────────────────────────────
    let context = NetContext::new(config.select_config());
    let factory = Arc::new(WebSocketEchoFactory::new(
        config.server.ports.clone(),
        context.clone(),
        config.echo_config(),
    ));

    // ── Listener ──────────────────────────────────────────────────────────────
    let listener_config = config.listener_config().context("invalid listener settings")?;
    let listener = ConnectionListener::new(listener_config, context.clone()).with_factory(factory);
    let mut server = Server::new();
    server.add_listener(listener);
    server.start_listening().context("starting listeners")?;
    info!(
        "tether-server ready on port(s) {:?} (multiplexed: {}).  Press Ctrl-C to exit.",
        server.get_ports(),
        config.server.multiplexed
    );

    // ── Ctrl-C / SIGTERM handler ──────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        } else {
            warn!("could not listen for Ctrl-C, shutting down");
        }
        running_clone.store(false, Ordering::Relaxed);
    });

    while running.load(Ordering::Relaxed) {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    // Joining threads blocks, keep it off the runtime's worker threads.
    tokio::task::spawn_blocking(move || {
        server.stop_listening();
        context.shutdown();
    })
    .await
    .context("shutting down")?;

    info!("tether-server stopped");
    Ok(())
}
