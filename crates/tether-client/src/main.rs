//! tether-client entry point.
//!
//! Connects to a tether server, sends each `--message` `--count` times and
//! waits for its echo, optionally measures ping round trips, then closes the
//! session.  A dropped connection is re-established after
//! `--reconnect-interval` and the server is asked to resume the session.
//!
//! ```text
//! tether-client --url ws://127.0.0.1:8080/ --message hello --count 3 --ping
//! ```

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_client::infrastructure::network::{ClientConnection, ClientConnectionConfig, ClientError};
use tether_net::{CancelToken, Message};

#[derive(Debug, Parser)]
#[command(name = "tether-client", version, about = "WebSocket client with session resumption")]
struct Cli {
    /// Server URL.
    #[arg(long, env = "TETHER_URL", default_value = "ws://127.0.0.1:8080/")]
    url: String,

    /// Text message to send; repeat for several.
    #[arg(long, short, default_value = "hello")]
    message: Vec<String>,

    /// How many times to send the message set.
    #[arg(long, short, default_value_t = 1)]
    count: u32,

    /// Measure a ping round trip after each round.
    #[arg(long)]
    ping: bool,

    /// Seconds to wait before reconnecting after a dropped connection.
    #[arg(long, env = "TETHER_RECONNECT_INTERVAL", default_value_t = 5)]
    reconnect_interval: u64,

    /// Give up after this many failed connection attempts in a row.
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,
}

fn main() -> anyhow::Result<()> {
    // Initialise structured logging.  Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ClientConnectionConfig {
        url: cli.url.clone(),
        reconnect_interval: Duration::from_secs(cli.reconnect_interval),
        ..ClientConnectionConfig::default()
    };
    let connection = ClientConnection::new(config).context("invalid --url")?;
    let cancel = CancelToken::new();

    connection
        .connect_with_retry(Some(cli.max_attempts), &cancel)
        .with_context(|| format!("connecting to {}", cli.url))?;

    for round in 1..=cli.count {
        for text in &cli.message {
            let reply = with_reconnect(&connection, &cli, &cancel, |c| c.round_trip(text))?;
            match reply {
                Message::Text(echoed) => info!("round {round}: sent {text:?}, received {echoed:?}"),
                other => info!("round {round}: sent {text:?}, received {other:?}"),
            }
        }
        if cli.ping {
            let rtt = with_reconnect(&connection, &cli, &cancel, |c| c.ping(b"tether-client"))?;
            info!("round {round}: ping round trip {:.3} ms", rtt.as_secs_f64() * 1_000.0);
        }
    }

    connection.disconnect();
    info!("tether-client done");
    Ok(())
}

/// Runs `op`, reconnecting (and resuming) and retrying once per lost
/// connection until `op` succeeds or reconnecting fails.
fn with_reconnect<T>(
    connection: &ClientConnection,
    cli: &Cli,
    cancel: &CancelToken,
    mut op: impl FnMut(&ClientConnection) -> Result<T, ClientError>,
) -> anyhow::Result<T> {
    loop {
        match op(connection) {
            Ok(value) => return Ok(value),
            Err(e) if e.is_connection_lost() => {
                warn!("connection lost ({e}); reconnecting in {:?}", connection.config().reconnect_interval);
                if cancel.wait_timeout(connection.config().reconnect_interval) {
                    anyhow::bail!("cancelled while reconnecting");
                }
                let connected = connection
                    .connect_with_retry(Some(cli.max_attempts), cancel)
                    .with_context(|| format!("reconnecting to {}", cli.url))?;
                info!("reconnected (resumed: {})", connected.resumed);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
