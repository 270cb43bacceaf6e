//! Ackframe CLI
//!
//! Runs an ackframe server that logs (and optionally echoes) every message,
//! or connects to one and sends messages from the command line.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ackframe_core::config::{AckframeConfig, ListenAddress, LoggingConfig};
use ackframe_core::{Client, Connection, ConnectionHandler, DeflatePlugin, Server};

/// Length-prefixed, acknowledged TCP messaging.
#[derive(Parser)]
#[command(name = "ackframe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and log every message received.
    Serve(ServeArgs),
    /// Connect to a server and send messages.
    Send(SendArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Override listen addresses (ip:port, repeatable).
    #[arg(long)]
    listen: Vec<String>,

    /// Override the connection limit.
    #[arg(long)]
    max_connections: Option<usize>,

    /// Send every message back to its sender.
    ///
    /// Senders must wait for each echo before sending again (`send --wait-reply`):
    /// the protocol is half-duplex, so a message crossing an echo fails both.
    #[arg(long)]
    echo: bool,

    /// Compress payloads with zlib. Both peers must agree.
    #[arg(long)]
    deflate: bool,
}

#[derive(Args)]
struct SendArgs {
    /// Server host name or IPv4 address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(long)]
    port: u16,

    /// Compress payloads with zlib. Both peers must agree.
    #[arg(long)]
    deflate: bool,

    /// Wait for one reply per message.
    ///
    /// Required against `serve --echo` when sending more than one message:
    /// the protocol is half-duplex, and sending while an echo is in flight
    /// fails with a rejected acknowledgment.
    #[arg(long)]
    wait_reply: bool,

    /// Messages to send, in order.
    #[arg(required = true)]
    messages: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => AckframeConfig::from_file(path)
            .with_context(|| format!("loading config from {path}"))?,
        None => AckframeConfig::default(),
    };

    // Override log level from verbosity flag
    let log_config = match cli.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    // Setup tracing
    setup_tracing(&log_config);

    // Run the async runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        match cli.command {
            Command::Serve(args) => run_server(config, args).await,
            Command::Send(args) => run_sender(config, args).await,
        }
    })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

/// Logs every message; echoes it back when asked to.
struct LogHandler {
    echo: bool,
}

#[async_trait]
impl ConnectionHandler for LogHandler {
    async fn pre_loop(&mut self, conn: &Connection) {
        info!(id = %conn.id(), peer = %conn.peer_addr(), "peer connected");
    }

    async fn post_loop(&mut self, conn: &Connection) {
        info!(id = %conn.id(), "peer disconnected");
    }

    async fn on_message(&mut self, conn: &Connection, payload: Bytes) {
        info!(
            id = %conn.id(),
            len = payload.len(),
            text = %String::from_utf8_lossy(&payload),
            "message received"
        );
        if self.echo {
            if let Err(e) = conn.transmit(payload).await {
                warn!(id = %conn.id(), error = %e, "echo failed");
            }
        }
    }
}

/// Forwards every received message to the sender loop.
struct ReplyHandler {
    replies: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl ConnectionHandler for ReplyHandler {
    async fn on_message(&mut self, _conn: &Connection, payload: Bytes) {
        let _ = self.replies.send(payload);
    }
}

async fn run_server(mut config: AckframeConfig, args: ServeArgs) -> anyhow::Result<()> {
    // Apply CLI overrides
    if !args.listen.is_empty() {
        config.server.listen = args
            .listen
            .iter()
            .map(|s| parse_listen(s))
            .collect::<anyhow::Result<_>>()?;
    }
    if args.max_connections.is_some() {
        config.server.max_connections = args.max_connections;
    }
    if config.server.listen.is_empty() {
        bail!("no listen address: pass --listen ip:port or set server.listen in the config");
    }

    let mut server = Server::from_config(&config.server)?;
    let echo = args.echo;
    server.set_connection_handler(move || -> Box<dyn ConnectionHandler> {
        Box::new(LogHandler { echo })
    });
    if args.deflate {
        server.register_connection_plugin_type::<DeflatePlugin>();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = ?config.server.listen,
        max_connections = ?config.server.max_connections,
        echo,
        deflate = args.deflate,
        "starting ackframe server"
    );

    let handle = server.start().await?;

    shutdown_signal().await;
    info!("shutdown signal received, stopping server");
    handle.shutdown_and_wait().await;

    info!("server shutdown complete");
    Ok(())
}

async fn run_sender(config: AckframeConfig, args: SendArgs) -> anyhow::Result<()> {
    let reply_timeout = Duration::from_millis(config.client.connect_timeout_ms);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

    let mut client = Client::new(config.client)?;
    client.set_connection_handler(move || -> Box<dyn ConnectionHandler> {
        Box::new(ReplyHandler {
            replies: reply_tx.clone(),
        })
    });
    if args.deflate {
        client.register_connection_plugin_type::<DeflatePlugin>();
    }

    let id = client.connect_to(&args.host, args.port).await?;
    let conn = client
        .connection(&id)
        .context("connection vanished before use")?;
    conn.wait_established().await?;
    info!(host = %args.host, port = args.port, "connected");

    for message in args.messages {
        conn.transmit(message.clone()).await?;
        if conn.is_shutdown() {
            bail!("connection closed while sending {message:?}");
        }
        info!(len = message.len(), "message sent");

        if args.wait_reply {
            let reply = tokio::time::timeout(reply_timeout, reply_rx.recv())
                .await
                .context("timed out waiting for reply")?
                .context("connection closed before reply")?;
            println!("{}", String::from_utf8_lossy(&reply));
        }
    }

    client.shutdown().await;
    Ok(())
}

fn parse_listen(s: &str) -> anyhow::Result<ListenAddress> {
    let (ip, port) = s
        .rsplit_once(':')
        .with_context(|| format!("listen address '{s}' must be ip:port"))?;
    let port = port
        .parse()
        .with_context(|| format!("invalid port in listen address '{s}'"))?;
    let address = ListenAddress::new(ip, port);
    address.to_socket_addr()?;
    Ok(address)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
