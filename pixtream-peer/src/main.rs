// Pixtream peer: transport, tracker client, stream source and sink around one protocol node.

mod config;
mod peer;
mod stream;
mod tracker;
mod transport;

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pixtream_core::{Node, NodeConfig, PeerId};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::peer::Peer;
use crate::stream::Source;
use crate::tracker::TrackerClient;

/// Command-line flags; each overrides the config file and environment.
#[derive(Debug, Parser)]
#[command(name = "pixtream-peer", version, about = "Pixtream live streaming peer")]
struct Args {
    /// Peer protocol listen port.
    #[arg(short = 'l', long)]
    listen_port: Option<u16>,
    /// Port the joined stream is served on.
    #[arg(short = 's', long)]
    stream_port: Option<u16>,
    /// Tracker base URL.
    #[arg(short = 't', long)]
    tracker: Option<String>,
    /// Address announced to the tracker.
    #[arg(long)]
    ip: Option<IpAddr>,
    /// Act as the stream origin: `tcp://host:port` or a file path.
    #[arg(long)]
    source: Option<String>,
    #[arg(long)]
    piece_size: Option<usize>,
    /// Cancel piece requests unanswered after this many seconds.
    #[arg(long)]
    request_timeout: Option<u64>,
}

impl Args {
    fn apply(self, c: &mut Config) {
        if let Some(p) = self.listen_port {
            c.listen_port = p;
        }
        if let Some(p) = self.stream_port {
            c.stream_port = p;
        }
        if let Some(url) = self.tracker {
            c.tracker_url = url;
        }
        if self.ip.is_some() {
            c.ip = self.ip;
        }
        if self.source.is_some() {
            c.source = self.source;
        }
        if let Some(n) = self.piece_size {
            c.piece_size = n;
        }
        if self.request_timeout.is_some() {
            c.request_timeout_secs = self.request_timeout;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut cfg = config::load();
    args.apply(&mut cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let id = PeerId::generate();
    info!(peer = %id, listen_port = cfg.listen_port, stream_port = cfg.stream_port, "starting");

    let node = Node::new(
        id,
        NodeConfig {
            piece_size: cfg.piece_size,
            request_timeout: cfg.request_timeout_secs.map(Duration::from_secs),
            ..NodeConfig::default()
        },
    );
    let tracker = TrackerClient::new(&cfg.tracker_url, id, cfg.listen_port, cfg.ip)?;
    let sink_listener = TcpListener::bind(("0.0.0.0", cfg.stream_port))
        .await
        .with_context(|| format!("cannot bind stream port {}", cfg.stream_port))?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let (utility_tx, utility_rx) = mpsc::unbounded_channel();

    let listen_events = events_tx.clone();
    let listen_port = cfg.listen_port;
    tokio::spawn(async move {
        if let Err(e) = transport::listen(listen_port, listen_events).await {
            error!(error = %e, "peer listener failed");
        }
    });
    tokio::spawn(stream::run_sink(sink_listener, sink_rx));
    tokio::spawn(tracker::run_announcer(tracker.clone(), events_tx.clone()));
    tokio::spawn(tracker::run_reporter(tracker, utility_rx));
    if let Some(source) = cfg.source.as_deref().map(Source::parse) {
        let source_events = events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = stream::run_source(source, source_events).await {
                error!(error = %e, "stream source failed");
            }
        });
    }

    let peer = Peer::new(node, events_tx, sink_tx, utility_tx);
    peer.run(events_rx, async {
        if let Err(e) = shutdown_signal().await {
            warn!(error = %e, "signal handler failed");
        }
    })
    .await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
