//! Stream adapters: a source feeding raw bytes into the node, and a TCP sink serving the
//! joined stream to local players.

use std::path::PathBuf;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::peer::Event;

const READ_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// `tcp://host:port`
    Tcp(String),
    File(PathBuf),
}

impl Source {
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix("tcp://") {
            Some(addr) => Source::Tcp(addr.trim_end_matches('/').to_string()),
            None => Source::File(PathBuf::from(s)),
        }
    }
}

/// Read the source to the end, then signal the end of the stream.
pub async fn run_source(source: Source, events: mpsc::UnboundedSender<Event>) -> anyhow::Result<()> {
    info!(?source, "reading stream source");
    match &source {
        Source::Tcp(addr) => {
            let stream = TcpStream::connect(addr.as_str())
                .await
                .with_context(|| format!("cannot connect to source {addr}"))?;
            pump(stream, &events).await?;
        }
        Source::File(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("cannot open source {}", path.display()))?;
            pump(file, &events).await?;
        }
    }
    info!("stream source ended");
    let _ = events.send(Event::SourceEnd);
    Ok(())
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, events: &mpsc::UnboundedSender<Event>) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(READ_BUF);
    loop {
        buf.reserve(READ_BUF);
        if reader.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        if events.send(Event::SourceData(buf.split().freeze())).is_err() {
            return Ok(());
        }
    }
}

#[derive(Debug)]
pub enum SinkEvent {
    Data(Bytes),
    End,
}

/// Serve the joined stream. Each new client first gets everything joined so far, then live
/// data. Once the stream ends, clients are closed after their backlog is written.
pub async fn run_sink(listener: TcpListener, mut rx: mpsc::UnboundedReceiver<SinkEvent>) {
    let mut history: Vec<Bytes> = Vec::new();
    let mut clients: Vec<mpsc::UnboundedSender<Bytes>> = Vec::new();
    let mut ended = false;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!(%addr, "stream client connected");
                    let tx = spawn_client(stream);
                    for chunk in &history {
                        let _ = tx.send(chunk.clone());
                    }
                    if !ended {
                        clients.push(tx);
                    }
                }
                Err(e) => warn!(error = %e, "stream accept failed"),
            },
            ev = rx.recv() => match ev {
                Some(SinkEvent::Data(bytes)) => {
                    clients.retain(|c| c.send(bytes.clone()).is_ok());
                    history.push(bytes);
                }
                Some(SinkEvent::End) => {
                    ended = true;
                    clients.clear();
                }
                None => return,
            },
        }
    }
}

fn spawn_client(mut stream: TcpStream) -> mpsc::UnboundedSender<Bytes> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if stream.write_all(&chunk).await.is_err() {
                return;
            }
        }
        let _ = stream.shutdown().await;
    });
    tx
}
