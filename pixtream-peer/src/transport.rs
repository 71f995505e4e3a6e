//! TCP transport: listener (inbound), dialer (outbound to tracker peers), and one
//! reader/writer task pair per connection. Framing and protocol live in the node.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use pixtream_core::{ConnId, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::peer::Event;

const READ_BUF: usize = 64 * 1024;
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Write side of a live connection, owned by the peer actor.
pub struct ConnHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

impl ConnHandle {
    pub fn send(&self, frame: Bytes) {
        let _ = self.tx.send(frame);
    }

    /// Stop reading; the writer exits once its queue is dropped, closing the socket.
    pub fn close(self) {
        self.reader.abort();
    }
}

/// Accept forever; each socket is handed to the actor.
pub async fn listen(port: u16, events: mpsc::UnboundedSender<Event>) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for peers");
    loop {
        let (stream, addr) = listener.accept().await?;
        if events.send(Event::Accepted(stream, addr)).is_err() {
            return Ok(());
        }
    }
}

pub async fn dial(
    peer_id: PeerId,
    addr: SocketAddr,
    timeout: Duration,
    events: mpsc::UnboundedSender<Event>,
) {
    let event = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Event::Connected(peer_id, stream),
        Ok(Err(e)) => {
            debug!(peer = %peer_id, %addr, error = %e, "connect failed");
            Event::DialFailed(peer_id)
        }
        Err(_) => {
            debug!(peer = %peer_id, %addr, "connect timed out");
            Event::DialFailed(peer_id)
        }
    };
    let _ = events.send(event);
}

/// Split the socket into a writer fed by the returned handle and a reader that forwards
/// raw bytes as `Event::Data`, then `Event::Closed` on EOF or error.
pub fn spawn_connection(
    conn: ConnId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<Event>,
) -> ConnHandle {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_BUF);
        loop {
            buf.reserve(READ_BUF);
            match reader.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if events.send(Event::Data(conn, buf.split().freeze())).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(%conn, error = %e, "read failed");
                    break;
                }
            }
        }
        let _ = events.send(Event::Closed(conn));
    });

    ConnHandle { tx, reader }
}
