//! The peer actor: sole owner of the `Node`. Socket tasks, the tracker and the stream
//! source talk to it through one event channel; its actions fan back out to them.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use pixtream_core::{ConnId, Node, OutboundAction, PeerId, TrackerPeer};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

use crate::stream::SinkEvent;
use crate::transport::{self, ConnHandle};

/// Granularity of the node's virtual clock.
const TICK: Duration = Duration::from_millis(100);

pub enum Event {
    Accepted(TcpStream, SocketAddr),
    Connected(PeerId, TcpStream),
    DialFailed(PeerId),
    Data(ConnId, Bytes),
    Closed(ConnId),
    TrackerPeers(Vec<TrackerPeer>),
    SourceData(Bytes),
    SourceEnd,
}

pub struct Peer {
    node: Node,
    conns: HashMap<ConnId, ConnHandle>,
    events: mpsc::UnboundedSender<Event>,
    sink: mpsc::UnboundedSender<SinkEvent>,
    utility: mpsc::UnboundedSender<Vec<(PeerId, u64)>>,
}

impl Peer {
    pub fn new(
        node: Node,
        events: mpsc::UnboundedSender<Event>,
        sink: mpsc::UnboundedSender<SinkEvent>,
        utility: mpsc::UnboundedSender<Vec<(PeerId, u64)>>,
    ) -> Self {
        Self {
            node,
            conns: HashMap::new(),
            events,
            sink,
            utility,
        }
    }

    /// Process events and clock ticks until `shutdown` resolves.
    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Event>,
        shutdown: impl Future<Output = ()>,
    ) {
        let mut ticker = tokio::time::interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                now = ticker.tick() => {
                    let actions = self.node.advance(now.saturating_duration_since(last));
                    last = now;
                    self.perform(actions);
                }
                ev = rx.recv() => match ev {
                    Some(ev) => self.handle(ev),
                    None => break,
                },
            }
        }
        info!(connections = self.conns.len(), "shutting down");
        for (_, handle) in self.conns.drain() {
            handle.close();
        }
    }

    fn handle(&mut self, ev: Event) {
        let actions = match ev {
            Event::Accepted(stream, addr) => {
                let conn = self.node.on_inbound_connection(addr);
                self.attach(conn, stream);
                Vec::new()
            }
            Event::Connected(peer_id, stream) => {
                let (conn, actions) = self.node.on_dial_connected(peer_id);
                self.attach(conn, stream);
                actions
            }
            Event::DialFailed(peer_id) => {
                self.node.on_dial_failed(peer_id);
                Vec::new()
            }
            Event::Data(conn, bytes) => self.node.on_data(conn, &bytes),
            Event::Closed(conn) => {
                self.conns.remove(&conn);
                self.node.on_connection_closed(conn)
            }
            Event::TrackerPeers(peers) => self.node.on_tracker_peers(peers),
            Event::SourceData(bytes) => self.node.on_source_data(&bytes),
            Event::SourceEnd => self.node.on_source_end(),
        };
        self.perform(actions);
    }

    fn attach(&mut self, conn: ConnId, stream: TcpStream) {
        let handle = transport::spawn_connection(conn, stream, self.events.clone());
        self.conns.insert(conn, handle);
    }

    fn perform(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Send(conn, frame) => {
                    if let Some(handle) = self.conns.get(&conn) {
                        handle.send(frame);
                    }
                }
                OutboundAction::Close(conn) => {
                    if let Some(handle) = self.conns.remove(&conn) {
                        handle.close();
                    }
                }
                OutboundAction::Dial { peer_id, addr } => {
                    tokio::spawn(transport::dial(
                        peer_id,
                        addr,
                        transport::DIAL_TIMEOUT,
                        self.events.clone(),
                    ));
                }
                OutboundAction::StreamData(bytes) => {
                    let _ = self.sink.send(SinkEvent::Data(bytes));
                }
                OutboundAction::StreamEnded => {
                    let _ = self.sink.send(SinkEvent::End);
                }
                OutboundAction::ReportUtility(utility) => {
                    let _ = self.utility.send(utility);
                }
                OutboundAction::ConnectionsChanged { incoming, outgoing } => {
                    info!(
                        incoming = incoming.len(),
                        outgoing = outgoing.len(),
                        "connections changed"
                    );
                }
            }
        }
    }
}
