//! Host-driven API: the `Node` receives events from the host and returns actions.
//! Owns the piece manager and the connection pool; nothing else mutates them.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::bitfield::MAX_BITFIELD_SPAN;
use crate::chunk::{Joiner, Piece, Splitter, DEFAULT_PIECE_SIZE};
use crate::connection::{ConnId, Dispatch, ProtocolViolation};
use crate::identity::PeerId;
use crate::manager::{AdmissionError, ConnectionManager};
use crate::piece_manager::PieceManager;
use crate::protocol::{Handshake, Message};
use crate::timer::{Task, Timers};
use crate::tracker::TrackerPeer;
use crate::utility::UtilityTracker;
use crate::wire::{self, DecodeError, FrameDecodeError};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub piece_size: usize,
    /// Pieces considered per scheduling round.
    pub request_limit: usize,
    pub schedule_interval: Duration,
    pub dial_interval: Duration,
    pub heartbeat_interval: Duration,
    pub utility_interval: Duration,
    /// Outstanding requests older than this are cancelled. `None` keeps them forever.
    pub request_timeout: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            piece_size: DEFAULT_PIECE_SIZE,
            request_limit: 16,
            schedule_interval: Duration::from_millis(500),
            dial_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            utility_interval: Duration::from_secs(30),
            request_timeout: None,
        }
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Write a length-prefixed frame to the connection.
    Send(ConnId, Bytes),
    /// Drop the transport; no message is sent to the partner.
    Close(ConnId),
    Dial { peer_id: PeerId, addr: SocketAddr },
    /// Newly contiguous stream bytes for the sink.
    StreamData(Bytes),
    StreamEnded,
    ReportUtility(Vec<(PeerId, u64)>),
    ConnectionsChanged {
        incoming: Vec<PeerId>,
        outgoing: Vec<PeerId>,
    },
}

/// Why a connection was dropped.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolViolation),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
}

/// Main coordinator. Host passes events; node returns actions.
pub struct Node {
    id: PeerId,
    config: NodeConfig,
    pieces: PieceManager,
    conns: ConnectionManager,
    splitter: Splitter,
    joiner: Joiner,
    utility: UtilityTracker,
    timers: Timers,
}

impl Node {
    pub fn new(id: PeerId, config: NodeConfig) -> Self {
        let mut timers = Timers::new();
        timers.register(Task::SchedulePieces, config.schedule_interval);
        timers.register(Task::DialPeers, config.dial_interval);
        timers.register(Task::HeartBeat, config.heartbeat_interval);
        timers.register(Task::ReportUtility, config.utility_interval);
        if let Some(timeout) = config.request_timeout {
            timers.register(Task::ExpireRequests, timeout);
        }
        Self {
            id,
            splitter: Splitter::new(config.piece_size),
            config,
            pieces: PieceManager::new(),
            conns: ConnectionManager::new(id),
            joiner: Joiner::new(),
            utility: UtilityTracker::new(),
            timers,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn pieces(&self) -> &PieceManager {
        &self.pieces
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.conns
    }

    pub fn utility(&self) -> &UtilityTracker {
        &self.utility
    }

    /// Virtual time since start.
    pub fn now(&self) -> Duration {
        self.timers.now()
    }

    /// Accepted socket. The partner must handshake first.
    pub fn on_inbound_connection(&mut self, addr: SocketAddr) -> ConnId {
        let conn = self.conns.open_inbound(Some(addr));
        debug!(%conn, %addr, "inbound connection");
        conn
    }

    /// Dial to `peer_id` connected. Our handshake goes out immediately.
    pub fn on_dial_connected(&mut self, peer_id: PeerId) -> (ConnId, Vec<OutboundAction>) {
        let addr = self.conns.peer_database().get_peer(&peer_id).map(TrackerPeer::addr);
        let conn = self.conns.dial_established(peer_id, addr);
        debug!(%conn, peer = %peer_id, "outbound connection");
        let mut actions = Vec::new();
        self.send(conn, &Message::Handshake(Handshake::new(self.id)), &mut actions);
        if let Some(c) = self.conns.get_mut(conn) {
            c.mark_outgoing_handshake();
        }
        (conn, actions)
    }

    pub fn on_dial_failed(&mut self, peer_id: PeerId) {
        debug!(peer = %peer_id, "dial failed");
        self.conns.dial_failed(&peer_id);
    }

    /// Transport bytes for `conn`. Records are dispatched one at a time, in arrival order;
    /// the first error closes and deregisters the connection.
    pub fn on_data(&mut self, conn: ConnId, data: &[u8]) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        match self.conns.get_mut(conn) {
            Some(c) => c.reader_mut().push(data),
            None => return actions,
        }
        loop {
            let frame = match self.conns.get_mut(conn) {
                Some(c) => c.reader_mut().next_frame(),
                None => break,
            };
            let result = match frame {
                Ok(Some(body)) => self.handle_frame(conn, &body, &mut actions),
                Ok(None) => break,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                debug!(%conn, error = %e, "dropping connection");
                self.drop_connection(conn, true, &mut actions);
                break;
            }
        }
        actions
    }

    /// Transport closed by the host or the partner.
    pub fn on_connection_closed(&mut self, conn: ConnId) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        self.drop_connection(conn, false, &mut actions);
        actions
    }

    /// Fresh tracker view. Unconnected peers are dialed right away.
    pub fn on_tracker_peers(&mut self, peers: Vec<TrackerPeer>) -> Vec<OutboundAction> {
        self.conns.update_peers(peers);
        info!(peers = self.conns.peer_database().len(), "tracker peer list updated");
        let mut actions = Vec::new();
        self.dial_peers(&mut actions);
        actions
    }

    /// Raw bytes from the stream source.
    pub fn on_source_data(&mut self, data: &[u8]) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        for piece in self.splitter.push_stream(data) {
            self.acquire_piece(piece, &mut actions);
        }
        actions
    }

    /// Source exhausted: flush the last partial piece and end the joined stream.
    pub fn on_source_end(&mut self) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if let Some(piece) = self.splitter.end_stream() {
            self.acquire_piece(piece, &mut actions);
        }
        let dropped = self.joiner.end_join();
        if dropped > 0 {
            warn!(dropped, "stream ended with unjoined pieces");
        }
        actions.push(OutboundAction::StreamEnded);
        actions
    }

    /// A piece produced locally.
    pub fn add_piece(&mut self, piece: Piece) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        self.acquire_piece(piece, &mut actions);
        actions
    }

    /// Choke or unchoke a partner. While choked it gets no `GotPiece` or heartbeats;
    /// its requests are still served.
    pub fn set_choking(&mut self, partner: PeerId, choke: bool) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        let Some(conn) = self.conns.get_connection(&partner) else {
            return actions;
        };
        let changed = match self.conns.get_mut(conn) {
            Some(c) if c.choked != choke => {
                c.choked = choke;
                true
            }
            _ => false,
        };
        if changed {
            let msg = if choke { Message::Choke } else { Message::Unchoke };
            self.send(conn, &msg, &mut actions);
        }
        actions
    }

    /// Move virtual time forward and run whatever periodic work is due.
    pub fn advance(&mut self, elapsed: Duration) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        for task in self.timers.advance(elapsed) {
            match task {
                Task::SchedulePieces => self.schedule_pieces(&mut actions),
                Task::DialPeers => self.dial_peers(&mut actions),
                Task::HeartBeat => self.send_heartbeats(&mut actions),
                Task::ReportUtility => {
                    if !self.utility.is_empty() {
                        actions.push(OutboundAction::ReportUtility(self.utility.snapshot()));
                    }
                }
                Task::ExpireRequests => self.expire_requests(&mut actions),
            }
        }
        actions
    }

    fn handle_frame(
        &mut self,
        conn: ConnId,
        body: &[u8],
        actions: &mut Vec<OutboundAction>,
    ) -> Result<(), ConnectionError> {
        let msg = wire::decode_message(body)?;
        if let Message::Handshake(hs) = msg {
            return self.on_handshake(conn, hs, actions);
        }
        let (dispatch, partner) = {
            let Some(c) = self.conns.get_mut(conn) else {
                return Ok(());
            };
            let dispatch = c.handle(msg)?;
            let partner = c.partner_id().ok_or(ProtocolViolation::NotHandshaked)?;
            (dispatch, partner)
        };
        match dispatch {
            Dispatch::Nothing => {}
            Dispatch::GotPiece(sequence) => self.pieces.record_partner_piece(partner, sequence),
            Dispatch::Bitfield(pieces) => self.pieces.record_partner_pieces(partner, pieces),
            Dispatch::PieceRequested(sequence) => {
                self.pieces.mark_partner_request(partner, sequence);
                self.flush_pending_sends(actions);
            }
            Dispatch::RequestCancelled(sequence) => {
                self.pieces.cancel_partner_request(&partner, sequence)
            }
            Dispatch::PieceArrived { sequence, data } => {
                if !self.pieces.is_requested(&partner, sequence) {
                    debug!(%conn, peer = %partner, sequence, "ignoring unrequested piece");
                    return Ok(());
                }
                self.utility.add(partner, data.len() as u64);
                self.acquire_piece(Piece { sequence, data }, actions);
            }
            Dispatch::BitfieldRequested => self.send_bitfield(conn, actions),
        }
        Ok(())
    }

    fn on_handshake(
        &mut self,
        conn: ConnId,
        hs: Handshake,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<(), ConnectionError> {
        let allowed = self.conns.connection_allowed(&hs.peer_id);
        let Some(c) = self.conns.get(conn) else {
            return Ok(());
        };
        let partner = c.check_incoming_handshake(&hs, allowed)?;
        self.conns.register(conn, partner)?;
        let reply = match self.conns.get_mut(conn) {
            Some(c) => {
                c.complete_incoming_handshake(partner);
                c.is_inbound()
            }
            None => return Ok(()),
        };
        if reply {
            self.send(conn, &Message::Handshake(Handshake::new(self.id)), actions);
            if let Some(c) = self.conns.get_mut(conn) {
                c.mark_outgoing_handshake();
            }
        }
        info!(%conn, peer = %partner, "handshake complete");
        self.send(conn, &Message::Unchoke, actions);
        self.send_bitfield(conn, actions);
        self.connections_changed(actions);
        Ok(())
    }

    fn drop_connection(&mut self, conn: ConnId, close: bool, actions: &mut Vec<OutboundAction>) {
        let Some(removed) = self.conns.remove(conn) else {
            return;
        };
        if close {
            actions.push(OutboundAction::Close(conn));
        }
        if removed.registered {
            if let Some(partner) = removed.conn.partner_id() {
                self.pieces.drop_partner(&partner);
                info!(%conn, peer = %partner, "connection closed");
            }
            self.connections_changed(actions);
        }
    }

    fn connections_changed(&self, actions: &mut Vec<OutboundAction>) {
        actions.push(OutboundAction::ConnectionsChanged {
            incoming: self.conns.incoming_ids(),
            outgoing: self.conns.outgoing_ids(),
        });
    }

    /// Store a newly owned piece, feed the joiner, announce it, and serve anyone waiting for it.
    fn acquire_piece(&mut self, piece: Piece, actions: &mut Vec<OutboundAction>) {
        let sequence = piece.sequence;
        if !self.pieces.add_own_piece(sequence, piece.data.clone()) {
            return;
        }
        if let Some(bytes) = self.joiner.push_piece(piece) {
            actions.push(OutboundAction::StreamData(bytes));
        }
        for conn in self.conns.handshaked() {
            if self.conns.get(conn).is_some_and(|c| !c.choked) {
                self.send(conn, &Message::GotPiece { sequence }, actions);
            }
        }
        self.flush_pending_sends(actions);
    }

    fn flush_pending_sends(&mut self, actions: &mut Vec<OutboundAction>) {
        for (partner, sequence) in self.pieces.pieces_pending_send() {
            let Some(conn) = self.conns.get_connection(&partner) else {
                continue;
            };
            let Some(data) = self.pieces.piece(sequence).cloned() else {
                continue;
            };
            self.send(conn, &Message::DataPacket { sequence, data }, actions);
            self.pieces.mark_sent(&partner, sequence);
        }
    }

    /// Full ownership for one partner. The bitfield starts at our lowest piece and spans at
    /// most `MAX_BITFIELD_SPAN` sequences; pieces past that go out as `GotPiece`.
    fn send_bitfield(&mut self, conn: ConnId, actions: &mut Vec<OutboundAction>) {
        let mut pieces = self.pieces.own_sequences();
        let beyond = match pieces.first().and_then(|f| f.checked_add(MAX_BITFIELD_SPAN)) {
            Some(end) => pieces.split_off(&end),
            None => BTreeSet::new(),
        };
        self.send(conn, &Message::PieceBitfield { pieces }, actions);
        if !beyond.is_empty() {
            debug!(%conn, pieces = beyond.len(), "announcing pieces outside the bitfield window");
        }
        for sequence in beyond {
            self.send(conn, &Message::GotPiece { sequence }, actions);
        }
    }

    /// Rarest-first round: each wanted piece goes to the lowest-id holder we can ask
    /// over a live connection.
    fn schedule_pieces(&mut self, actions: &mut Vec<OutboundAction>) {
        let now = self.timers.now();
        for sequence in self.pieces.select_pieces_to_request(self.config.request_limit) {
            let target = self
                .pieces
                .best_partner_for(sequence, |partner| self.live_connection(partner).is_some())
                .and_then(|partner| Some((partner, self.live_connection(&partner)?)));
            match target {
                Some((partner, conn)) => {
                    self.send(conn, &Message::RequestPiece { sequence }, actions);
                    self.pieces.mark_requested(partner, sequence, now);
                }
                None => debug!(sequence, "no partner to request piece from"),
            }
        }
    }

    /// Handshaked connection to `partner`, if any.
    fn live_connection(&self, partner: &PeerId) -> Option<ConnId> {
        let conn = self.conns.get_connection(partner)?;
        self.conns.get(conn)?.handshaked().then_some(conn)
    }

    fn dial_peers(&mut self, actions: &mut Vec<OutboundAction>) {
        for peer in self.conns.peers_to_dial() {
            if self.conns.begin_dial(peer.id) {
                debug!(peer = %peer.id, addr = %peer.addr(), "dialing");
                actions.push(OutboundAction::Dial {
                    peer_id: peer.id,
                    addr: peer.addr(),
                });
            }
        }
    }

    fn send_heartbeats(&mut self, actions: &mut Vec<OutboundAction>) {
        for conn in self.conns.handshaked() {
            if self.conns.get(conn).is_some_and(|c| !c.choked) {
                self.send(conn, &Message::HeartBeat, actions);
            }
        }
    }

    fn expire_requests(&mut self, actions: &mut Vec<OutboundAction>) {
        let Some(timeout) = self.config.request_timeout else {
            return;
        };
        for (partner, sequence) in self.pieces.expire_requests(self.timers.now(), timeout) {
            debug!(peer = %partner, sequence, "request expired");
            if let Some(conn) = self.conns.get_connection(&partner) {
                self.send(conn, &Message::CancelRequest { sequence }, actions);
            }
        }
    }

    fn send(&mut self, conn: ConnId, msg: &Message, actions: &mut Vec<OutboundAction>) {
        match wire::encode_frame(msg) {
            Ok(frame) => {
                if let Some(c) = self.conns.get_mut(conn) {
                    c.bytes_sent = c.bytes_sent.saturating_add(frame.len() as u64);
                }
                actions.push(OutboundAction::Send(conn, frame));
            }
            Err(e) => warn!(%conn, message = msg.name(), error = %e, "cannot encode message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u8) -> PeerId {
        PeerId::new([b'a' + n; 20])
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn tracker_peer(n: u8) -> TrackerPeer {
        TrackerPeer {
            id: pid(n),
            ip: "127.0.0.1".parse().unwrap(),
            port: 60000 + n as u16,
        }
    }

    /// Concatenated frames sent on `conn`.
    fn sent_on(actions: &[OutboundAction], conn: ConnId) -> Vec<u8> {
        let mut out = Vec::new();
        for a in actions {
            if let OutboundAction::Send(c, bytes) = a {
                if *c == conn {
                    out.extend_from_slice(bytes);
                }
            }
        }
        out
    }

    fn messages_on(actions: &[OutboundAction], conn: ConnId) -> Vec<Message> {
        let bytes = sent_on(actions, conn);
        let mut rest = &bytes[..];
        let mut out = Vec::new();
        while !rest.is_empty() {
            let (msg, used) = wire::decode_frame(rest).unwrap();
            out.push(msg);
            rest = &rest[used..];
        }
        out
    }

    fn frame(msg: Message) -> Bytes {
        wire::encode_frame(&msg).unwrap()
    }

    fn piece(seq: u32) -> Piece {
        Piece::new(seq, vec![seq as u8; 4])
    }

    struct Pair {
        a: Node,
        b: Node,
        /// A's side (inbound).
        a_conn: ConnId,
        /// B's side (outbound to A).
        b_conn: ConnId,
        /// Bytes B sent that A has not processed yet, and vice versa.
        to_a: Vec<u8>,
        to_b: Vec<u8>,
    }

    impl Pair {
        /// B dials A; nothing delivered yet.
        fn new(config: NodeConfig) -> Self {
            let mut a = Node::new(pid(1), config.clone());
            let mut b = Node::new(pid(2), config);
            let dials = b.on_tracker_peers(vec![tracker_peer(1)]);
            assert!(matches!(dials[..], [OutboundAction::Dial { peer_id, .. }] if peer_id == pid(1)));
            let (b_conn, actions) = b.on_dial_connected(pid(1));
            let a_conn = a.on_inbound_connection(addr(50000));
            Pair {
                a,
                b,
                a_conn,
                b_conn,
                to_a: sent_on(&actions, b_conn),
                to_b: Vec::new(),
            }
        }

        fn connected(config: NodeConfig) -> Self {
            let mut pair = Self::new(config);
            pair.settle();
            assert!(pair.a.connections().get(pair.a_conn).unwrap().handshaked());
            assert!(pair.b.connections().get(pair.b_conn).unwrap().handshaked());
            pair
        }

        fn deliver_to_a(&mut self) -> Vec<OutboundAction> {
            let bytes = std::mem::take(&mut self.to_a);
            let actions = self.a.on_data(self.a_conn, &bytes);
            self.to_b.extend(sent_on(&actions, self.a_conn));
            actions
        }

        fn deliver_to_b(&mut self) -> Vec<OutboundAction> {
            let bytes = std::mem::take(&mut self.to_b);
            let actions = self.b.on_data(self.b_conn, &bytes);
            self.to_a.extend(sent_on(&actions, self.b_conn));
            actions
        }

        /// A acquires a piece; its announcements are queued for B.
        fn a_add(&mut self, seq: u32) {
            let actions = self.a.add_piece(piece(seq));
            self.queue_a(&actions);
        }

        fn b_add(&mut self, seq: u32) {
            let actions = self.b.add_piece(piece(seq));
            self.queue_b(&actions);
        }

        fn queue_a(&mut self, actions: &[OutboundAction]) {
            self.to_b.extend(sent_on(actions, self.a_conn));
        }

        fn queue_b(&mut self, actions: &[OutboundAction]) {
            self.to_a.extend(sent_on(actions, self.b_conn));
        }

        /// Shuttle bytes until both sides are quiet.
        fn settle(&mut self) {
            while !self.to_a.is_empty() || !self.to_b.is_empty() {
                self.deliver_to_a();
                self.deliver_to_b();
            }
        }
    }

    #[test]
    fn handshake_exchange_sends_unchoke_and_bitfield() {
        let mut pair = Pair::new(NodeConfig::default());
        pair.a.add_piece(piece(0));
        pair.a.add_piece(piece(2));
        let at_a = pair.deliver_to_a();
        let sent = messages_on(&at_a, pair.a_conn);
        assert_eq!(
            sent,
            vec![
                Message::Handshake(Handshake::new(pid(1))),
                Message::Unchoke,
                Message::PieceBitfield {
                    pieces: [0, 2].into()
                },
            ]
        );
        assert!(at_a.contains(&OutboundAction::ConnectionsChanged {
            incoming: vec![pid(2)],
            outgoing: vec![],
        }));

        let at_b = pair.deliver_to_b();
        // B's handshake already went out on connect.
        let sent = messages_on(&at_b, pair.b_conn);
        assert_eq!(sent[0], Message::Unchoke);
        assert!(matches!(sent[1], Message::PieceBitfield { ref pieces } if pieces.is_empty()));
        assert_eq!(
            pair.b.pieces().partner_pieces(&pid(1)),
            Some(&[0, 2].into())
        );
        assert_eq!(pair.b.connections().outgoing_ids(), vec![pid(1)]);
    }

    #[test]
    fn message_before_handshake_drops_connection() {
        let mut node = Node::new(pid(1), NodeConfig::default());
        let conn = node.on_inbound_connection(addr(50000));
        let actions = node.on_data(conn, &frame(Message::GotPiece { sequence: 7 }));
        assert_eq!(actions, vec![OutboundAction::Close(conn)]);
        assert!(node.connections().get(conn).is_none());
        assert!(node.pieces().select_pieces_to_request(10).is_empty());
    }

    #[test]
    fn garbage_drops_connection_only() {
        let mut node = Node::new(pid(1), NodeConfig::default());
        let good = node.on_inbound_connection(addr(50000));
        let bad = node.on_inbound_connection(addr(50001));
        node.on_data(good, &frame(Message::Handshake(Handshake::new(pid(2)))));
        let actions = node.on_data(bad, &[0, 0, 0, 1, b'Z']);
        assert_eq!(actions, vec![OutboundAction::Close(bad)]);
        assert!(node.connections().get(good).unwrap().handshaked());
    }

    #[test]
    fn records_after_fatal_error_are_ignored() {
        let mut node = Node::new(pid(1), NodeConfig::default());
        let conn = node.on_inbound_connection(addr(50000));
        let mut bytes = frame(Message::Choke).to_vec();
        bytes.extend_from_slice(&frame(Message::Handshake(Handshake::new(pid(2)))));
        let actions = node.on_data(conn, &bytes);
        assert_eq!(actions, vec![OutboundAction::Close(conn)]);
        assert!(node.connections().incoming_ids().is_empty());
    }

    #[test]
    fn double_handshake_drops_and_deregisters() {
        let mut pair = Pair::connected(NodeConfig::default());
        pair.b_add(5);
        pair.settle();
        assert!(pair.a.pieces().partner_pieces(&pid(2)).is_some());
        let actions = pair
            .a
            .on_data(pair.a_conn, &frame(Message::Handshake(Handshake::new(pid(2)))));
        assert!(actions.contains(&OutboundAction::Close(pair.a_conn)));
        assert!(actions.contains(&OutboundAction::ConnectionsChanged {
            incoming: vec![],
            outgoing: vec![],
        }));
        assert!(pair.a.pieces().partner_pieces(&pid(2)).is_none());
    }

    #[test]
    fn duplicate_partner_rejected_without_touching_live_link() {
        let mut pair = Pair::connected(NodeConfig::default());
        pair.b_add(3);
        pair.settle();
        let dup = pair.a.on_inbound_connection(addr(50001));
        let actions = pair
            .a
            .on_data(dup, &frame(Message::Handshake(Handshake::new(pid(2)))));
        assert_eq!(actions, vec![OutboundAction::Close(dup)]);
        assert_eq!(pair.a.connections().get_connection(&pid(2)), Some(pair.a_conn));
        assert_eq!(
            pair.a.pieces().partner_pieces(&pid(2)),
            Some(&[3].into())
        );
    }

    #[test]
    fn outbound_rejects_wrong_responder() {
        let mut node = Node::new(pid(2), NodeConfig::default());
        node.on_tracker_peers(vec![tracker_peer(1)]);
        let (conn, _) = node.on_dial_connected(pid(1));
        let actions = node.on_data(conn, &frame(Message::Handshake(Handshake::new(pid(3)))));
        assert_eq!(actions, vec![OutboundAction::Close(conn)]);
        // The in-flight marker was cleared on connect, so the target can be dialed again.
        let again = node.advance(Duration::ZERO);
        assert!(again
            .iter()
            .any(|a| matches!(a, OutboundAction::Dial { peer_id, .. } if *peer_id == pid(1))));
    }

    #[test]
    fn end_to_end_piece_exchange() {
        let mut pair = Pair::connected(NodeConfig::default());
        for seq in 0..3 {
            pair.a_add(seq);
        }
        pair.settle();
        assert_eq!(
            pair.b.pieces().partner_pieces(&pid(1)),
            Some(&[0, 1, 2].into())
        );

        let scheduled = pair.b.advance(Duration::ZERO);
        let requests = messages_on(&scheduled, pair.b_conn);
        assert!(requests.contains(&Message::RequestPiece { sequence: 0 }));
        pair.queue_b(&scheduled);

        let at_a = pair.deliver_to_a();
        assert!(messages_on(&at_a, pair.a_conn).contains(&Message::DataPacket {
            sequence: 0,
            data: piece(0).data,
        }));

        let at_b = pair.deliver_to_b();
        assert!(pair.b.pieces().has_piece(0));
        assert_eq!(pair.b.pieces().own_sequences(), [0, 1, 2].into());
        assert!(messages_on(&at_b, pair.b_conn).contains(&Message::GotPiece { sequence: 0 }));
        let streamed: Vec<u8> = at_b
            .iter()
            .filter_map(|a| match a {
                OutboundAction::StreamData(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(streamed, [vec![0u8; 4], vec![1; 4], vec![2; 4]].concat());
        assert_eq!(pair.b.utility().get(&pid(1)), 12);
        assert_eq!(pair.b.pieces().outstanding_requests(&pid(1)), 0);
    }

    /// Inbound connection on `node` from `partner`, handshake done.
    fn accept(node: &mut Node, partner: PeerId, port: u16) -> ConnId {
        let conn = node.on_inbound_connection(addr(port));
        node.on_data(conn, &frame(Message::Handshake(Handshake::new(partner))));
        assert!(node.connections().get(conn).unwrap().handshaked());
        conn
    }

    #[test]
    fn received_piece_announced_to_every_unchoked_partner() {
        let mut hub = Node::new(pid(1), NodeConfig::default());
        let source = accept(&mut hub, pid(2), 50002);
        let viewer = accept(&mut hub, pid(3), 50003);
        let choked = accept(&mut hub, pid(4), 50004);
        hub.set_choking(pid(4), true);

        hub.on_data(source, &frame(Message::GotPiece { sequence: 0 }));
        let scheduled = hub.advance(Duration::ZERO);
        assert!(messages_on(&scheduled, source).contains(&Message::RequestPiece { sequence: 0 }));
        assert!(!messages_on(&scheduled, viewer).contains(&Message::RequestPiece { sequence: 0 }));

        let actions = hub.on_data(
            source,
            &frame(Message::DataPacket {
                sequence: 0,
                data: piece(0).data,
            }),
        );
        assert!(hub.pieces().has_piece(0));
        assert_eq!(
            messages_on(&actions, source),
            vec![Message::GotPiece { sequence: 0 }]
        );
        assert_eq!(
            messages_on(&actions, viewer),
            vec![Message::GotPiece { sequence: 0 }]
        );
        assert!(messages_on(&actions, choked).is_empty());
    }

    #[test]
    fn unrequested_piece_is_ignored() {
        let mut pair = Pair::connected(NodeConfig::default());
        pair.to_b.extend_from_slice(&frame(Message::DataPacket {
            sequence: u32::MAX,
            data: Bytes::from_static(b"junk"),
        }));
        let at_b = pair.deliver_to_b();
        assert!(at_b.is_empty());
        assert!(!pair.b.pieces().has_piece(u32::MAX));
        assert_eq!(pair.b.utility().get(&pid(1)), 0);
        assert!(pair.b.connections().get(pair.b_conn).unwrap().handshaked());

        // A late answer to a request already fulfilled by someone else is dropped too.
        pair.a_add(0);
        pair.settle();
        let scheduled = pair.b.advance(Duration::ZERO);
        assert!(messages_on(&scheduled, pair.b_conn).contains(&Message::RequestPiece { sequence: 0 }));
        pair.b.add_piece(piece(0));
        pair.to_b.extend_from_slice(&frame(Message::DataPacket {
            sequence: 0,
            data: piece(0).data,
        }));
        pair.deliver_to_b();
        assert_eq!(pair.b.utility().get(&pid(1)), 0);
    }

    #[test]
    fn far_pieces_do_not_widen_the_bitfield() {
        let mut pair = Pair::new(NodeConfig::default());
        pair.a.add_piece(piece(0));
        pair.a.add_piece(piece(u32::MAX));
        let at_a = pair.deliver_to_a();
        assert_eq!(
            messages_on(&at_a, pair.a_conn),
            vec![
                Message::Handshake(Handshake::new(pid(1))),
                Message::Unchoke,
                Message::PieceBitfield {
                    pieces: [0].into()
                },
                Message::GotPiece {
                    sequence: u32::MAX
                },
            ]
        );
        pair.deliver_to_b();
        assert_eq!(
            pair.b.pieces().partner_pieces(&pid(1)),
            Some(&[0, u32::MAX].into())
        );
    }

    #[test]
    fn request_for_missing_piece_served_when_acquired() {
        let mut pair = Pair::connected(NodeConfig::default());
        pair.to_a
            .extend_from_slice(&frame(Message::RequestPiece { sequence: 4 }));
        let at_a = pair.deliver_to_a();
        assert!(messages_on(&at_a, pair.a_conn).is_empty());
        let actions = pair.a.add_piece(piece(4));
        let sent = messages_on(&actions, pair.a_conn);
        assert!(sent.contains(&Message::GotPiece { sequence: 4 }));
        assert!(sent.contains(&Message::DataPacket {
            sequence: 4,
            data: piece(4).data
        }));
    }

    #[test]
    fn cancelled_request_not_served() {
        let mut pair = Pair::connected(NodeConfig::default());
        pair.to_a
            .extend_from_slice(&frame(Message::RequestPiece { sequence: 4 }));
        pair.to_a
            .extend_from_slice(&frame(Message::CancelRequest { sequence: 4 }));
        pair.deliver_to_a();
        let actions = pair.a.add_piece(piece(4));
        assert_eq!(
            messages_on(&actions, pair.a_conn),
            vec![Message::GotPiece { sequence: 4 }]
        );
    }

    #[test]
    fn bitfield_on_request() {
        let mut pair = Pair::connected(NodeConfig::default());
        pair.a.add_piece(piece(9));
        pair.to_a.extend_from_slice(&frame(Message::RequestBitfield));
        let at_a = pair.deliver_to_a();
        assert_eq!(
            messages_on(&at_a, pair.a_conn),
            vec![Message::PieceBitfield {
                pieces: [9].into()
            }]
        );
    }

    #[test]
    fn choking_suppresses_announcements_not_data() {
        let mut pair = Pair::connected(NodeConfig::default());
        let actions = pair.a.set_choking(pid(2), true);
        assert_eq!(messages_on(&actions, pair.a_conn), vec![Message::Choke]);
        pair.queue_a(&actions);
        pair.deliver_to_b();
        assert!(pair.b.connections().get(pair.b_conn).unwrap().partner_choked);
        // Idempotent.
        assert!(pair.a.set_choking(pid(2), true).is_empty());

        let actions = pair.a.add_piece(piece(0));
        assert!(messages_on(&actions, pair.a_conn).is_empty());
        let beats = pair.a.advance(Duration::ZERO);
        assert!(!messages_on(&beats, pair.a_conn).contains(&Message::HeartBeat));

        pair.to_a
            .extend_from_slice(&frame(Message::RequestPiece { sequence: 0 }));
        let at_a = pair.deliver_to_a();
        assert_eq!(
            messages_on(&at_a, pair.a_conn),
            vec![Message::DataPacket {
                sequence: 0,
                data: piece(0).data
            }]
        );

        let actions = pair.a.set_choking(pid(2), false);
        assert_eq!(messages_on(&actions, pair.a_conn), vec![Message::Unchoke]);
    }

    #[test]
    fn closed_partner_no_longer_scheduled() {
        let mut pair = Pair::connected(NodeConfig::default());
        pair.a_add(0);
        pair.settle();
        pair.b.on_connection_closed(pair.b_conn);
        assert!(pair.b.pieces().partner_pieces(&pid(1)).is_none());
        let actions = pair.b.advance(Duration::ZERO);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, OutboundAction::Send(..))));
    }

    #[test]
    fn requests_never_expire_by_default() {
        let mut pair = Pair::connected(NodeConfig::default());
        pair.a_add(0);
        pair.settle();
        let first = pair.b.advance(Duration::ZERO);
        assert!(messages_on(&first, pair.b_conn).contains(&Message::RequestPiece { sequence: 0 }));
        // A never answers.
        let later = pair.b.advance(Duration::from_secs(3600));
        let sent = messages_on(&later, pair.b_conn);
        assert!(!sent.contains(&Message::RequestPiece { sequence: 0 }));
        assert!(!sent.contains(&Message::CancelRequest { sequence: 0 }));
        assert_eq!(pair.b.pieces().outstanding_requests(&pid(1)), 1);
    }

    #[test]
    fn request_timeout_cancels_and_reissues() {
        let config = NodeConfig {
            request_timeout: Some(Duration::from_secs(10)),
            ..NodeConfig::default()
        };
        let mut pair = Pair::connected(config);
        pair.a_add(0);
        pair.settle();
        pair.b.advance(Duration::ZERO);
        assert_eq!(pair.b.pieces().outstanding_requests(&pid(1)), 1);

        let actions = pair.b.advance(Duration::from_secs(11));
        let sent = messages_on(&actions, pair.b_conn);
        assert!(sent.contains(&Message::CancelRequest { sequence: 0 }));
        // Expiry runs after scheduling in this round; the re-request comes on the next one.
        assert!(!sent.contains(&Message::RequestPiece { sequence: 0 }));
        assert_eq!(pair.b.pieces().outstanding_requests(&pid(1)), 0);
        let again = pair.b.advance(Duration::from_millis(500));
        assert!(messages_on(&again, pair.b_conn).contains(&Message::RequestPiece { sequence: 0 }));
    }

    #[test]
    fn tracker_peers_dialed_once() {
        let mut node = Node::new(pid(0), NodeConfig::default());
        let actions = node.on_tracker_peers(vec![tracker_peer(0), tracker_peer(1), tracker_peer(2)]);
        let dialed: Vec<PeerId> = actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Dial { peer_id, .. } => Some(*peer_id),
                _ => None,
            })
            .collect();
        assert_eq!(dialed, vec![pid(1), pid(2)]);
        // In flight: not dialed again by the periodic task.
        let tick = node.advance(Duration::ZERO);
        assert!(!tick.iter().any(|a| matches!(a, OutboundAction::Dial { .. })));
        node.on_dial_failed(pid(1));
        let tick = node.advance(Duration::from_secs(5));
        assert!(tick.contains(&OutboundAction::Dial {
            peer_id: pid(1),
            addr: tracker_peer(1).addr(),
        }));
    }

    #[test]
    fn source_splits_and_streams() {
        let config = NodeConfig {
            piece_size: 4,
            ..NodeConfig::default()
        };
        let mut node = Node::new(pid(0), config);
        let actions = node.on_source_data(b"abcdefghij");
        assert_eq!(node.pieces().own_sequences(), [0, 1].into());
        assert_eq!(
            actions,
            vec![
                OutboundAction::StreamData(Bytes::from_static(b"abcd")),
                OutboundAction::StreamData(Bytes::from_static(b"efgh")),
            ]
        );
        let actions = node.on_source_end();
        assert_eq!(
            actions,
            vec![
                OutboundAction::StreamData(Bytes::from_static(b"ij")),
                OutboundAction::StreamEnded,
            ]
        );
        assert_eq!(node.pieces().last_contiguous(), Some(2));
    }

    #[test]
    fn utility_reported_when_nonempty() {
        let mut pair = Pair::connected(NodeConfig::default());
        assert!(!pair
            .b
            .advance(Duration::ZERO)
            .iter()
            .any(|a| matches!(a, OutboundAction::ReportUtility(_))));
        pair.a_add(0);
        pair.settle();
        let scheduled = pair.b.advance(Duration::from_millis(500));
        pair.queue_b(&scheduled);
        pair.settle();
        let report = pair.b.advance(Duration::from_secs(30));
        assert!(report.contains(&OutboundAction::ReportUtility(vec![(pid(1), 4)])));
    }
}
