//! The per-connection state machine and server-side demultiplexer (sections
//! 4.F and 4.G).

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::packet::frame::{AckFrame, Frame, StreamFrame};
use crate::packet::header::{Header, LongHeader};
use crate::packet::packet::{Packet, MIN_CLIENT_INITIAL, MTU};
use crate::packet::packetnum;
use crate::packet::types::{Ciphersuite, ConnectionId, KeyPhase, LongHeaderType};
use crate::primitives::rand::random_connection_id;
use crate::result::{QuicheError, QuicheResult};

use super::ack::{self, AckScoreboard};
use super::config::{Config, Event};
use super::reliability::ReliabilityQueue;
use super::stream::{StreamChunk, StreamPair, FIRST_CLIENT_STREAM_ID, FIRST_SERVER_STREAM_ID, STREAM_ID_STEP};
use super::tls::{BufferedInput, LoopbackTlsEngine, TlsEngine, TlsOutcome};
use super::types::{ConnectionState, Role};

/// A connection (client, server parent, or server child; section 3).
pub struct Connection {
    pub role: Role,
    pub state: ConnectionState,
    pub version: u32,
    pub connection_id: ConnectionId,
    pub peer_addr: Option<SocketAddr>,

    socket: Arc<UdpSocket>,
    next_send_pn: u64,
    next_expected_recv_pn: u64,

    streams: HashMap<u32, StreamPair>,
    reliability: ReliabilityQueue,
    acks: AckScoreboard,

    tls: Box<dyn TlsEngine + Send>,
    ciphersuite: Option<Ciphersuite>,
    send_secret: Option<[u8; 48]>,
    recv_secret: Option<[u8; 48]>,

    pending_events: VecDeque<Event>,
    start_time: Instant,
    last_recv_time: Instant,
    /// Original (pre-decompression) packet-number value of the most
    /// recently decoded packet, kept only for diagnostics (section 3).
    last_received_pn_raw: Option<u64>,
    /// Deadline set by `check_peer`; if no datagram arrives before it, the
    /// connection is considered unresponsive (section 5).
    ping_deadline: Option<Instant>,

    next_client_stream_id: u32,
    next_server_stream_id: u32,

    supported_versions: Vec<u32>,

    /// When set, the core never touches the socket or drives the TLS
    /// engine itself: outgoing datagrams surface as `Event::Transmit`,
    /// incoming ones must be handed in via [`Connection::supply_datagram`],
    /// and handshake bytes surface as `Event::TlsInput` instead of being
    /// fed to an internal [`TlsEngine`] (section 4.E, `appHandlesSendRecv`).
    app_handles_send_recv: bool,

    /// Server-parent-only: children keyed by the server-chosen connection ID.
    children: HashMap<ConnectionId, Connection>,
    /// Server-parent-only: client-proposed ID -> (server ID, first-seen).
    /// Deduplicates repeated client initials for up to 4000ms (section 4.D/4.G).
    recent_client_ids: HashMap<ConnectionId, (ConnectionId, Instant)>,
}

const RECENT_INITIAL_TTL: std::time::Duration = std::time::Duration::from_millis(4000);

impl Connection {
    pub async fn new_client(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: &Config,
    ) -> QuicheResult<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        socket.connect(peer_addr).await?;
        Ok(Self {
            role: Role::Client,
            state: ConnectionState::Uninitialized,
            version: config.initial_version(),
            connection_id: random_connection_id(),
            peer_addr: Some(peer_addr),
            socket: Arc::new(socket),
            next_send_pn: 0,
            next_expected_recv_pn: 0,
            streams: HashMap::new(),
            reliability: ReliabilityQueue::new(),
            acks: AckScoreboard::new(),
            tls: Box::new(LoopbackTlsEngine::client()),
            ciphersuite: None,
            send_secret: None,
            recv_secret: None,
            pending_events: VecDeque::new(),
            start_time: Instant::now(),
            last_recv_time: Instant::now(),
            last_received_pn_raw: None,
            ping_deadline: None,
            next_client_stream_id: FIRST_CLIENT_STREAM_ID,
            next_server_stream_id: FIRST_SERVER_STREAM_ID,
            supported_versions: vec![config.preferred_version()],
            app_handles_send_recv: config.app_handles_send_recv,
            children: HashMap::new(),
            recent_client_ids: HashMap::new(),
        })
    }

    pub async fn new_server_parent(local_addr: SocketAddr, config: &Config) -> QuicheResult<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        Ok(Self {
            role: Role::ServerParent,
            state: ConnectionState::ServerListen,
            version: config.preferred_version(),
            connection_id: 0,
            peer_addr: None,
            socket: Arc::new(socket),
            next_send_pn: 0,
            next_expected_recv_pn: 0,
            streams: HashMap::new(),
            reliability: ReliabilityQueue::new(),
            acks: AckScoreboard::new(),
            tls: Box::new(LoopbackTlsEngine::server()),
            ciphersuite: None,
            send_secret: None,
            recv_secret: None,
            pending_events: VecDeque::new(),
            start_time: Instant::now(),
            last_recv_time: Instant::now(),
            last_received_pn_raw: None,
            ping_deadline: None,
            next_client_stream_id: FIRST_CLIENT_STREAM_ID,
            next_server_stream_id: FIRST_SERVER_STREAM_ID,
            supported_versions: vec![config.preferred_version()],
            app_handles_send_recv: config.app_handles_send_recv,
            children: HashMap::new(),
            recent_client_ids: HashMap::new(),
        })
    }

    fn new_server_child(
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        socket: Arc<UdpSocket>,
        version: u32,
        app_handles_send_recv: bool,
    ) -> Self {
        Self {
            role: Role::ServerChild,
            state: ConnectionState::Server0Rtt,
            version,
            connection_id,
            peer_addr: Some(peer_addr),
            socket,
            next_send_pn: 0,
            next_expected_recv_pn: 0,
            streams: HashMap::new(),
            reliability: ReliabilityQueue::new(),
            acks: AckScoreboard::new(),
            tls: Box::new(LoopbackTlsEngine::server()),
            ciphersuite: None,
            send_secret: None,
            recv_secret: None,
            pending_events: VecDeque::new(),
            start_time: Instant::now(),
            last_recv_time: Instant::now(),
            last_received_pn_raw: None,
            ping_deadline: None,
            next_client_stream_id: FIRST_CLIENT_STREAM_ID,
            next_server_stream_id: FIRST_SERVER_STREAM_ID,
            supported_versions: vec![version],
            app_handles_send_recv,
            children: HashMap::new(),
            recent_client_ids: HashMap::new(),
        }
    }

    pub fn emit(&mut self, event: Event) {
        trace!(?event, connection_id = self.connection_id, "event");
        self.pending_events.push_back(event);
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        self.pending_events.drain(..).collect()
    }

    pub fn start_client(&mut self) {
        self.state = ConnectionState::ClientStart;
        debug!(connection_id = self.connection_id, "starting client handshake");
    }

    pub fn open_stream(&mut self) -> u32 {
        let id = match self.role {
            Role::Client => {
                let id = self.next_client_stream_id;
                self.next_client_stream_id += STREAM_ID_STEP;
                id
            }
            _ => {
                let id = self.next_server_stream_id;
                self.next_server_stream_id += STREAM_ID_STEP;
                id
            }
        };
        self.streams.insert(id, StreamPair::new(id));
        id
    }

    pub fn write(&mut self, stream_id: u32, data: &[u8], fin: bool) -> QuicheResult<()> {
        let stream = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| StreamPair::new(stream_id));
        let chunks = stream.out.write(data, fin)?;
        for chunk in chunks {
            self.reliability.enqueue(chunk);
        }
        Ok(())
    }

    pub fn end_stream(&mut self, stream_id: u32) -> QuicheResult<()> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| QuicheError::misuse("end_stream on unknown stream"))?;
        let chunks = stream.out.end_stream()?;
        for chunk in chunks {
            self.reliability.enqueue(chunk);
        }
        Ok(())
    }

    /// Reads whatever contiguous bytes have reassembled so far. A stream
    /// the peer hasn't sent anything on yet simply has nothing available,
    /// not an error, since the host may poll a stream before any frame for
    /// it has arrived.
    pub fn read(&mut self, stream_id: u32, avail: usize) -> QuicheResult<(Vec<u8>, bool)> {
        let stream = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| StreamPair::new(stream_id));
        Ok(stream.in_.read(avail))
    }

    pub fn close(&mut self, error_code: u32, reason: &str) -> QuicheResult<()> {
        if self.state.is_closed() {
            return Err(QuicheError::misuse("connection already closed"));
        }
        let pn = self.next_send_pn;
        self.next_send_pn += 1;
        let frame = Frame::Close {
            error_code,
            reason: reason.as_bytes().to_vec(),
        };
        let packet = Packet::short_header(
            KeyPhase::OneRtt,
            Some(self.connection_id),
            packetnum::compress(pn, 4),
            vec![frame],
        );
        self.reliability.unwritten.clear();
        self.state = match self.role {
            Role::Client => ConnectionState::ClientClosed,
            _ => ConnectionState::ServerClosed,
        };
        let bytes = packet.encode();
        if let Some(peer) = self.peer_addr {
            if self.app_handles_send_recv {
                self.emit(Event::Transmit { to: peer, bytes });
            } else {
                let socket = Arc::clone(&self.socket);
                tokio::spawn(async move {
                    let _ = socket.send_to(&bytes, peer).await;
                });
            }
        }
        Ok(())
    }

    fn current_long_header_type(&self) -> LongHeaderType {
        match (self.role, self.state) {
            (Role::Client, ConnectionState::ClientStart) => LongHeaderType::ClientInitial,
            (Role::Client, ConnectionState::Client0Rtt) => LongHeaderType::ClientInitial,
            (Role::Client, ConnectionState::Client1Rtt) => LongHeaderType::ClientCleartext,
            (_, ConnectionState::Server0Rtt) | (_, ConnectionState::Server1Rtt) => {
                LongHeaderType::ServerCleartext
            }
            _ => LongHeaderType::ClientCleartext,
        }
    }

    fn full_packet_number(&self, header: &Header) -> u64 {
        match header {
            Header::Long(h) => h.packet_number as u64,
            Header::Short(h) => {
                let width = h.packet_number.len();
                let mut compressed = 0u64;
                for b in &h.packet_number {
                    compressed = (compressed << 8) | *b as u64;
                }
                packetnum::decompress(compressed, width, self.next_expected_recv_pn)
            }
        }
    }

    /// Drives the TLS collaborator once for stream 0, feeding it whatever
    /// handshake bytes have been reassembled and enqueueing whatever bytes
    /// it wants sent (section 4.E).
    fn tick_handshake(&mut self, now: Instant) -> QuicheResult<()> {
        if self.state.is_connected() || self.state.is_closed() {
            return Ok(());
        }

        let stream0 = self.streams.entry(0).or_insert_with(|| StreamPair::new(0));
        let (input_bytes, _) = stream0.in_.read(65536);
        let mut input = BufferedInput::new(input_bytes);

        match self.tls.drive(&mut input) {
            TlsOutcome::Pending { output } => {
                if !output.is_empty() {
                    let chunks = stream0.out.write(&output, false)?;
                    for chunk in chunks {
                        self.reliability.enqueue(chunk);
                    }
                }
                match self.state {
                    ConnectionState::Uninitialized | ConnectionState::ClientStart => {
                        self.state = ConnectionState::Client0Rtt;
                    }
                    ConnectionState::Client0Rtt => self.state = ConnectionState::Client1Rtt,
                    ConnectionState::Server0Rtt => self.state = ConnectionState::Server1Rtt,
                    _ => {}
                }
            }
            TlsOutcome::Complete {
                ciphersuite,
                send_secret,
                recv_secret,
                output,
            } => {
                if !output.is_empty() {
                    let chunks = stream0.out.write(&output, false)?;
                    for chunk in chunks {
                        self.reliability.enqueue(chunk);
                    }
                }
                self.ciphersuite = Some(ciphersuite);
                self.send_secret = Some(send_secret);
                self.recv_secret = Some(recv_secret);
                self.state = match self.role {
                    Role::Client => ConnectionState::ClientConnected,
                    _ => ConnectionState::ServerConnected,
                };
                debug!(connection_id = self.connection_id, ?ciphersuite, "handshake complete");
                self.emit(Event::Connected);
            }
            TlsOutcome::Failed { reason } => {
                warn!(connection_id = self.connection_id, %reason, "handshake rejected by TLS engine");
                self.state = match self.role {
                    Role::Client => ConnectionState::ClientClosed,
                    _ => ConnectionState::ServerClosed,
                };
                self.reliability.unwritten.clear();
                self.emit(Event::Error { message: reason });
            }
        }
        let _ = now;
        Ok(())
    }

    /// Packs outstanding chunks and an ACK piggyback into one packet and
    /// transmits it (section 4.H step 3).
    async fn flush(&mut self, now: Instant) -> QuicheResult<()> {
        if self.reliability.unwritten.is_empty() && self.acks.is_empty() {
            return Ok(());
        }
        let Some(peer_addr) = self.peer_addr else {
            return Ok(());
        };

        let pn = self.next_send_pn;
        self.next_send_pn += 1;

        let header_len = if self.state.is_connected() { 1 + 8 + 4 } else { LongHeader::LEN };
        let mut budget = MTU.saturating_sub(header_len);
        let mut frames = Vec::new();
        let mut transmitted = Vec::new();

        while let Some(chunk) = self.reliability.unwritten.pop_front() {
            let frame = Frame::Stream(StreamFrame {
                stream_id: chunk.stream_id,
                offset: chunk.offset,
                fin: chunk.fin,
                data: chunk.data.clone(),
            });
            let encoded_len = frame.encode(true).len();
            if encoded_len > budget {
                self.reliability.unwritten.push_front(chunk);
                break;
            }
            budget -= encoded_len;
            frames.push(frame);
            transmitted.push(chunk);
        }

        if let Some(ack_frame) = self.acks.ack_piggyback(budget, pn, now) {
            frames.push(Frame::Ack(ack_frame));
        }

        if frames.is_empty() {
            self.next_send_pn -= 1;
            for chunk in transmitted {
                self.reliability.unwritten.push_front(chunk);
            }
            return Ok(());
        }

        for chunk in transmitted {
            self.reliability.mark_transmitted(chunk, pn, now);
        }

        let packet = if self.state.is_connected() {
            Packet::short_header(KeyPhase::OneRtt, Some(self.connection_id), packetnum::compress(pn, 4), frames)
        } else {
            Packet::long_header(
                self.current_long_header_type(),
                self.connection_id,
                pn as u32,
                self.version,
                frames,
            )
        };

        let is_first_client_initial =
            self.role == Role::Client && matches!(self.state, ConnectionState::ClientStart | ConnectionState::Client0Rtt) && pn == 0;
        let min_len = if is_first_client_initial { MIN_CLIENT_INITIAL } else { 0 };

        let bytes = packet.encode_padded(min_len);
        if self.app_handles_send_recv {
            self.emit(Event::Transmit { to: peer_addr, bytes });
        } else {
            self.socket.send_to(&bytes, peer_addr).await?;
        }
        Ok(())
    }

    fn handle_version_negotiation(&mut self, versions: Vec<u32>, now: Instant) {
        if versions.contains(&self.version) {
            return;
        }
        let Some(&next_version) = versions.first() else {
            warn!(connection_id = self.connection_id, "empty version negotiation list");
            return;
        };
        debug!(connection_id = self.connection_id, old = self.version, new = next_version, "switching version");
        self.version = next_version;
        self.next_send_pn = 0;
        self.next_expected_recv_pn = 0;
        self.state = ConnectionState::ClientStart;
        self.reliability = ReliabilityQueue::new();
        self.streams = HashMap::new();
        self.tls = Box::new(LoopbackTlsEngine::client());
        self.start_time = now;
    }

    async fn emit_version_negotiation(&mut self, client_cid: ConnectionId, to: SocketAddr) -> QuicheResult<()> {
        let header = LongHeader::new(LongHeaderType::VersionNegotiation, client_cid, 0, 0);
        let mut bytes = header.encode();
        for version in &self.supported_versions {
            bytes.extend_from_slice(&version.to_be_bytes());
        }
        if self.app_handles_send_recv {
            self.emit(Event::Transmit { to, bytes });
        } else {
            self.socket.send_to(&bytes, to).await?;
        }
        Ok(())
    }

    /// Processes one already-decoded packet (handshake/data path, section
    /// 4.F). Stream-0 bytes feed the TLS bridge on the next handshake
    /// tick; other frames update the stream table, ack scoreboard, and
    /// reliability queue directly.
    fn handle_packet(&mut self, packet: Packet, now: Instant) -> QuicheResult<()> {
        let full_pn = self.full_packet_number(&packet.header);
        let key_phase = match &packet.header {
            Header::Long(h) => h.packet_type.key_phase(),
            Header::Short(h) => h.key_phase,
        };
        let peer_connection_id = match &packet.header {
            Header::Long(h) => Some(h.connection_id),
            Header::Short(h) => h.connection_id,
        };
        // The client learns the server-chosen connection ID from the
        // server's first cleartext response and echoes it on every packet
        // from then on (section 3/glossary: "chosen by the server and
        // echoed by both peers"). A server never re-adopts an ID this way:
        // the parent's demux already routed this packet to the right child
        // by matching on the child's own ID.
        if self.role == Role::Client {
            if let Some(cid) = peer_connection_id {
                if cid != self.connection_id {
                    debug!(old = self.connection_id, new = cid, "adopting server connection id");
                    self.connection_id = cid;
                }
            }
        }
        self.last_received_pn_raw = Some(full_pn);
        self.last_recv_time = now;
        self.ping_deadline = None;
        self.acks.record(full_pn, key_phase, now);
        if full_pn + 1 > self.next_expected_recv_pn {
            self.next_expected_recv_pn = full_pn + 1;
        }

        for frame in packet.frames {
            match frame {
                Frame::Stream(sf) => {
                    let stream_id = sf.stream_id;
                    let stream = self
                        .streams
                        .entry(stream_id)
                        .or_insert_with(|| StreamPair::new(stream_id));
                    stream
                        .in_
                        .supply(StreamChunk::new(stream_id, sf.offset, sf.data, sf.fin))?;
                    // Stream 0 is the handshake bridge (section 4.E); the
                    // application never reads it, so only application
                    // streams surface a `NewStreamData` notification.
                    if stream_id != 0 {
                        self.emit(Event::NewStreamData { stream_id });
                    }
                }
                Frame::Ack(ack) => {
                    let acked = ack::acked_packet_numbers(&ack);
                    self.reliability.process_ack(&acked);
                    self.acks.process_peer_ack(&acked);
                }
                Frame::RstStream { stream_id, error_code, .. } => {
                    self.streams.remove(&stream_id);
                    self.emit(Event::StreamReset { stream_id, error_code });
                }
                Frame::Close { error_code, .. } => {
                    self.state = match self.role {
                        Role::Client => ConnectionState::ClientClosed,
                        _ => ConnectionState::ServerClosed,
                    };
                    self.emit(Event::CloseConnection { error_code });
                }
                other => {
                    trace!(connection_id = self.connection_id, ?other, "frame has no handler");
                }
            }
        }
        Ok(())
    }

    /// Entry point for any raw datagram already known to belong to this
    /// connection (section 4.A/4.F): peeks the header to special-case
    /// version negotiation and public-reset packets (section 9, resolved
    /// open question iii: decodable but unhandled), then decodes and
    /// processes the packet.
    fn dispatch_datagram(&mut self, mut bytes: Vec<u8>, now: Instant) -> QuicheResult<()> {
        let header = Header::decode(&mut bytes.clone())?;
        match &header {
            Header::Long(h) if h.packet_type == LongHeaderType::VersionNegotiation => {
                let mut remainder = bytes;
                let _ = LongHeader::decode(&mut remainder)?;
                let versions = remainder
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                self.handle_version_negotiation(versions, now);
                Ok(())
            }
            Header::Long(h) if h.packet_type == LongHeaderType::PublicReset => {
                trace!(connection_id = self.connection_id, "dropping public reset packet");
                Ok(())
            }
            _ => {
                let packet = Packet::decode(&mut bytes)?;
                self.handle_packet(packet, now)
            }
        }
    }

    fn evict_stale_recent_initials(&mut self, now: Instant) {
        self.recent_client_ids
            .retain(|_, (_, seen_at)| now.duration_since(*seen_at) < RECENT_INITIAL_TTL);
    }

    /// Server-parent demultiplexing of one incoming datagram by connection
    /// ID (section 4.G).
    async fn demux(&mut self, mut bytes: Vec<u8>, from: SocketAddr, now: Instant) -> QuicheResult<()> {
        let header = Header::decode(&mut bytes.clone())?;
        let long_header = match &header {
            Header::Long(h) => h.clone(),
            Header::Short(sh) => {
                let Some(cid) = sh.connection_id else {
                    trace!("dropping short-header packet with no connection id on parent");
                    return Ok(());
                };
                if let Some(child) = self.children.get_mut(&cid) {
                    child.dispatch_datagram(bytes, now)?;
                } else {
                    trace!(connection_id = cid, "dropping packet for unknown child");
                }
                return Ok(());
            }
        };

        if long_header.packet_type != LongHeaderType::ClientInitial {
            if let Some(child) = self.children.get_mut(&long_header.connection_id) {
                child.dispatch_datagram(bytes, now)?;
            } else {
                trace!(connection_id = long_header.connection_id, "dropping packet for unknown child");
            }
            return Ok(());
        }

        self.evict_stale_recent_initials(now);
        let client_cid = long_header.connection_id;

        if let Some(&(server_cid, _)) = self.recent_client_ids.get(&client_cid) {
            if let Some(child) = self.children.get_mut(&server_cid) {
                child.dispatch_datagram(bytes, now)?;
            }
            return Ok(());
        }

        if !self.supported_versions.contains(&long_header.version) {
            self.emit_version_negotiation(client_cid, from).await?;
            return Ok(());
        }

        let server_cid = random_connection_id();
        let mut child = Connection::new_server_child(
            server_cid,
            from,
            Arc::clone(&self.socket),
            long_header.version,
            self.app_handles_send_recv,
        );
        child.dispatch_datagram(bytes, now)?;
        self.recent_client_ids.insert(client_cid, (server_cid, now));
        self.children.insert(server_cid, child);
        debug!(server_connection_id = server_cid, client_connection_id = client_cid, "accepted new child connection");
        self.emit(Event::AcceptNewConnection { connection_id: server_cid });
        Ok(())
    }

    /// Drains up to 10 datagrams (the soft per-tick budget from section
    /// 4.H) from the parent's socket and routes each to its child. A no-op
    /// when `app_handles_send_recv` is set: the host hands datagrams in
    /// itself via [`Connection::supply_datagram_from`].
    async fn intake_as_parent(&mut self, now: Instant) -> QuicheResult<()> {
        if self.app_handles_send_recv {
            return Ok(());
        }
        let mut buf = vec![0u8; MTU];
        for _ in 0..10 {
            match self.socket.try_recv_from(&mut buf) {
                Ok((n, from)) => {
                    let datagram = buf[..n].to_vec();
                    if let Err(err) = self.demux(datagram, from, now).await {
                        warn!(%err, "dropping malformed datagram");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Drains up to 10 datagrams from a client's own socket. A no-op when
    /// `app_handles_send_recv` is set: the host hands datagrams in itself
    /// via [`Connection::supply_datagram`].
    async fn intake_as_client(&mut self, now: Instant) -> QuicheResult<()> {
        if self.app_handles_send_recv {
            return Ok(());
        }
        let mut buf = vec![0u8; MTU];
        for _ in 0..10 {
            match self.socket.try_recv(&mut buf) {
                Ok(n) => {
                    let datagram = buf[..n].to_vec();
                    if let Err(err) = self.dispatch_datagram(datagram, now) {
                        warn!(%err, "dropping malformed datagram");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Hands a datagram the host received to a client connection or an
    /// already-spawned server child (section 4.E, `appHandlesSendRecv` /
    /// the `RECV` event). Use [`Connection::supply_datagram_from`] on a
    /// server parent, which also needs the peer address to demultiplex and
    /// possibly spawn a new child.
    pub fn supply_datagram(&mut self, bytes: Vec<u8>, now: Instant) -> QuicheResult<()> {
        self.dispatch_datagram(bytes, now)
    }

    /// Hands a datagram the host received to a server parent for
    /// demultiplexing (section 4.E/4.G) when `app_handles_send_recv` is
    /// set, so the host is not required to own a real `UdpSocket` at all.
    pub async fn supply_datagram_from(&mut self, bytes: Vec<u8>, from: SocketAddr, now: Instant) -> QuicheResult<()> {
        self.demux(bytes, from, now).await
    }

    /// One full I/O-driver iteration for this connection (section 4.H):
    /// intake, timers, flush. Server parents recurse into every child;
    /// clients and already-spawned children drive themselves directly.
    pub async fn drive_tick(&mut self, now: Instant) -> QuicheResult<()> {
        match self.role {
            Role::ServerParent => {
                self.intake_as_parent(now).await?;
                self.evict_stale_recent_initials(now);
                for child in self.children.values_mut() {
                    child.drive_one_tick(now).await?;
                }
            }
            Role::Client => {
                self.intake_as_client(now).await?;
                self.drive_one_tick(now).await?;
            }
            Role::ServerChild => {
                self.drive_one_tick(now).await?;
            }
        }
        Ok(())
    }

    async fn drive_one_tick(&mut self, now: Instant) -> QuicheResult<()> {
        self.check_ping_deadline(now);
        self.tick_handshake(now)?;
        self.reliability.retransmit_tick(now);
        self.flush(now).await?;
        Ok(())
    }

    /// Arms a peer-liveness deadline `deadline_ms` from now (section 5/6,
    /// `check_peer`). Any datagram received before the driver observes the
    /// deadline cancels it; otherwise the connection is treated as
    /// unresponsive and closed with a general error.
    pub fn check_peer(&mut self, deadline_ms: u64) {
        self.ping_deadline = Some(Instant::now() + std::time::Duration::from_millis(deadline_ms));
    }

    fn check_ping_deadline(&mut self, now: Instant) {
        let Some(deadline) = self.ping_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        warn!(connection_id = self.connection_id, "peer did not respond before check_peer deadline");
        self.ping_deadline = None;
        self.state = match self.role {
            Role::Client => ConnectionState::ClientClosed,
            _ => ConnectionState::ServerClosed,
        };
        self.emit(Event::Error {
            message: "peer unresponsive".to_string(),
        });
    }

    /// The local socket address this connection (or, for a child, its
    /// parent) is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Swaps in a different bound socket (host-facing `set_socket`,
    /// section 6). The connection otherwise continues from its current
    /// state; callers own the decision to reuse one across reconnects.
    pub fn set_socket(&mut self, socket: Arc<UdpSocket>) {
        self.socket = socket;
    }

    /// The socket this connection currently sends/receives on.
    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    pub fn children(&self) -> &HashMap<ConnectionId, Connection> {
        &self.children
    }

    /// Looks up a server child by its connection ID, e.g. after the host
    /// receives `Event::AcceptNewConnection`.
    pub fn child(&self, connection_id: ConnectionId) -> Option<&Connection> {
        self.children.get(&connection_id)
    }

    /// Mutable counterpart of [`Connection::child`], for reading/writing
    /// streams on the accepted connection.
    pub fn child_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Connection> {
        self.children.get_mut(&connection_id)
    }

    pub fn uptime(&self) -> std::time::Duration {
        Instant::now().duration_since(self.start_time)
    }

    /// The packet number the next outgoing packet on this connection will
    /// use; strictly increases as packets are sent (section 3 invariant 1).
    pub fn next_transmit_packet_number(&self) -> u64 {
        self.next_send_pn
    }

    /// Time since the last datagram was accepted on this connection,
    /// usable by a host implementing its own peer-liveness policy on top
    /// of `check_peer`.
    pub fn idle_time(&self) -> std::time::Duration {
        Instant::now().duration_since(self.last_recv_time)
    }

    /// The raw (pre-decompression) wire value of the most recently
    /// decoded packet number, kept for diagnostics only (section 3).
    pub fn last_received_packet_number_raw(&self) -> Option<u64> {
        self.last_received_pn_raw
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn client_handshake_advances_state() {
        let config = Config::new("example", 4433);
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut client = Connection::new_client(local, peer, &config).await.unwrap();
        client.start_client();
        assert_eq!(client.state, ConnectionState::ClientStart);

        client.tick_handshake(Instant::now()).unwrap();
        assert!(!client.reliability.unwritten.is_empty());
    }

    #[tokio::test]
    async fn server_demux_creates_exactly_one_child_for_duplicate_initial() {
        let config = Config::new("example", 4433);
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut parent = Connection::new_server_parent(local, &config).await.unwrap();
        let from: SocketAddr = "127.0.0.1:2".parse().unwrap();

        let header = LongHeader::new(LongHeaderType::ClientInitial, 42, 0, config.preferred_version());
        let packet = Packet {
            header: Header::Long(header),
            frames: vec![],
        };
        let now = Instant::now();
        let datagram = packet.encode();

        parent.demux(datagram.clone(), from, now).await.unwrap();
        parent.demux(datagram, from, now).await.unwrap();

        assert_eq!(parent.children.len(), 1);
        assert_eq!(parent.recent_client_ids.len(), 1);
    }

    #[tokio::test]
    async fn unsupported_version_does_not_spawn_a_child() {
        let config = Config::new("example", 4433);
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut parent = Connection::new_server_parent(local, &config).await.unwrap();
        let from: SocketAddr = "127.0.0.1:3".parse().unwrap();

        let header = LongHeader::new(LongHeaderType::ClientInitial, 7, 0, 0xdead_beef);
        let packet = Packet {
            header: Header::Long(header),
            frames: vec![],
        };
        parent.demux(packet.encode(), from, Instant::now()).await.unwrap();

        assert!(parent.children.is_empty());
    }

    #[tokio::test]
    async fn stream_frame_emits_new_stream_data_for_application_streams_only() {
        let config = Config::new("example", 4433);
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut client = Connection::new_client(local, peer, &config).await.unwrap();

        let packet = Packet {
            header: Header::Short(crate::packet::header::ShortHeader {
                key_phase: KeyPhase::OneRtt,
                connection_id: None,
                packet_number: vec![0],
            }),
            frames: vec![Frame::Stream(StreamFrame {
                stream_id: 3,
                offset: 0,
                fin: false,
                data: b"hi".to_vec(),
            })],
        };
        client.handle_packet(packet, Instant::now()).unwrap();

        let events = client.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::NewStreamData { stream_id: 3 })));

        let handshake_packet = Packet {
            header: Header::Short(crate::packet::header::ShortHeader {
                key_phase: KeyPhase::OneRtt,
                connection_id: None,
                packet_number: vec![1],
            }),
            frames: vec![Frame::Stream(StreamFrame {
                stream_id: 0,
                offset: 0,
                fin: false,
                data: b"handshake bytes".to_vec(),
            })],
        };
        client.handle_packet(handshake_packet, Instant::now()).unwrap();
        assert!(client
            .drain_events()
            .iter()
            .all(|e| !matches!(e, Event::NewStreamData { .. })));
    }

    #[tokio::test]
    async fn rst_stream_frame_removes_the_stream_and_emits_stream_reset() {
        let config = Config::new("example", 4433);
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut client = Connection::new_client(local, peer, &config).await.unwrap();
        client.write(3, b"partial", false).unwrap();
        assert!(client.streams.contains_key(&3));

        let packet = Packet {
            header: Header::Short(crate::packet::header::ShortHeader {
                key_phase: KeyPhase::OneRtt,
                connection_id: None,
                packet_number: vec![0],
            }),
            frames: vec![Frame::RstStream {
                stream_id: 3,
                error_code: 42,
                final_offset: 7,
            }],
        };
        client.handle_packet(packet, Instant::now()).unwrap();

        assert!(!client.streams.contains_key(&3));
        let events = client.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::StreamReset { stream_id: 3, error_code: 42 })));
    }

    #[test]
    fn grease_version_negotiation_changes_the_advertised_version() {
        let mut config = Config::new("example", 4433);
        config.grease_version_negotiation = true;
        let greased = config.initial_version();
        assert_eq!(greased & 0x0f0f0f0f, 0x0a0a0a0a);
    }

    use crate::connection::tls::TlsInput;

    struct AlwaysFailsEngine;

    impl TlsEngine for AlwaysFailsEngine {
        fn drive(&mut self, _input: &mut dyn TlsInput) -> TlsOutcome {
            TlsOutcome::Failed {
                reason: "bad alpn".to_string(),
            }
        }
    }

    #[tokio::test]
    async fn a_rejected_handshake_closes_the_connection_and_emits_an_error() {
        let config = Config::new("example", 4433);
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut client = Connection::new_client(local, peer, &config).await.unwrap();
        client.start_client();
        client.tls = Box::new(AlwaysFailsEngine);

        client.tick_handshake(Instant::now()).unwrap();

        assert_eq!(client.state, ConnectionState::ClientClosed);
        assert!(client
            .drain_events()
            .iter()
            .any(|e| matches!(e, Event::Error { .. })));
    }
}
