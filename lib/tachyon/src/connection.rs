//! The per-connection protocol engine: handshake, crypto session setup, the
//! encrypted data path and teardown. One `Connection` is owned by the
//! service state and driven entirely under the global lock.

use crate::ice::{IceEvent, IceSession, IceSessionState};
use crate::proto;
use crate::rendezvous::{RendezvousDelivery, RendezvousSession, SignalTransport};
use crate::shared::{
    reason, ConnectionId, ErrorType, NetworkError, NetworkResult, VirtualPort,
    MAX_UDP_PAYLOAD, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use crate::snp::{Frame, ReceivedMessage, SnpReceiver, SnpSender};
use crate::socket::{SocketTable, SocketToken};
use crate::stats::{
    expand_ack_runs, AckQueue, LifetimeStats, PingTracker, SentPacket, SentPacketMap,
    STATS_INTERVAL_USEC,
};
use crate::wire;
use flare::cert::{
    self, CertInfo, CertSigned, CryptInfo, CryptInfoSigned, UnsignedPolicy, NONCE_SEED_SIZE,
};
use flare::config::{opt, ConfigView};
use flare::crypto;
use flare::identity::Identity;
use flare::keys::{Ed25519KeyPair, X25519KeyPair};
use flare::logging;
use mio::Registry;
use prost::Message;
use std::net::SocketAddr;
use std::sync::Arc;

/// Handshake retry schedule: 250ms * 2^n, capped, bounded attempts.
const HANDSHAKE_RETRY_BASE_USEC: u64 = 250_000;
const HANDSHAKE_RETRY_CAP_USEC: u64 = 3_000_000;
const HANDSHAKE_MAX_ATTEMPTS: u32 = 8;

/// ConnectionClosed is repeated this many times while waiting for any ack.
const CLOSE_MAX_ATTEMPTS: u32 = 4;

/// Terminal states linger this long before the record is reaped.
const FIN_WAIT_USEC: u64 = 2_000_000;
const TERMINAL_GRACE_USEC: u64 = 5_000_000;

/// A challenge echoed more than this many seconds after issue is stale.
const CHALLENGE_LIFETIME_SECS: u64 = 4;

/// Consecutive unanswered ping probes before the peer is declared gone.
const MAX_PING_TIMEOUTS: u32 = 4;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    None,
    Connecting,
    FindingRoute,
    Connected,
    Linger,
    ClosedByPeer,
    ProblemDetectedLocally,
    FinWait,
    Dead,
}

impl ConnectionState {
    /// Monotonic rank; transitions never decrease it (a connection cannot
    /// return to Connecting once Connected, and so on).
    fn rank(self) -> u8 {
        match self {
            ConnectionState::None => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::FindingRoute => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Linger => 4,
            ConnectionState::ClosedByPeer => 5,
            ConnectionState::ProblemDetectedLocally => 5,
            ConnectionState::FinWait => 6,
            ConnectionState::Dead => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnRole {
    Client,
    Server,
}

/// Fired through the application callback on every state transition.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub connection_id: ConnectionId,
    pub old_state: ConnectionState,
    pub new_state: ConnectionState,
    pub reason_code: u32,
    pub debug: String,
}

/// The local peer's long-lived identity material, shared by every
/// connection.
pub struct LocalIdentity {
    pub identity: Identity,
    pub keypair: Ed25519KeyPair,
    pub cert: CertSigned,
}

/// Mutable service facilities a connection needs while thinking.
pub struct NetEnv<'a> {
    pub sockets: &'a mut SocketTable,
    pub registry: Option<&'a Registry>,
}

/// The route a connection speaks over. Exactly one; the connection owns it.
pub enum Transport {
    /// Direct UDP to a known address over a service socket.
    Udp { socket: SocketToken, peer: SocketAddr },
    /// ICE-discovered route; the session owns its sockets.
    Ice(Box<IceSession>),
    /// In-process loopback to a sibling connection; datagrams land in
    /// `pipe_outbox` and the service moves them across.
    Pipe { peer: ConnectionId },
}

impl Transport {
    fn can_send(&self) -> bool {
        match self {
            Transport::Udp { .. } => true,
            Transport::Ice(session) => session.selected_route().is_some(),
            Transport::Pipe { .. } => true,
        }
    }

    fn describe(&self) -> String {
        match self {
            Transport::Udp { peer, .. } => format!("udp/{}", peer),
            Transport::Ice(session) => match session.selected_route() {
                Some((_, remote)) => format!("ice/{}", remote),
                None => "ice/unrouted".to_owned(),
            },
            Transport::Pipe { peer } => format!("pipe/#{}", peer),
        }
    }
}

/// Established AEAD session keys, one direction each.
struct CryptState {
    send_key: [u8; crypto::KEY_SIZE],
    recv_key: [u8; crypto::KEY_SIZE],
    send_nonce_seed: [u8; NONCE_SEED_SIZE],
    recv_nonce_seed: [u8; NONCE_SEED_SIZE],
}

impl Drop for CryptState {
    fn drop(&mut self) {
        crypto::memzero(&mut self.send_key);
        crypto::memzero(&mut self.recv_key);
    }
}

/// Key schedule: the X25519 agreement (already hashed) is expanded into one
/// key per direction, bound to both advertised nonce seeds.
fn derive_keys(
    shared: &[u8; 32],
    client_nonce: &[u8; NONCE_SEED_SIZE],
    server_nonce: &[u8; NONCE_SEED_SIZE],
    is_client: bool,
) -> CryptState {
    let mut context = Vec::with_capacity(3 + 2 * NONCE_SEED_SIZE);

    context.extend_from_slice(b"c2s");
    context.extend_from_slice(client_nonce);
    context.extend_from_slice(server_nonce);
    let c2s = crypto::hmac_sha256(shared, &context);

    context.clear();
    context.extend_from_slice(b"s2c");
    context.extend_from_slice(client_nonce);
    context.extend_from_slice(server_nonce);
    let s2c = crypto::hmac_sha256(shared, &context);

    match is_client {
        true => CryptState {
            send_key: c2s,
            recv_key: s2c,
            send_nonce_seed: *client_nonce,
            recv_nonce_seed: *server_nonce,
        },
        false => CryptState {
            send_key: s2c,
            recv_key: c2s,
            send_nonce_seed: *server_nonce,
            recv_nonce_seed: *client_nonce,
        },
    }
}

/// Stateless challenge MAC. The secret lives on the listen socket; nothing
/// is stored per half-open peer.
pub fn make_challenge(secret: &[u8; 32], time_secs: u64, peer: SocketAddr) -> u64 {
    let time16 = time_secs & 0xFFFF;

    let mut input = Vec::with_capacity(2 + 18);
    input.extend_from_slice(&(time16 as u16).to_le_bytes());
    match peer.ip() {
        ::std::net::IpAddr::V4(ip) => input.extend_from_slice(&ip.octets()),
        ::std::net::IpAddr::V6(ip) => input.extend_from_slice(&ip.octets()),
    }
    input.extend_from_slice(&peer.port().to_le_bytes());

    let mac = crypto::hmac_sha256(secret, &input);
    u64::from_le_bytes([mac[0], mac[1], mac[2], mac[3], mac[4], mac[5], mac[6], mac[7]])
        ^ time16
}

/// Accepts a challenge minted within the last few seconds for this peer.
pub fn check_challenge(
    secret: &[u8; 32],
    challenge: u64,
    now_secs: u64,
    peer: SocketAddr,
) -> bool {
    (0..=CHALLENGE_LIFETIME_SECS)
        .any(|age| make_challenge(secret, now_secs.saturating_sub(age), peer) == challenge)
}

enum HandshakePhase {
    /// Client, direct UDP: waiting for the challenge.
    Challenge,
    /// Client: ConnectRequest sent, waiting for ConnectOK.
    ConnectSent,
    /// Server: parked until the application accepts.
    AwaitingAccept,
    Done,
}

pub struct Connection {
    pub local_connection_id: ConnectionId,
    remote_connection_id: ConnectionId,
    local_virtual_port: VirtualPort,
    remote_virtual_port: VirtualPort,

    local: Arc<LocalIdentity>,
    remote_identity: Option<Identity>,

    role: ConnRole,
    state: ConnectionState,
    state_changed_usec: u64,

    transport: Transport,
    /// Outbound datagrams for `Transport::Pipe`, drained by the service.
    pub pipe_outbox: Vec<Vec<u8>>,

    // Handshake
    phase: HandshakePhase,
    local_ephemeral: Option<X25519KeyPair>,
    local_nonce_seed: [u8; NONCE_SEED_SIZE],
    challenge: u64,
    handshake_attempts: u32,
    handshake_next_usec: u64,
    started_usec: u64,
    remote_cert: Option<CertInfo>,
    /// Client crypt info held by the server between ConnectRequest and
    /// accept().
    peer_crypt: Option<CryptInfo>,
    peer_timestamp: u64,
    request_received_usec: u64,

    crypt: Option<CryptState>,

    // Data path
    next_send_seq: u64,
    highest_recv_seq: u64,
    recv_mask: u64,
    sender: SnpSender,
    receiver: SnpReceiver,
    ping: PingTracker,
    ack_queue: AckQueue,
    sent_packets: SentPacketMap,
    lifetime: LifetimeStats,
    last_recv_usec: u64,
    next_stats_usec: u64,
    rto_backoff: u32,

    // P2P
    rendezvous: Option<RendezvousSession>,
    pub signal: Option<Box<dyn SignalTransport>>,

    // Teardown
    end_reason: u32,
    end_debug: String,
    close_attempts: u32,
    close_next_usec: u64,
    linger_enabled: bool,

    // Config snapshot, refreshed by apply_config
    timeout_initial_usec: u64,
    timeout_connected_usec: u64,
    mtu: usize,

    pub user_data: i64,
    status_changes: Vec<StatusChange>,

    log: logging::Logger,
}

impl Connection {
    fn base(
        local: Arc<LocalIdentity>,
        role: ConnRole,
        transport: Transport,
        cfg: &ConfigView,
        now_usec: u64,
        log: &logging::Logger,
    ) -> Connection {
        let local_connection_id = crypto::random_u32_nonzero();

        let mut local_nonce_seed = [0u8; NONCE_SEED_SIZE];
        crypto::random_bytes(&mut local_nonce_seed);

        let log = log.new(logging::o!("conn_id" => local_connection_id));

        let mtu = cfg.int(opt::MTU_PACKET_SIZE) as usize;
        let sender = SnpSender::new(
            mtu,
            cfg.int(opt::SEND_BUFFER_SIZE) as usize,
            cfg.int(opt::NAGLE_TIME) as u64,
            cfg.int(opt::SEND_RATE_MIN) as u32,
            cfg.int(opt::SEND_RATE_MAX) as u32,
            log.new(logging::o!("dir" => "send")),
        );
        let receiver = SnpReceiver::new(log.new(logging::o!("dir" => "recv")));

        Connection {
            local_connection_id,
            remote_connection_id: 0,
            local_virtual_port: 0,
            remote_virtual_port: 0,
            local,
            remote_identity: None,
            role,
            state: ConnectionState::None,
            state_changed_usec: now_usec,
            transport,
            pipe_outbox: Vec::new(),
            phase: HandshakePhase::Done,
            local_ephemeral: None,
            local_nonce_seed,
            challenge: 0,
            handshake_attempts: 0,
            handshake_next_usec: 0,
            started_usec: now_usec,
            remote_cert: None,
            peer_crypt: None,
            peer_timestamp: 0,
            request_received_usec: 0,
            crypt: None,
            next_send_seq: 1,
            highest_recv_seq: 0,
            recv_mask: 0,
            sender,
            receiver,
            ping: PingTracker::new(),
            ack_queue: AckQueue::new(),
            sent_packets: SentPacketMap::new(),
            lifetime: LifetimeStats::new(),
            last_recv_usec: now_usec,
            next_stats_usec: now_usec + STATS_INTERVAL_USEC,
            rto_backoff: 0,
            rendezvous: None,
            signal: None,
            end_reason: reason::INVALID,
            end_debug: String::new(),
            close_attempts: 0,
            close_next_usec: 0,
            linger_enabled: true,
            timeout_initial_usec: cfg.int(opt::TIMEOUT_INITIAL) as u64 * 1000,
            timeout_connected_usec: cfg.int(opt::TIMEOUT_CONNECTED) as u64 * 1000,
            mtu,
            user_data: 0,
            status_changes: Vec::new(),
            log,
        }
    }

    /// Client side, direct UDP. The first challenge goes out on the next
    /// think.
    pub fn connect_ip(
        local: Arc<LocalIdentity>,
        socket: SocketToken,
        peer: SocketAddr,
        cfg: &ConfigView,
        now_usec: u64,
        log: &logging::Logger,
    ) -> Connection {
        let mut conn = Self::base(
            local,
            ConnRole::Client,
            Transport::Udp { socket, peer },
            cfg,
            now_usec,
            log,
        );

        conn.remote_identity = Some(Identity::Ip(peer));
        conn.phase = HandshakePhase::Challenge;
        conn.handshake_next_usec = now_usec;
        conn.set_state(ConnectionState::Connecting, now_usec);
        conn
    }

    /// Client side, P2P through signaling + ICE.
    pub fn connect_p2p(
        local: Arc<LocalIdentity>,
        remote_identity: Identity,
        remote_virtual_port: VirtualPort,
        local_virtual_port: VirtualPort,
        ice: IceSession,
        signal: Box<dyn SignalTransport>,
        cfg: &ConfigView,
        now_usec: u64,
        log: &logging::Logger,
    ) -> Connection {
        let mut conn = Self::base(
            local,
            ConnRole::Client,
            Transport::Ice(Box::new(ice)),
            cfg,
            now_usec,
            log,
        );

        conn.local_virtual_port = local_virtual_port;
        conn.remote_virtual_port = remote_virtual_port;
        conn.remote_identity = Some(remote_identity.clone());

        let mut rendezvous = RendezvousSession::new(
            conn.local.identity.to_string(),
            remote_identity.to_string(),
            conn.local_connection_id,
            &conn.log,
        );

        // The connect request rides the envelope; there is no UDP challenge
        // on the signaling path, the application authenticated it.
        conn.prepare_ephemeral();
        let request = conn.build_connect_request(0, now_usec);
        rendezvous.set_body(proto::RendezvousBody::ConnectRequest(request));

        conn.rendezvous = Some(rendezvous);
        conn.signal = Some(signal);
        conn.phase = HandshakePhase::ConnectSent;
        conn.set_state(ConnectionState::Connecting, now_usec);
        conn
    }

    /// Server side: a validated ConnectRequest arrived on a listen socket.
    /// The connection parks in Connecting until the application accepts.
    #[allow(clippy::too_many_arguments)]
    pub fn from_connect_request(
        local: Arc<LocalIdentity>,
        transport: Transport,
        request: &proto::ConnectRequest,
        remote_cert: CertInfo,
        peer_crypt: CryptInfo,
        cfg: &ConfigView,
        now_usec: u64,
        log: &logging::Logger,
    ) -> Connection {
        let mut conn = Self::base(local, ConnRole::Server, transport, cfg, now_usec, log);

        conn.remote_connection_id = request.client_connection_id;
        conn.remote_identity = Some(remote_cert.identity.clone());
        conn.local_virtual_port = request.to_virtual_port as VirtualPort;
        conn.remote_virtual_port = request.from_virtual_port as VirtualPort;
        conn.remote_cert = Some(remote_cert);
        conn.peer_crypt = Some(peer_crypt);
        conn.peer_timestamp = request.my_timestamp;
        conn.request_received_usec = now_usec;
        conn.phase = HandshakePhase::AwaitingAccept;
        conn.set_state(ConnectionState::Connecting, now_usec);
        conn
    }

    /// Builds the two halves of an in-process loopback pair, already
    /// Connected, sharing freshly derived keys.
    pub fn socket_pair(
        local: Arc<LocalIdentity>,
        cfg: &ConfigView,
        now_usec: u64,
        log: &logging::Logger,
    ) -> (Connection, Connection) {
        let mut a = Self::base(
            local.clone(),
            ConnRole::Client,
            Transport::Pipe { peer: 0 },
            cfg,
            now_usec,
            log,
        );
        let mut b = Self::base(
            local.clone(),
            ConnRole::Server,
            Transport::Pipe { peer: 0 },
            cfg,
            now_usec,
            log,
        );

        a.transport = Transport::Pipe {
            peer: b.local_connection_id,
        };
        b.transport = Transport::Pipe {
            peer: a.local_connection_id,
        };
        a.remote_connection_id = b.local_connection_id;
        b.remote_connection_id = a.local_connection_id;
        a.remote_identity = Some(local.identity.clone());
        b.remote_identity = Some(local.identity.clone());

        let eph_a = X25519KeyPair::generate();
        let eph_b = X25519KeyPair::generate();
        let shared = eph_a
            .shared_secret(&eph_b.public())
            .expect("Fresh keys cannot be low order");

        a.crypt = Some(derive_keys(
            &shared,
            &a.local_nonce_seed,
            &b.local_nonce_seed,
            true,
        ));
        b.crypt = Some(derive_keys(
            &shared,
            &a.local_nonce_seed,
            &b.local_nonce_seed,
            false,
        ));

        a.set_state(ConnectionState::Connecting, now_usec);
        a.set_state(ConnectionState::Connected, now_usec);
        b.set_state(ConnectionState::Connecting, now_usec);
        b.set_state(ConnectionState::Connected, now_usec);

        (a, b)
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn role(&self) -> ConnRole {
        self.role
    }

    #[inline]
    pub fn remote_identity(&self) -> Option<&Identity> {
        self.remote_identity.as_ref()
    }

    #[inline]
    pub fn remote_connection_id(&self) -> ConnectionId {
        self.remote_connection_id
    }

    #[inline]
    pub fn virtual_ports(&self) -> (VirtualPort, VirtualPort) {
        (self.local_virtual_port, self.remote_virtual_port)
    }

    #[inline]
    pub fn end_reason(&self) -> (u32, &str) {
        (self.end_reason, &self.end_debug)
    }

    /// Drains pending status transitions for callback dispatch, in order.
    pub fn drain_status_changes(&mut self) -> Vec<StatusChange> {
        ::std::mem::replace(&mut self.status_changes, Vec::new())
    }

    /// Human-readable multi-line dump for diagnostics.
    pub fn detailed_status(&self) -> String {
        let remote = self
            .remote_identity
            .as_ref()
            .map(|identity| identity.to_string())
            .unwrap_or_else(|| "?".to_owned());

        format!(
            "cli #{} {}@{}\n\
             state: {:?} ({:?})\n\
             virtual ports: {} -> {}\n\
             rtt: {} ms, send rate: {} B/s\n\
             queued: {} B, ready messages: {}\n\
             packets sent/recv: {}/{}, dropped: {}, out-of-order: {}\n",
            self.local_connection_id,
            remote,
            self.transport.describe(),
            self.state,
            self.role,
            self.local_virtual_port,
            self.remote_virtual_port,
            self.ping.smoothed_ms(),
            self.sender.rate.rate(),
            self.sender.buffered_bytes(),
            self.receiver.ready_count(),
            self.lifetime.packets_sent,
            self.lifetime.packets_recv,
            self.lifetime.packets_dropped,
            self.lifetime.packets_out_of_order,
        )
    }

    fn set_state(&mut self, new_state: ConnectionState, now_usec: u64) {
        if new_state == self.state {
            return;
        }

        // Backwards transitions are structurally impossible; treat any
        // attempt as a programming error
        if new_state.rank() < self.state.rank() {
            panic!(
                "Illegal state transition {:?} -> {:?}",
                self.state, new_state
            );
        }

        let old_state = self.state;
        self.state = new_state;
        self.state_changed_usec = now_usec;

        logging::debug!(self.log, "state transition";
                        "context" => "state",
                        "old" => ?old_state,
                        "new" => ?new_state,
                        "reason" => self.end_reason);

        self.status_changes.push(StatusChange {
            connection_id: self.local_connection_id,
            old_state,
            new_state,
            reason_code: self.end_reason,
            debug: self.end_debug.clone(),
        });
    }

    fn prepare_ephemeral(&mut self) {
        if self.local_ephemeral.is_none() {
            self.local_ephemeral = Some(X25519KeyPair::generate());
        }
    }

    fn signed_crypt_info(&self) -> CryptInfoSigned {
        let ephemeral = self
            .local_ephemeral
            .as_ref()
            .expect("Ephemeral key must exist before building crypt info");

        cert::sign_crypt_info(&ephemeral.public(), &self.local_nonce_seed, &self.local.keypair)
    }

    fn build_connect_request(&mut self, challenge: u64, now_usec: u64) -> proto::ConnectRequest {
        self.prepare_ephemeral();

        let steam_id = match &self.local.identity {
            Identity::SteamId(id) => *id,
            _ => 0,
        };

        proto::ConnectRequest {
            client_connection_id: self.local_connection_id,
            challenge,
            client_steam_id: steam_id,
            my_timestamp: now_usec,
            ping_est_ms: self.ping.smoothed_ms().max(0) as u32,
            cert: Some(self.local.cert.clone()),
            crypt: Some(self.signed_crypt_info()),
            protocol_version: PROTOCOL_VERSION,
            identity: self.local.identity.to_string(),
            to_virtual_port: self.remote_virtual_port as u32,
            from_virtual_port: self.local_virtual_port as u32,
        }
    }

    // ----- outbound plumbing -----

    fn send_datagram(&mut self, env: &mut NetEnv, chunks: &[&[u8]], now_usec: u64) {
        let result = match &self.transport {
            Transport::Udp { socket, peer } => match env.sockets.get(*socket) {
                Some(shared) => shared.bound().send_gather(*peer, chunks),
                None => Err(NetworkError::Fatal(ErrorType::Io(
                    ::std::io::ErrorKind::NotConnected,
                ))),
            },
            Transport::Ice(session) => session.send_data(env.sockets, chunks),
            Transport::Pipe { .. } => {
                let mut datagram = Vec::new();
                for chunk in chunks {
                    datagram.extend_from_slice(chunk);
                }
                self.pipe_outbox.push(datagram);
                Ok(0)
            }
        };

        match result {
            Ok(_) | Err(NetworkError::Wait) => (),
            Err(err) => {
                logging::warn!(self.log, "socket error on send";
                               "context" => "send",
                               "error" => ?err);
                self.problem_detected(reason::SOCKET_ERROR, "socket send failed", now_usec);
            }
        }
    }

    fn send_handshake<M: Message>(&mut self, env: &mut NetEnv, id: u8, msg: &M, now_usec: u64) {
        let framed = wire::write_handshake(id, msg);
        self.send_datagram(env, &[&framed], now_usec);
    }

    // ----- client handshake -----

    /// ChallengeReply from the server (client, direct UDP).
    pub fn on_challenge_reply(
        &mut self,
        env: &mut NetEnv,
        reply: &proto::ChallengeReply,
        now_usec: u64,
    ) {
        if self.state != ConnectionState::Connecting {
            return;
        }

        match self.phase {
            HandshakePhase::Challenge => (),
            // Duplicate replies while our ConnectRequest is in flight are
            // expected; the challenge is unchanged
            _ => return,
        }

        if reply.protocol_version < MIN_PROTOCOL_VERSION {
            self.problem_detected(
                reason::REMOTE_BAD_PROTOCOL_VERSION,
                "peer protocol too old",
                now_usec,
            );
            return;
        }

        self.challenge = reply.challenge;
        self.phase = HandshakePhase::ConnectSent;
        self.handshake_attempts = 0;
        self.handshake_next_usec = now_usec;

        logging::debug!(self.log, "challenge received";
                        "context" => "handshake");

        self.transmit_handshake(env, now_usec);
    }

    /// ConnectOK, from either the UDP path or the rendezvous envelope.
    pub fn on_connect_ok(&mut self, ok: &proto::ConnectOk, now_usec: u64) {
        if self.state != ConnectionState::Connecting || self.role != ConnRole::Client {
            return;
        }

        if ok.client_connection_id != self.local_connection_id {
            return;
        }

        let (cert_signed, crypt_signed) = match (&ok.cert, &ok.crypt) {
            (Some(cert), Some(crypt)) => (cert, crypt),
            _ => {
                self.problem_detected(reason::CERT_INVALID, "handshake missing cert", now_usec);
                return;
            }
        };

        let cert_info = match self.validate_peer_cert(cert_signed, now_usec) {
            Ok(info) => info,
            Err(code) => {
                self.problem_detected(code, "peer certificate rejected", now_usec);
                return;
            }
        };

        let crypt_info = match cert::verify_crypt_info(crypt_signed, &cert_info.public_key) {
            Ok(info) => info,
            Err(_) => {
                self.problem_detected(reason::KEY_MISMATCH, "crypt info signature", now_usec);
                return;
            }
        };

        let shared = match self
            .local_ephemeral
            .as_ref()
            .expect("Client has an ephemeral key after ConnectRequest")
            .shared_secret(&crypt_info.ephemeral_public)
        {
            Ok(shared) => shared,
            Err(_) => {
                self.problem_detected(reason::KEY_MISMATCH, "degenerate peer key", now_usec);
                return;
            }
        };

        self.crypt = Some(derive_keys(
            &shared,
            &self.local_nonce_seed,
            &crypt_info.nonce_seed,
            true,
        ));

        self.remote_connection_id = ok.server_connection_id;
        self.remote_cert = Some(cert_info);
        self.phase = HandshakePhase::Done;

        // RTT seed from the echoed timestamp, minus the server's own
        // accept-decision delay
        let elapsed = now_usec
            .saturating_sub(ok.your_timestamp)
            .saturating_sub(ok.delay_time_usec);
        if ok.your_timestamp != 0 && elapsed < 10_000_000 {
            self.ping.on_sample(elapsed);
            self.lifetime.on_ping_sample(elapsed);
        }

        logging::info!(self.log, "handshake complete";
                       "context" => "handshake",
                       "remote_conn_id" => self.remote_connection_id);

        match &self.transport {
            Transport::Ice(session) if session.selected_route().is_none() => {
                self.set_state(ConnectionState::FindingRoute, now_usec);
            }
            _ => self.set_state(ConnectionState::Connected, now_usec),
        }
    }

    fn validate_peer_cert(
        &self,
        signed: &CertSigned,
        now_usec: u64,
    ) -> Result<CertInfo, u32> {
        // Policy: certificates may be self-signed unless a trusted authority
        // list is configured (none is, in the core library; the issuance
        // service is an external collaborator).
        let info = cert::verify_cert(
            signed,
            &[],
            UnsignedPolicy::AllowSelfSigned,
            now_usec / 1_000_000,
        )
        .map_err(|err| match err {
            cert::CertError::Expired => reason::CERT_EXPIRED,
            cert::CertError::NotYetValid => reason::CERT_EXPIRED,
            cert::CertError::AuthorityUnknown => reason::CERT_AUTH_UNKNOWN,
            _ => reason::CERT_INVALID,
        })?;

        // Identity binding: a known expected identity must match the cert
        if let Some(expected) = &self.remote_identity {
            if !expected.is_anonymous() && *expected != info.identity {
                return Err(reason::CERT_INVALID);
            }
        }

        Ok(info)
    }

    // ----- server handshake -----

    /// The application accepted the parked connection: finish the key
    /// exchange and answer ConnectOK.
    pub fn accept(&mut self, env: &mut NetEnv, now_usec: u64) -> NetworkResult<()> {
        match self.phase {
            HandshakePhase::AwaitingAccept => (),
            _ => return Err(NetworkError::Fatal(ErrorType::MisuseOfApi)),
        }

        let peer_crypt = self
            .peer_crypt
            .clone()
            .expect("Parked connection holds the client crypt info");

        self.prepare_ephemeral();
        let shared = match self
            .local_ephemeral
            .as_ref()
            .expect("Just prepared")
            .shared_secret(&peer_crypt.ephemeral_public)
        {
            Ok(shared) => shared,
            Err(_) => {
                self.problem_detected(reason::KEY_MISMATCH, "degenerate peer key", now_usec);
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }
        };

        self.crypt = Some(derive_keys(
            &shared,
            &peer_crypt.nonce_seed,
            &self.local_nonce_seed,
            false,
        ));

        self.phase = HandshakePhase::Done;

        let ok = self.build_connect_ok(now_usec);

        match &mut self.transport {
            Transport::Ice(_) => {
                if let Some(rendezvous) = &mut self.rendezvous {
                    rendezvous.set_body(proto::RendezvousBody::ConnectOk(ok));
                }
                self.set_state(ConnectionState::FindingRoute, now_usec);
            }
            _ => {
                self.send_handshake(env, wire::ID_CONNECT_OK, &ok, now_usec);
                self.set_state(ConnectionState::Connected, now_usec);
            }
        }

        Ok(())
    }

    fn build_connect_ok(&mut self, now_usec: u64) -> proto::ConnectOk {
        let steam_id = match &self.local.identity {
            Identity::SteamId(id) => *id,
            _ => 0,
        };

        proto::ConnectOk {
            client_connection_id: self.remote_connection_id,
            server_connection_id: self.local_connection_id,
            server_steam_id: steam_id,
            cert: Some(self.local.cert.clone()),
            crypt: Some(self.signed_crypt_info()),
            your_timestamp: self.peer_timestamp,
            // Measured from the accept decision, not packet receipt; the
            // client subtracts this before seeding its RTT estimate
            delay_time_usec: now_usec.saturating_sub(self.request_received_usec),
            protocol_version: PROTOCOL_VERSION,
            identity: self.local.identity.to_string(),
        }
    }

    /// Attaches the rendezvous session created by the service for a
    /// server-side P2P connection.
    pub fn attach_rendezvous(
        &mut self,
        rendezvous: RendezvousSession,
        signal: Box<dyn SignalTransport>,
    ) {
        self.rendezvous = Some(rendezvous);
        self.signal = Some(signal);
    }

    /// Runs an inbound signaling blob through the rendezvous session,
    /// returning the fresh deliveries.
    pub fn rendezvous_on_signal(&mut self, blob: &[u8]) -> Option<Vec<RendezvousDelivery>> {
        self.rendezvous.as_mut().map(|rendezvous| rendezvous.on_signal(blob))
    }

    /// Symmetric simultaneous connect, losing side: this client attempt
    /// yields and becomes the acceptor of the peer's request, keeping the
    /// application's handle.
    pub fn adopt_symmetric_request(
        &mut self,
        request: &proto::ConnectRequest,
        remote_cert: CertInfo,
        peer_crypt: CryptInfo,
        now_usec: u64,
    ) {
        if self.state != ConnectionState::Connecting || self.role != ConnRole::Client {
            return;
        }

        logging::info!(self.log, "symmetric connect: yielding to peer request";
                       "context" => "handshake");

        self.role = ConnRole::Server;
        self.remote_connection_id = request.client_connection_id;
        self.remote_cert = Some(remote_cert);
        self.peer_crypt = Some(peer_crypt);
        self.peer_timestamp = request.my_timestamp;
        self.request_received_usec = now_usec;
        self.phase = HandshakePhase::AwaitingAccept;

        if let Transport::Ice(session) = &mut self.transport {
            session.set_role(crate::ice::IceRole::Controlled);
        }

        // Our own connect request stops repeating; accept() installs the
        // ConnectOK body
        if let Some(rendezvous) = &mut self.rendezvous {
            rendezvous.clear_body();
        }
    }

    /// Repeated ConnectRequest from the same client: the ConnectOK was lost.
    pub fn on_duplicate_connect_request(&mut self, env: &mut NetEnv, now_usec: u64) {
        match self.phase {
            HandshakePhase::Done if self.role == ConnRole::Server => {
                let ok = self.build_connect_ok(now_usec);
                self.send_handshake(env, wire::ID_CONNECT_OK, &ok, now_usec);
            }
            _ => (),
        }
    }

    // ----- teardown -----

    /// Application close. Idempotent. With linger, the reliable buffer gets
    /// a chance to drain first.
    pub fn close(&mut self, reason_code: u32, debug: &str, linger: bool, now_usec: u64) {
        match self.state {
            ConnectionState::ClosedByPeer => {
                // Peer already ended it; nothing left to negotiate
                self.set_state(ConnectionState::FinWait, now_usec);
                return;
            }
            ConnectionState::ProblemDetectedLocally
            | ConnectionState::FinWait
            | ConnectionState::Linger
            | ConnectionState::Dead => return,
            _ => (),
        }

        self.end_reason = reason_code;
        self.end_debug = debug.to_owned();

        if linger
            && self.linger_enabled
            && self.state == ConnectionState::Connected
            && !self.sender.is_drained()
        {
            self.set_state(ConnectionState::Linger, now_usec);
            return;
        }

        self.begin_closing(now_usec);
    }

    fn begin_closing(&mut self, now_usec: u64) {
        self.set_state(ConnectionState::ProblemDetectedLocally, now_usec);
        self.close_attempts = 0;
        self.close_next_usec = now_usec;
    }

    fn problem_detected(&mut self, reason_code: u32, debug: &str, now_usec: u64) {
        if self.state.rank() >= ConnectionState::ClosedByPeer.rank() {
            return;
        }

        logging::warn!(self.log, "problem detected locally";
                       "context" => "state",
                       "reason" => reason_code,
                       "debug" => debug.to_owned());

        self.end_reason = reason_code;
        self.end_debug = debug.to_owned();
        self.begin_closing(now_usec);
    }

    /// Inbound ConnectionClosed with our connection id as cookie.
    pub fn on_connection_closed(
        &mut self,
        env: &mut NetEnv,
        closed: &proto::ConnectionClosed,
        now_usec: u64,
    ) {
        // Ack so the peer stops repeating itself
        let ack = proto::NoConnection {
            to_connection_id: closed.from_connection_id,
            from_connection_id: self.local_connection_id,
        };
        self.send_handshake(env, wire::ID_NO_CONNECTION, &ack, now_usec);

        if self.state.rank() >= ConnectionState::ClosedByPeer.rank() {
            return;
        }

        self.end_reason = closed.reason_code;
        self.end_debug = closed.debug.clone();
        self.set_state(ConnectionState::ClosedByPeer, now_usec);

        logging::info!(self.log, "closed by peer";
                       "context" => "state",
                       "reason" => closed.reason_code,
                       "debug" => closed.debug.clone());
    }

    /// Inbound NoConnection naming us: the peer has no such connection.
    pub fn on_no_connection(&mut self, now_usec: u64) {
        match self.state {
            // The ack we were waiting for while closing
            ConnectionState::ProblemDetectedLocally => {
                self.set_state(ConnectionState::FinWait, now_usec);
            }
            ConnectionState::Connected | ConnectionState::Linger => {
                self.problem_detected(reason::REFUSED, "peer reports no connection", now_usec);
            }
            _ => (),
        }
    }

    // ----- rendezvous -----

    /// Feeds deliveries extracted from an inbound signaling envelope.
    pub fn on_rendezvous_deliveries(
        &mut self,
        env: &mut NetEnv,
        deliveries: Vec<RendezvousDelivery>,
        now_usec: u64,
    ) {
        for delivery in deliveries {
            match delivery {
                RendezvousDelivery::Candidate(text) => {
                    if let Transport::Ice(session) = &mut self.transport {
                        session.add_remote_candidate(&text);
                    }
                }
                RendezvousDelivery::Auth { ufrag, pwd } => {
                    if let Transport::Ice(session) = &mut self.transport {
                        session.set_remote_auth(&ufrag, &pwd);
                    }
                }
                RendezvousDelivery::Body(proto::RendezvousBody::ConnectOk(ok)) => {
                    // The peer answered; our connect request body can stop
                    if let Some(rendezvous) = &mut self.rendezvous {
                        rendezvous.clear_body();
                    }
                    self.on_connect_ok(&ok, now_usec);
                }
                RendezvousDelivery::Body(proto::RendezvousBody::ConnectionClosed(closed)) => {
                    self.on_connection_closed(env, &closed, now_usec);
                }
                RendezvousDelivery::Body(proto::RendezvousBody::ConnectRequest(_)) => {
                    // Handled at the service layer (it may create us); a
                    // repeat here means the peer missed our ConnectOK, which
                    // the rendezvous retransmission already covers
                }
            }
        }

        if let Some(rendezvous) = &mut self.rendezvous {
            if let Some(signal) = &mut self.signal {
                rendezvous.think(signal.as_mut(), now_usec);
            }
        }
    }

    // ----- data path -----

    /// Queues an application message. Only valid while data can flow.
    pub fn send_message(
        &mut self,
        payload: &[u8],
        channel: u16,
        flags: u32,
        now_usec: u64,
    ) -> NetworkResult<u64> {
        match self.state {
            ConnectionState::Connected => (),
            ConnectionState::Connecting | ConnectionState::FindingRoute => {
                // Queuing before the route exists is allowed; it flows on
                // Connected
            }
            _ => return Err(NetworkError::Fatal(ErrorType::NoMatchingConnection)),
        }

        self.sender.queue_message(payload, channel, flags, now_usec)
    }

    /// Hands out received messages, in delivery order.
    pub fn receive_messages(&mut self, max: usize) -> Vec<ReceivedMessage> {
        self.receiver.take_messages(max)
    }

    /// Current retransmission deadline: max(200ms, 2 * srtt), exponentially
    /// backed off while consecutive losses pile up.
    fn rto_usec(&self) -> u64 {
        let srtt = match self.ping.smoothed_ms() {
            ms if ms >= 0 => ms as u64 * 1000,
            _ => 250_000,
        };

        (srtt * 2).max(200_000) << self.rto_backoff.min(6)
    }

    /// An encrypted data packet arrived for this connection.
    pub fn on_data_packet(&mut self, datagram: &[u8], now_usec: u64) {
        match self.state {
            ConnectionState::FindingRoute
            | ConnectionState::Connected
            | ConnectionState::Linger => (),
            _ => {
                self.lifetime.packets_dropped += 1;
                return;
            }
        }

        let header = match wire::DataHeader::parse(datagram) {
            Ok(header) => header,
            Err(_) => {
                self.lifetime.packets_dropped += 1;
                return;
            }
        };

        if header.to_connection_id != self.local_connection_id {
            self.lifetime.packets_dropped += 1;
            return;
        }

        let crypt = match &self.crypt {
            Some(crypt) => crypt,
            // Data before keys: nothing we can do with it
            None => {
                self.lifetime.packets_dropped += 1;
                return;
            }
        };

        let full_seq = wire::reconstruct_sequence(self.highest_recv_seq, header.wire_seq);

        // Replay / duplicate shield
        if full_seq <= self.highest_recv_seq {
            let age = self.highest_recv_seq - full_seq;
            if full_seq == 0 || age >= 64 || self.recv_mask & (1u64 << age) != 0 {
                logging::trace!(self.log, "duplicate or replayed packet dropped";
                                "context" => "recv",
                                "seq" => full_seq);
                self.lifetime.packets_dropped += 1;
                return;
            }
        }

        // Locate the ciphertext: header, then optional stats blob
        let mut cipher_start = wire::DATA_HEADER_SIZE;
        let stats = match header.flags & wire::DATA_FLAG_STATS {
            0 => None,
            _ => match wire::read_blob(&datagram[cipher_start..]) {
                Ok((blob, used)) => {
                    let stats = proto::Stats::decode(blob).ok();
                    cipher_start += used;
                    stats
                }
                Err(_) => {
                    self.lifetime.packets_dropped += 1;
                    return;
                }
            },
        };

        if datagram.len() < cipher_start + crypto::TAG_SIZE {
            self.lifetime.packets_dropped += 1;
            return;
        }

        let nonce = wire::build_nonce(&crypt.recv_nonce_seed, full_seq);

        let mut aad = Vec::with_capacity(crypto::NONCE_SIZE + cipher_start);
        aad.extend_from_slice(&nonce);
        aad.extend_from_slice(&datagram[..cipher_start]);

        let cipher = &datagram[cipher_start..];
        let mut plain = vec![0u8; cipher.len() - crypto::TAG_SIZE];

        if !crypto::aes_gcm_decrypt(&mut plain, cipher, &aad, &nonce, &crypt.recv_key) {
            // Never surfaced as data; dropped with a note
            logging::debug!(self.log, "AEAD verification failed, packet dropped";
                            "context" => "recv",
                            "seq" => full_seq);
            self.lifetime.packets_dropped += 1;
            return;
        }

        // Only now does the packet count as received
        if full_seq > self.highest_recv_seq {
            let shift = full_seq - self.highest_recv_seq;
            self.recv_mask = match shift >= 64 {
                true => 0,
                false => self.recv_mask << shift,
            };
            self.recv_mask |= 1;
            self.highest_recv_seq = full_seq;
        } else {
            let age = self.highest_recv_seq - full_seq;
            self.recv_mask |= 1u64 << age;
            self.lifetime.packets_out_of_order += 1;
        }

        self.lifetime.packets_recv += 1;
        self.lifetime.bytes_recv += datagram.len() as u64;
        self.last_recv_usec = now_usec;

        if let Some(stats) = stats {
            self.process_stats_blob(&stats, now_usec);
        }

        self.ack_queue.push(full_seq as u16, now_usec);

        if !plain.is_empty() {
            match Frame::parse_all(&plain) {
                Ok(frames) => {
                    for frame in frames {
                        self.receiver.on_frame(frame, now_usec);
                    }
                }
                Err(_) => {
                    logging::debug!(self.log, "undecodable frame batch dropped";
                                    "context" => "recv",
                                    "seq" => full_seq);
                }
            }
        }
    }

    fn process_stats_blob(&mut self, stats: &proto::Stats, now_usec: u64) {
        if stats.flags & proto::ACK_REQUEST_IMMEDIATE != 0 {
            self.ack_queue.request_immediate();
        }

        for wire_seq in expand_ack_runs(&stats.ack_e2e) {
            if let Some((_, packet)) = self.sent_packets.ack_wire(wire_seq) {
                if !packet.reliable_frames.is_empty() {
                    self.sender.on_frames_acked(&packet.reliable_frames);
                }

                if packet.ack_requested {
                    let rtt = now_usec.saturating_sub(packet.sent_usec);
                    self.ping.on_sample(rtt);
                    self.lifetime.on_ping_sample(rtt);
                }

                self.rto_backoff = 0;
            }
        }
    }

    /// Whether a data packet should go out right now.
    fn want_data_packet(&mut self, now_usec: u64) -> bool {
        if self.crypt.is_none() || !self.transport.can_send() {
            return false;
        }

        match self.state {
            ConnectionState::Connected | ConnectionState::Linger => (),
            _ => return false,
        }

        if self.ack_queue.flush_due(now_usec) || now_usec >= self.next_stats_usec {
            return true;
        }

        if self.ping.want_ping(now_usec) {
            return true;
        }

        self.sender.want_transmit(now_usec)
            && self
                .sender
                .rate
                .can_send(now_usec, self.mtu, self.mtu)
    }

    /// Builds, encrypts and sends one data packet.
    fn emit_data_packet(&mut self, env: &mut NetEnv, now_usec: u64) {
        let include_stats =
            self.ack_queue.flush_due(now_usec) || now_usec >= self.next_stats_usec;
        let want_ping = self.ping.want_ping(now_usec);

        // Budget the plaintext so the whole datagram stays within bounds
        let mut overhead = wire::DATA_HEADER_SIZE + crypto::TAG_SIZE;
        let stats_blob = match include_stats || want_ping {
            true => {
                let mut flags = 0u32;
                if want_ping {
                    flags |= proto::ACK_REQUEST_E2E | proto::ACK_REQUEST_IMMEDIATE;
                }

                let full_report = now_usec >= self.next_stats_usec;
                let stats = proto::Stats {
                    lifetime: match full_report {
                        true => Some(self.lifetime.to_proto()),
                        false => None,
                    },
                    instantaneous: match full_report {
                        true => Some(proto::StatsInstant {
                            ping_ms: self.ping.smoothed_ms().max(0) as u32,
                            send_rate_bytes_per_sec: self.sender.rate.rate(),
                            pending_reliable_bytes: self.sender.buffered_bytes() as u32,
                            recent_loss_permille: self.sender.rate.recent_loss_permille(),
                        }),
                        false => None,
                    },
                    flags,
                    ack_e2e: self.ack_queue.drain_runs(),
                    seq_num: self.next_send_seq as u32,
                };

                if full_report {
                    self.next_stats_usec = now_usec + STATS_INTERVAL_USEC;
                }

                let mut blob = Vec::new();
                wire::write_blob(&mut blob, &stats.encode_to_vec());
                overhead += blob.len();
                Some(blob)
            }
            false => None,
        };

        let max_plain = MAX_UDP_PAYLOAD - overhead;
        let (plain, reliable_frames) = match self
            .sender
            .rate
            .can_send(now_usec, self.mtu, self.mtu)
        {
            true => self
                .sender
                .build_packet(now_usec, max_plain)
                .unwrap_or((Vec::new(), Vec::new())),
            false => (Vec::new(), Vec::new()),
        };

        // Nothing worth a datagram
        if plain.is_empty() && stats_blob.is_none() {
            return;
        }

        let crypt = self.crypt.as_ref().expect("Checked by caller");

        let full_seq = self.next_send_seq;
        self.next_send_seq += 1;

        let mut flags = 0u8;
        if stats_blob.is_some() {
            flags |= wire::DATA_FLAG_STATS;
        }

        let header = wire::DataHeader {
            flags,
            to_connection_id: self.remote_connection_id,
            wire_seq: full_seq as u16,
        };

        let mut cleartext = vec![0u8; wire::DATA_HEADER_SIZE];
        header.write(&mut cleartext);
        if let Some(blob) = &stats_blob {
            cleartext.extend_from_slice(blob);
        }

        let nonce = wire::build_nonce(&crypt.send_nonce_seed, full_seq);

        let mut aad = Vec::with_capacity(crypto::NONCE_SIZE + cleartext.len());
        aad.extend_from_slice(&nonce);
        aad.extend_from_slice(&cleartext);

        let mut cipher = vec![0u8; plain.len() + crypto::TAG_SIZE];
        if !crypto::aes_gcm_encrypt(&mut cipher, &plain, &aad, &nonce, &crypt.send_key) {
            self.problem_detected(reason::AEAD_FAILURE, "encryption failure", now_usec);
            return;
        }

        let datagram_len = cleartext.len() + cipher.len();
        self.send_datagram(env, &[&cleartext, &cipher], now_usec);

        self.lifetime.packets_sent += 1;
        self.lifetime.bytes_sent += datagram_len as u64;
        self.sender.rate.on_packet_sent(now_usec, datagram_len);

        let ack_requested = want_ping;
        if ack_requested {
            self.ping.ping_sent(now_usec, self.rto_usec().max(1_000_000));
        }

        // Only packets we expect acknowledged are tracked
        if !reliable_frames.is_empty() || ack_requested {
            self.sent_packets.insert(
                full_seq,
                SentPacket {
                    sent_usec: now_usec,
                    bytes: datagram_len as u32,
                    reliable_frames,
                    ack_requested,
                },
            );
        }
    }

    // ----- think -----

    pub fn think(&mut self, env: &mut NetEnv, now_usec: u64) {
        match self.state {
            ConnectionState::Connecting => self.think_connecting(env, now_usec),
            ConnectionState::FindingRoute => self.think_finding_route(env, now_usec),
            ConnectionState::Connected => self.think_connected(env, now_usec),
            ConnectionState::Linger => self.think_linger(env, now_usec),
            ConnectionState::ProblemDetectedLocally => self.think_closing(env, now_usec),
            ConnectionState::ClosedByPeer => {
                if now_usec >= self.state_changed_usec + TERMINAL_GRACE_USEC {
                    self.set_state(ConnectionState::FinWait, now_usec);
                }
            }
            ConnectionState::FinWait => {
                if now_usec >= self.state_changed_usec + FIN_WAIT_USEC {
                    self.set_state(ConnectionState::Dead, now_usec);
                }
            }
            _ => (),
        }
    }

    fn think_connecting(&mut self, env: &mut NetEnv, now_usec: u64) {
        if now_usec >= self.started_usec + self.timeout_initial_usec {
            self.problem_detected(reason::TIMEOUT_INITIAL, "connect attempt timed out", now_usec);
            return;
        }

        self.drive_ice(env, now_usec);
        self.drive_rendezvous(now_usec);

        match self.phase {
            HandshakePhase::Challenge | HandshakePhase::ConnectSent => {
                // Rendezvous has its own retransmission; UDP handshakes use
                // the 250ms doubling schedule
                if self.rendezvous.is_none() && now_usec >= self.handshake_next_usec {
                    if self.handshake_attempts >= HANDSHAKE_MAX_ATTEMPTS {
                        self.problem_detected(
                            reason::TIMEOUT_INITIAL,
                            "handshake retries exhausted",
                            now_usec,
                        );
                        return;
                    }

                    self.transmit_handshake(env, now_usec);
                }
            }
            _ => (),
        }
    }

    fn transmit_handshake(&mut self, env: &mut NetEnv, now_usec: u64) {
        let attempt = self.handshake_attempts;
        self.handshake_attempts += 1;
        self.handshake_next_usec = now_usec
            + (HANDSHAKE_RETRY_BASE_USEC << attempt.min(16)).min(HANDSHAKE_RETRY_CAP_USEC);

        match self.phase {
            HandshakePhase::Challenge => {
                let request = proto::ChallengeRequest {
                    connection_id: self.local_connection_id,
                    my_timestamp: now_usec,
                    protocol_version: PROTOCOL_VERSION,
                };
                self.send_handshake(env, wire::ID_CHALLENGE_REQUEST, &request, now_usec);
            }
            HandshakePhase::ConnectSent => {
                let request = self.build_connect_request(self.challenge, now_usec);
                self.send_handshake(env, wire::ID_CONNECT_REQUEST, &request, now_usec);
            }
            _ => (),
        }
    }

    fn think_finding_route(&mut self, env: &mut NetEnv, now_usec: u64) {
        if now_usec >= self.started_usec + self.timeout_initial_usec {
            self.problem_detected(reason::TIMEOUT_INITIAL, "no route found in time", now_usec);
            return;
        }

        self.drive_ice(env, now_usec);
        self.drive_rendezvous(now_usec);

        let routed = self.transport.can_send();
        if routed && self.crypt.is_some() {
            self.last_recv_usec = now_usec;
            self.set_state(ConnectionState::Connected, now_usec);
        }
    }

    fn think_connected(&mut self, env: &mut NetEnv, now_usec: u64) {
        // Idle timeout: nothing received for the configured window
        if now_usec >= self.last_recv_usec + self.timeout_connected_usec {
            self.problem_detected(reason::TIMEOUT_INACTIVE, "connection timed out", now_usec);
            return;
        }

        if self.ping.check_timeout(now_usec) {
            self.rto_backoff = (self.rto_backoff + 1).min(6);

            if self.ping.consecutive_timeouts() >= MAX_PING_TIMEOUTS {
                self.problem_detected(
                    reason::TIMEOUT_INACTIVE,
                    "peer stopped acknowledging",
                    now_usec,
                );
                return;
            }
        }

        self.drive_ice(env, now_usec);
        self.drive_rendezvous(now_usec);
        self.detect_losses(now_usec);
        self.receiver.drop_stale(now_usec);

        self.sender.rate.tick(
            now_usec,
            match self.ping.smoothed_ms() {
                ms if ms >= 0 => Some(ms as u64 * 1000),
                _ => None,
            },
            self.ping.min_rtt_usec(),
        );

        let mut budget = 8;
        while budget > 0 && self.want_data_packet(now_usec) {
            self.emit_data_packet(env, now_usec);
            budget -= 1;

            if self.state != ConnectionState::Connected {
                return;
            }
        }
    }

    fn detect_losses(&mut self, now_usec: u64) {
        let deadline = now_usec.saturating_sub(self.rto_usec());
        let expired = self.sent_packets.take_expired(deadline);

        if expired.is_empty() {
            return;
        }

        self.rto_backoff = (self.rto_backoff + 1).min(6);

        for (seq, packet) in expired {
            logging::trace!(self.log, "packet presumed lost";
                            "context" => "loss",
                            "seq" => seq);

            if !packet.reliable_frames.is_empty() {
                self.sender.on_frames_lost(&packet.reliable_frames);
            }
        }
    }

    fn think_linger(&mut self, env: &mut NetEnv, now_usec: u64) {
        // Drain like a connected peer, minus new application sends
        if now_usec >= self.last_recv_usec + self.timeout_connected_usec {
            self.problem_detected(reason::TIMEOUT_INACTIVE, "linger drain timed out", now_usec);
            return;
        }

        self.detect_losses(now_usec);

        let mut budget = 8;
        while budget > 0 && self.want_data_packet(now_usec) {
            self.emit_data_packet(env, now_usec);
            budget -= 1;
        }

        if self.sender.is_drained() {
            self.begin_closing(now_usec);
        }
    }

    fn think_closing(&mut self, env: &mut NetEnv, now_usec: u64) {
        if now_usec < self.close_next_usec {
            return;
        }

        if self.close_attempts >= CLOSE_MAX_ATTEMPTS {
            self.set_state(ConnectionState::FinWait, now_usec);
            return;
        }

        // Peers that never learned our connection id cannot be notified
        let notify = self.remote_connection_id != 0;
        if notify {
            let closed = proto::ConnectionClosed {
                to_connection_id: self.remote_connection_id,
                from_connection_id: self.local_connection_id,
                reason_code: self.end_reason,
                debug: self.end_debug.clone(),
            };

            if let Some(rendezvous) = &mut self.rendezvous {
                rendezvous.set_body(proto::RendezvousBody::ConnectionClosed(closed.clone()));
            }
            self.send_handshake(env, wire::ID_CONNECTION_CLOSED, &closed, now_usec);
        }

        self.drive_rendezvous(now_usec);

        let attempt = self.close_attempts;
        self.close_attempts += 1;
        self.close_next_usec = now_usec
            + (HANDSHAKE_RETRY_BASE_USEC << attempt.min(16)).min(HANDSHAKE_RETRY_CAP_USEC);

        if !notify {
            self.set_state(ConnectionState::FinWait, now_usec);
        }
    }

    fn drive_ice(&mut self, env: &mut NetEnv, now_usec: u64) {
        let session = match &mut self.transport {
            Transport::Ice(session) => session,
            _ => return,
        };

        if session.state() == IceSessionState::Idle {
            drop(session.begin_gathering(env.sockets, env.registry, now_usec));

            // Credentials go out as the first reliable rendezvous messages
            let (ufrag, pwd) = session.local_auth();
            let (ufrag, pwd) = (ufrag.to_owned(), pwd.to_owned());
            if let Some(rendezvous) = &mut self.rendezvous {
                rendezvous.queue_auth(ufrag, pwd);
            }
        }

        let session = match &mut self.transport {
            Transport::Ice(session) => session,
            _ => return,
        };

        session.think(env.sockets, now_usec);

        let mut events = Vec::new();
        while let Some(event) = session.poll_event() {
            events.push(event);
        }

        for event in events {
            match event {
                IceEvent::LocalCandidate(text) => {
                    if let Some(rendezvous) = &mut self.rendezvous {
                        rendezvous.queue_candidate(text);
                    }
                }
                IceEvent::GatheringComplete => (),
                IceEvent::PairSelected { .. } => {
                    logging::info!(self.log, "ICE route established";
                                   "context" => "ice");
                    // think_finding_route notices can_send on its next pass
                }
                IceEvent::Failed => {
                    self.problem_detected(reason::ICE_FAILED, "all candidate pairs failed", now_usec);
                    return;
                }
            }
        }
    }

    fn drive_rendezvous(&mut self, now_usec: u64) {
        if let (Some(rendezvous), Some(signal)) = (&mut self.rendezvous, &mut self.signal) {
            rendezvous.think(signal.as_mut(), now_usec);
        }
    }

    /// STUN traffic on an ICE socket owned by this connection.
    pub fn on_ice_packet(
        &mut self,
        socket: SocketToken,
        source: SocketAddr,
        datagram: &[u8],
        env: &mut NetEnv,
        now_usec: u64,
    ) {
        if let Transport::Ice(session) = &mut self.transport {
            session.handle_stun(socket, source, datagram, env.sockets, now_usec);
        }
    }

    /// True when this connection's ICE session owns the socket.
    pub fn owns_ice_socket(&self, token: SocketToken) -> bool {
        match &self.transport {
            Transport::Ice(session) => session.owns_socket(token),
            _ => false,
        }
    }

    /// Direct-UDP transport route, for service dispatch registration.
    pub fn udp_route(&self) -> Option<(SocketToken, SocketAddr)> {
        match &self.transport {
            Transport::Udp { socket, peer } => Some((*socket, *peer)),
            _ => None,
        }
    }

    pub fn pipe_peer(&self) -> Option<ConnectionId> {
        match &self.transport {
            Transport::Pipe { peer } => Some(*peer),
            _ => None,
        }
    }

    /// Earliest deadline this connection needs a think at.
    pub fn next_think_usec(&self, now_usec: u64) -> u64 {
        let mut next = match self.state {
            ConnectionState::Connecting => {
                let deadline = self.started_usec + self.timeout_initial_usec;
                // P2P handshakes retransmit through the rendezvous session;
                // only the UDP path uses the doubling schedule here
                match self.rendezvous.is_some() {
                    true => deadline,
                    false => deadline.min(self.handshake_next_usec.max(1)),
                }
            }
            ConnectionState::FindingRoute => self.started_usec + self.timeout_initial_usec,
            ConnectionState::Connected | ConnectionState::Linger => {
                let mut soonest = self.last_recv_usec + self.timeout_connected_usec;

                if let Some(flush) = self.ack_queue.next_flush_usec() {
                    soonest = soonest.min(flush.max(1));
                }
                if let Some(event) = self.sender.next_event_usec() {
                    soonest = soonest.min(event.max(1));
                }
                if let Some(oldest) = self.sent_packets.oldest_sent_usec() {
                    soonest = soonest.min(oldest + self.rto_usec());
                }
                if self.sender.want_transmit(now_usec) {
                    // Pacing: wake when the token bucket has refilled
                    soonest = soonest.min(now_usec + self.sender.rate.usec_until_send(self.mtu));
                }
                soonest = soonest.min(self.ping.next_event_usec().max(1));
                soonest = soonest.min(self.next_stats_usec);

                soonest
            }
            ConnectionState::ProblemDetectedLocally => self.close_next_usec.max(1),
            ConnectionState::ClosedByPeer => self.state_changed_usec + TERMINAL_GRACE_USEC,
            ConnectionState::FinWait => self.state_changed_usec + FIN_WAIT_USEC,
            _ => u64::max_value(),
        };

        if let Transport::Ice(session) = &self.transport {
            if let Some(ice_next) = session.next_think_usec() {
                next = next.min(ice_next.max(1));
            }
        }

        if let Some(rendezvous) = &self.rendezvous {
            if let Some(send) = rendezvous.next_send_usec() {
                next = next.min(send.max(1));
            }
        }

        next
    }

    /// Releases transport resources. Called by the service before the record
    /// is dropped.
    pub fn free_resources(&mut self, env: &mut NetEnv) {
        if let Transport::Ice(session) = &mut self.transport {
            session.free_resources(env.sockets, env.registry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snp::sendflag;
    use flare::time::timestamp_secs;

    fn local(name: &str) -> Arc<LocalIdentity> {
        let identity = Identity::Str(name.to_owned());
        let keypair = Ed25519KeyPair::generate();
        let cert = cert::create_self_signed(&identity, &keypair, timestamp_secs(), 3600);

        Arc::new(LocalIdentity {
            identity,
            keypair,
            cert,
        })
    }

    fn pipe_pair() -> (Connection, Connection) {
        let cfg = ConfigView::new(None, None, None);
        Connection::socket_pair(local("pair"), &cfg, 1_000_000, &logging::discard())
    }

    /// Routes one captured pipe datagram into a connection the way the
    /// service would.
    fn route(conn: &mut Connection, env: &mut NetEnv, datagram: &[u8], now: u64) {
        if datagram[0] & wire::DATA_FRAME_BIT != 0 {
            conn.on_data_packet(datagram, now);
            return;
        }

        let (id, body) = wire::parse_handshake(datagram).expect("pipe frames are well formed");
        match id {
            wire::ID_CONNECTION_CLOSED => {
                let closed = proto::ConnectionClosed::decode(body).unwrap();
                conn.on_connection_closed(env, &closed, now);
            }
            wire::ID_NO_CONNECTION => conn.on_no_connection(now),
            _ => (),
        }
    }

    /// Advances the simulated clock, thinking both ends and ferrying pipe
    /// datagrams, optionally dropping a deterministic subset a->b.
    fn pump(
        a: &mut Connection,
        b: &mut Connection,
        start_usec: u64,
        duration_usec: u64,
        drop_every_a_to_b: usize,
    ) -> u64 {
        let mut table = SocketTable::new(None);
        let mut sent_a = 0usize;

        let step = 10_000;
        let mut now = start_usec;

        while now < start_usec + duration_usec {
            let mut env = NetEnv {
                sockets: &mut table,
                registry: None,
            };

            a.think(&mut env, now);
            b.think(&mut env, now);

            for datagram in ::std::mem::replace(&mut a.pipe_outbox, Vec::new()) {
                sent_a += 1;
                if drop_every_a_to_b != 0 && sent_a % drop_every_a_to_b == 0 {
                    continue;
                }
                route(b, &mut env, &datagram, now);
            }

            for datagram in ::std::mem::replace(&mut b.pipe_outbox, Vec::new()) {
                route(a, &mut env, &datagram, now);
            }

            now += step;
        }

        now
    }

    #[test]
    fn test_socket_pair_starts_connected() {
        let (mut a, mut b) = pipe_pair();

        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);

        let changes = a.drain_status_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].new_state, ConnectionState::Connecting);
        assert_eq!(changes[1].new_state, ConnectionState::Connected);
        assert!(b.drain_status_changes().len() == 2);
    }

    #[test]
    fn test_key_derivation_is_directional() {
        let shared = [7u8; 32];
        let client_nonce = [1u8; NONCE_SEED_SIZE];
        let server_nonce = [2u8; NONCE_SEED_SIZE];

        let client = derive_keys(&shared, &client_nonce, &server_nonce, true);
        let server = derive_keys(&shared, &client_nonce, &server_nonce, false);

        assert_eq!(client.send_key, server.recv_key);
        assert_eq!(client.recv_key, server.send_key);
        assert_ne!(client.send_key, client.recv_key);
        assert_eq!(client.send_nonce_seed, server.recv_nonce_seed);
    }

    #[test]
    fn test_reliable_transfer_in_order() {
        let (mut a, mut b) = pipe_pair();

        let mut expected_hash_input = Vec::new();
        for i in 0..100u32 {
            let payload = vec![(i % 251) as u8; 1000];
            expected_hash_input.extend_from_slice(&payload);
            a.send_message(&payload, 0, sendflag::RELIABLE | sendflag::NO_NAGLE, 1_000_000)
                .unwrap();
        }

        pump(&mut a, &mut b, 1_000_000, 20_000_000, 0);

        let messages = b.receive_messages(200);
        assert_eq!(messages.len(), 100);

        let mut received = Vec::new();
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message.message_id, (i + 1) as u64);
            received.extend_from_slice(&message.payload);
        }

        assert_eq!(crypto::sha256(&received), crypto::sha256(&expected_hash_input));
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_replay_is_not_redelivered() {
        let (mut a, mut b) = pipe_pair();
        let mut table = SocketTable::new(None);
        let mut env = NetEnv {
            sockets: &mut table,
            registry: None,
        };

        a.send_message(b"replay me", 0, sendflag::RELIABLE | sendflag::NO_NAGLE, 1_000_000)
            .unwrap();
        a.think(&mut env, 1_000_000);

        assert_eq!(a.pipe_outbox.len(), 1);
        let captured = a.pipe_outbox.remove(0);

        b.on_data_packet(&captured, 1_010_000);
        assert_eq!(b.receive_messages(4).len(), 1);

        let applied_seq = b.highest_recv_seq;
        let dropped_before = b.lifetime.packets_dropped;

        // Replay: the applied-sequence counter must not advance, nothing is
        // delivered twice
        b.on_data_packet(&captured, 1_020_000);
        assert_eq!(b.highest_recv_seq, applied_seq);
        assert_eq!(b.lifetime.packets_dropped, dropped_before + 1);
        assert!(b.receive_messages(4).is_empty());
    }

    #[test]
    fn test_tampered_packet_never_surfaces() {
        let (mut a, mut b) = pipe_pair();
        let mut table = SocketTable::new(None);
        let mut env = NetEnv {
            sockets: &mut table,
            registry: None,
        };

        a.send_message(b"integrity", 0, sendflag::RELIABLE | sendflag::NO_NAGLE, 1_000_000)
            .unwrap();
        a.think(&mut env, 1_000_000);
        let mut captured = a.pipe_outbox.remove(0);

        // Corrupt one ciphertext byte
        let last = captured.len() - 1;
        captured[last] ^= 0x01;

        b.on_data_packet(&captured, 1_010_000);
        assert!(b.receive_messages(4).is_empty());
        assert_eq!(b.lifetime.packets_recv, 0);
        assert_eq!(b.lifetime.packets_dropped, 1);
    }

    #[test]
    fn test_close_by_peer_carries_reason() {
        let (mut a, mut b) = pipe_pair();
        a.drain_status_changes();
        b.drain_status_changes();

        a.close(1042, "bye", false, 2_000_000);
        assert_eq!(a.state(), ConnectionState::ProblemDetectedLocally);
        assert_eq!(a.end_reason(), (1042, "bye"));

        pump(&mut a, &mut b, 2_000_000, 1_000_000, 0);

        assert_eq!(b.state(), ConnectionState::ClosedByPeer);
        let (code, debug) = b.end_reason();
        assert_eq!(code, 1042);
        assert_eq!(debug, "bye");

        let changes = b.drain_status_changes();
        assert!(changes
            .iter()
            .any(|c| c.new_state == ConnectionState::ClosedByPeer && c.reason_code == 1042));

        // The NoConnection ack moved the closer along to FinWait and beyond
        assert!(a.state().rank() >= ConnectionState::FinWait.rank());

        // Sends on a dead connection fail cleanly
        assert!(b
            .send_message(b"x", 0, sendflag::RELIABLE, 3_000_000)
            .is_err());
    }

    #[test]
    fn test_linger_drains_before_closing() {
        let (mut a, mut b) = pipe_pair();

        a.send_message(&vec![9u8; 5000], 0, sendflag::RELIABLE | sendflag::NO_NAGLE, 1_000_000)
            .unwrap();
        a.close(reason::APP_GENERIC, "done", true, 1_000_000);

        assert_eq!(a.state(), ConnectionState::Linger);

        pump(&mut a, &mut b, 1_000_000, 10_000_000, 0);

        // Everything reliable arrived before the goodbye
        let messages = b.receive_messages(4);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload.len(), 5000);
        assert_eq!(b.state(), ConnectionState::ClosedByPeer);
    }

    #[test]
    fn test_rate_adapts_under_loss_without_losing_data() {
        let (mut a, mut b) = pipe_pair();

        for i in 0..100u32 {
            a.send_message(
                &vec![(i % 256) as u8; 500],
                0,
                sendflag::RELIABLE | sendflag::NO_NAGLE,
                1_000_000,
            )
            .unwrap();
        }

        // 5% loss on the a->b direction
        pump(&mut a, &mut b, 1_000_000, 60_000_000, 20);

        let messages = b.receive_messages(200);
        assert_eq!(messages.len(), 100, "reliable data must survive loss");
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message.message_id, (i + 1) as u64);
        }

        // The governor reacted but stayed inside its bounds
        let rate = a.sender.rate.rate();
        assert!(rate >= 16_384);
        assert!(rate <= 131_072);
    }

    #[test]
    fn test_idle_timeout_detects_dead_peer() {
        let (mut a, _b) = pipe_pair();
        let mut table = SocketTable::new(None);
        let mut env = NetEnv {
            sockets: &mut table,
            registry: None,
        };

        // Peer never answers; the idle timeout fires
        a.think(&mut env, 1_000_000 + 10_000_000);
        assert_eq!(a.state(), ConnectionState::ProblemDetectedLocally);
        assert_eq!(a.end_reason().0, reason::TIMEOUT_INACTIVE);
    }

    #[test]
    fn test_fin_wait_reaches_dead() {
        let (mut a, mut b) = pipe_pair();

        a.close(1001, "", false, 2_000_000);
        pump(&mut a, &mut b, 2_000_000, 1_000_000, 0);
        assert!(a.state().rank() >= ConnectionState::FinWait.rank());

        pump(&mut a, &mut b, 3_000_000, FIN_WAIT_USEC + 1_000_000, 0);
        assert_eq!(a.state(), ConnectionState::Dead);
    }

    #[test]
    fn test_challenge_freshness_window() {
        let secret = [3u8; 32];
        let peer: SocketAddr = "198.51.100.1:27015".parse().unwrap();

        let now_secs = 100_000;
        let challenge = make_challenge(&secret, now_secs, peer);

        assert!(check_challenge(&secret, challenge, now_secs, peer));
        assert!(check_challenge(&secret, challenge, now_secs + CHALLENGE_LIFETIME_SECS, peer));

        // Ten seconds later the server refuses without any state change
        assert!(!check_challenge(&secret, challenge, now_secs + 10, peer));

        // A different peer address cannot reuse the challenge
        let other: SocketAddr = "198.51.100.2:27015".parse().unwrap();
        assert!(!check_challenge(&secret, challenge, now_secs, other));
    }

    #[test]
    fn test_zero_byte_send_rejected() {
        let (mut a, _b) = pipe_pair();
        assert!(a.send_message(&[], 0, sendflag::RELIABLE, 1_000_000).is_err());
    }

    #[test]
    fn test_detailed_status_mentions_the_essentials() {
        let (a, _b) = pipe_pair();
        let status = a.detailed_status();

        assert!(status.contains(&format!("cli #{}", a.local_connection_id)));
        assert!(status.contains("Connected"));
        assert!(status.contains("pipe/"));
    }
}
