//! The service runtime: one background thread owns the poll loop and drives
//! every timer; one process-wide lock serializes all state mutation. API
//! entry points may be called from any application thread.

use crate::connection::{
    check_challenge, make_challenge, ConnRole, Connection, ConnectionState, LocalIdentity, NetEnv,
    StatusChange, Transport,
};
use crate::ice::{self, candidate_mask, IceRole, IceSession};
use crate::proto;
use crate::rendezvous::{RendezvousSession, SignalTransport};
use crate::shared::{
    reason, ConnectionId, ErrorType, NetworkError, NetworkResult, VirtualPort,
    MIN_PROTOCOL_VERSION,
};
use crate::snp::ReceivedMessage;
use crate::socket::{SocketTable, SocketToken};
use crate::wire;
use flare::cert::{self, CryptInfo};
use flare::config::{opt, ConfigStore, ConfigValue, ConfigView};
use flare::crypto;
use flare::identity::Identity;
use flare::keys::Ed25519KeyPair;
use flare::logging;
use flare::time::timestamp_usecs;
use indexmap::IndexMap;
use mio::{Events, Poll, Registry, Token, Waker};
use prost::Message;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAKER_TOKEN: Token = Token(usize::max_value());

/// Upper bound on one poll sleep; timers never stall longer than this even
/// if a deadline computation goes stale.
const MAX_POLL_WAIT: Duration = Duration::from_millis(50);

/// Replies to unattributable packets are limited to one per this interval.
const SPEW_INTERVAL_USEC: u64 = 2_000_000;

/// Self-signed identity certs are minted with this lifetime.
const SELF_SIGNED_LIFETIME_SECS: u64 = 365 * 24 * 3600;

pub type StatusCallback = Box<dyn Fn(&StatusChange) + Send>;

struct Listener {
    socket: SocketToken,
    /// MAC secret for stateless challenges.
    secret: [u8; 32],
    local_addr: SocketAddr,
    config: ConfigStore,
}

pub type ListenerId = usize;

struct Global {
    log: logging::Logger,
    local: Arc<LocalIdentity>,
    registry: Registry,
    sockets: SocketTable,
    /// Insertion-ordered so callback dispatch and iteration stay stable.
    connections: IndexMap<ConnectionId, Connection>,
    listeners: Vec<Listener>,
    config: ConfigStore,
    callback: Option<StatusCallback>,
    spew_last_usec: u64,
}

impl Global {
    fn config_view(&self) -> ConfigView {
        ConfigView::new(None, None, Some(&self.config))
    }

    fn listener_view<'a>(&'a self, listener: Option<&'a Listener>) -> ConfigView<'a> {
        ConfigView::new(None, listener.map(|l| &l.config), Some(&self.config))
    }

    fn listener_for_socket(&self, token: SocketToken) -> Option<usize> {
        self.listeners.iter().position(|l| l.socket == token)
    }

    fn is_listener_socket(&self, token: SocketToken) -> bool {
        self.listener_for_socket(token).is_some()
    }

    /// Rate-limited NoConnection reply to a peer we cannot attribute.
    fn maybe_reply_no_connection(
        &mut self,
        token: SocketToken,
        target: SocketAddr,
        to_connection_id: ConnectionId,
        now_usec: u64,
    ) {
        if now_usec < self.spew_last_usec + SPEW_INTERVAL_USEC {
            return;
        }
        self.spew_last_usec = now_usec;

        let msg = proto::NoConnection {
            to_connection_id,
            from_connection_id: 0,
        };
        let framed = wire::write_handshake(wire::ID_NO_CONNECTION, &msg);

        if let Some(shared) = self.sockets.get(token) {
            logging::debug!(self.log, "replying NoConnection";
                           "context" => "route",
                           "target" => %target);
            drop(shared.bound().send_gather(target, &[&framed]));
        }
    }

    /// One full service frame: ingest, route, think, shuffle pipes, reap.
    fn frame(&mut self, now_usec: u64) -> Vec<StatusChange> {
        // Ingest from every socket
        let tokens: Vec<SocketToken> = self.sockets.tokens().collect();
        let mut inbound: Vec<(SocketToken, SocketAddr, Vec<u8>)> = Vec::new();

        for token in tokens {
            let result = match self.sockets.get(token) {
                Some(shared) => shared.bound().recv_batch(|source, data| {
                    inbound.push((token, source, data.to_vec()));
                }),
                None => continue,
            };

            if let Err(err) = result {
                logging::warn!(self.log, "socket receive error";
                               "context" => "frame",
                               "token" => token,
                               "error" => ?err);
                self.fail_connections_on_socket(token, now_usec);
            }
        }

        for (token, source, datagram) in inbound {
            self.route_datagram(token, source, &datagram, now_usec);
        }

        // Timers
        self.think_all(now_usec);

        // In-process pipes deliver until quiescent
        for _ in 0..16 {
            if !self.shuffle_pipes(now_usec) {
                break;
            }
            self.think_all(now_usec);
        }

        self.reap_dead(now_usec);

        // Status transitions, per connection in order
        let mut changes = Vec::new();
        for conn in self.connections.values_mut() {
            changes.append(&mut conn.drain_status_changes());
        }
        changes
    }

    fn think_all(&mut self, now_usec: u64) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();

        for id in ids {
            let registry = &self.registry;
            if let Some(conn) = self.connections.get_mut(&id) {
                // Thinks are cheap and internally deadline-guarded; running
                // them every frame keeps packet-triggered transitions prompt
                let mut env = NetEnv {
                    sockets: &mut self.sockets,
                    registry: Some(registry),
                };
                conn.think(&mut env, now_usec);
            }
        }
    }

    /// Moves loopback-pipe datagrams to their peers. Returns true if any
    /// moved.
    fn shuffle_pipes(&mut self, now_usec: u64) -> bool {
        let mut moves: Vec<(ConnectionId, Vec<Vec<u8>>)> = Vec::new();

        for conn in self.connections.values_mut() {
            if conn.pipe_outbox.is_empty() {
                continue;
            }

            if let Some(peer) = conn.pipe_peer() {
                moves.push((peer, ::std::mem::replace(&mut conn.pipe_outbox, Vec::new())));
            } else {
                conn.pipe_outbox.clear();
            }
        }

        let moved = !moves.is_empty();
        let registry = &self.registry;

        for (peer, datagrams) in moves {
            if let Some(conn) = self.connections.get_mut(&peer) {
                for datagram in datagrams {
                    if datagram.is_empty() {
                        continue;
                    }

                    if datagram[0] & wire::DATA_FRAME_BIT != 0 {
                        conn.on_data_packet(&datagram, now_usec);
                        continue;
                    }

                    // Pipes carry teardown control frames too
                    let (id, body) = match wire::parse_handshake(&datagram) {
                        Ok(parsed) => parsed,
                        Err(_) => continue,
                    };

                    let mut env = NetEnv {
                        sockets: &mut self.sockets,
                        registry: Some(registry),
                    };

                    match id {
                        wire::ID_CONNECTION_CLOSED => {
                            if let Ok(closed) = proto::ConnectionClosed::decode(body) {
                                conn.on_connection_closed(&mut env, &closed, now_usec);
                            }
                        }
                        wire::ID_NO_CONNECTION => {
                            if proto::NoConnection::decode(body).is_ok() {
                                conn.on_no_connection(now_usec);
                            }
                        }
                        _ => (),
                    }
                }
            }
        }

        moved
    }

    fn fail_connections_on_socket(&mut self, token: SocketToken, now_usec: u64) {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| {
                conn.udp_route().map(|(t, _)| t) == Some(token) || conn.owns_ice_socket(token)
            })
            .map(|(&id, _)| id)
            .collect();

        for id in ids {
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.close(reason::SOCKET_ERROR, "socket failure", false, now_usec);
            }
        }
    }

    fn reap_dead(&mut self, _now_usec: u64) {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.state() == ConnectionState::Dead)
            .map(|(&id, _)| id)
            .collect();

        for id in dead {
            if let Some(mut conn) = self.connections.remove(&id) {
                logging::debug!(self.log, "connection reaped";
                               "context" => "frame",
                               "conn_id" => id);

                let registry = &self.registry;
                let mut env = NetEnv {
                    sockets: &mut self.sockets,
                    registry: Some(registry),
                };
                conn.free_resources(&mut env);

                // A client-owned UDP socket dies with its connection;
                // listener sockets stay
                if let Some((token, peer)) = conn.udp_route() {
                    match self.is_listener_socket(token) {
                        true => {
                            if let Some(shared) = self.sockets.get_mut(token) {
                                shared.release(peer);
                            }
                        }
                        false => self.sockets.close(token, Some(&self.registry)),
                    }
                }
            }
        }
    }

    fn route_datagram(
        &mut self,
        token: SocketToken,
        source: SocketAddr,
        datagram: &[u8],
        now_usec: u64,
    ) {
        if datagram.is_empty() {
            return;
        }

        // Encrypted data frame: the leading bit separates it from every
        // handshake and STUN byte
        if datagram[0] & wire::DATA_FRAME_BIT != 0 {
            self.route_data_packet(token, source, datagram, now_usec);
            return;
        }

        // STUN traffic belongs to whichever ICE session owns the socket
        if ice::is_ice_packet(datagram) {
            let owner = self
                .connections
                .iter()
                .find(|(_, conn)| conn.owns_ice_socket(token))
                .map(|(&id, _)| id);

            if let Some(id) = owner {
                let registry = &self.registry;
                if let Some(conn) = self.connections.get_mut(&id) {
                    let mut env = NetEnv {
                        sockets: &mut self.sockets,
                        registry: Some(registry),
                    };
                    conn.on_ice_packet(token, source, datagram, &mut env, now_usec);
                }
            }
            return;
        }

        let (id, body) = match wire::parse_handshake(datagram) {
            Ok(parsed) => parsed,
            Err(_) => {
                logging::trace!(self.log, "malformed packet dropped";
                               "context" => "route",
                               "source" => %source);
                return;
            }
        };

        match id {
            wire::ID_CHALLENGE_REQUEST => self.on_challenge_request(token, source, body, now_usec),
            wire::ID_CHALLENGE_REPLY => {
                if let Ok(reply) = proto::ChallengeReply::decode(body) {
                    self.with_connection(reply.connection_id, now_usec, |conn, env, now| {
                        conn.on_challenge_reply(env, &reply, now)
                    });
                }
            }
            wire::ID_CONNECT_REQUEST => self.on_connect_request(token, source, body, now_usec),
            wire::ID_CONNECT_OK => {
                if let Ok(ok) = proto::ConnectOk::decode(body) {
                    self.with_connection(ok.client_connection_id, now_usec, |conn, _, now| {
                        conn.on_connect_ok(&ok, now)
                    });
                }
            }
            wire::ID_CONNECTION_CLOSED => {
                if let Ok(closed) = proto::ConnectionClosed::decode(body) {
                    let known = self.connections.contains_key(&closed.to_connection_id);
                    match known {
                        true => {
                            self.with_connection(
                                closed.to_connection_id,
                                now_usec,
                                |conn, env, now| conn.on_connection_closed(env, &closed, now),
                            );
                        }
                        false => self.maybe_reply_no_connection(
                            token,
                            source,
                            closed.from_connection_id,
                            now_usec,
                        ),
                    }
                }
            }
            wire::ID_NO_CONNECTION => {
                if let Ok(msg) = proto::NoConnection::decode(body) {
                    self.with_connection(msg.to_connection_id, now_usec, |conn, _, now| {
                        conn.on_no_connection(now)
                    });
                }
            }
            wire::ID_ICE_PING_CHECK => {
                // Reserved for wire-level route probing; current peers carry
                // route liveness over STUN instead
            }
            _ => {
                logging::trace!(self.log, "unknown message id dropped";
                               "context" => "route",
                               "id" => id);
            }
        }
    }

    fn route_data_packet(
        &mut self,
        token: SocketToken,
        source: SocketAddr,
        datagram: &[u8],
        now_usec: u64,
    ) {
        let header = match wire::DataHeader::parse(datagram) {
            Ok(header) => header,
            Err(_) => return,
        };

        let state = self
            .connections
            .get(&header.to_connection_id)
            .map(|conn| conn.state());

        match state {
            Some(ConnectionState::FinWait)
            | Some(ConnectionState::ProblemDetectedLocally)
            | Some(ConnectionState::ClosedByPeer)
            | Some(ConnectionState::Dead)
            | None => {
                // No live connection behind that cookie
                self.maybe_reply_no_connection(token, source, header.to_connection_id, now_usec);
            }
            Some(_) => {
                if let Some(conn) = self.connections.get_mut(&header.to_connection_id) {
                    conn.on_data_packet(datagram, now_usec);
                }
            }
        }
    }

    fn with_connection<F>(&mut self, id: ConnectionId, now_usec: u64, f: F)
    where
        F: FnOnce(&mut Connection, &mut NetEnv, u64),
    {
        let registry = &self.registry;
        if let Some(conn) = self.connections.get_mut(&id) {
            let mut env = NetEnv {
                sockets: &mut self.sockets,
                registry: Some(registry),
            };
            f(conn, &mut env, now_usec);
        }
    }

    /// Stateless challenge issue: nothing is allocated for the asker.
    fn on_challenge_request(
        &mut self,
        token: SocketToken,
        source: SocketAddr,
        body: &[u8],
        now_usec: u64,
    ) {
        let request = match proto::ChallengeRequest::decode(body) {
            Ok(request) => request,
            Err(_) => return,
        };

        let listener = match self.listener_for_socket(token) {
            Some(index) => &self.listeners[index],
            None => return,
        };

        if request.protocol_version < MIN_PROTOCOL_VERSION {
            logging::debug!(self.log, "challenge from peer with stale protocol";
                           "context" => "listen",
                           "version" => request.protocol_version);
            return;
        }

        let reply = proto::ChallengeReply {
            connection_id: request.connection_id,
            challenge: make_challenge(&listener.secret, now_usec / 1_000_000, source),
            your_timestamp: request.my_timestamp,
            protocol_version: crate::shared::PROTOCOL_VERSION,
        };

        let framed = wire::write_handshake(wire::ID_CHALLENGE_REPLY, &reply);
        if let Some(shared) = self.sockets.get(token) {
            drop(shared.bound().send_gather(source, &[&framed]));
        }
    }

    fn on_connect_request(
        &mut self,
        token: SocketToken,
        source: SocketAddr,
        body: &[u8],
        now_usec: u64,
    ) {
        let request = match proto::ConnectRequest::decode(body) {
            Ok(request) => request,
            Err(_) => return,
        };

        let listener_index = match self.listener_for_socket(token) {
            Some(index) => index,
            None => return,
        };

        // Same client retrying: the ConnectOK was lost, repeat it
        let existing = self.connections.values().find_map(|conn| {
            match conn.role() == ConnRole::Server
                && conn.remote_connection_id() == request.client_connection_id
                && conn.udp_route().map(|(_, peer)| peer) == Some(source)
            {
                true => Some(conn.local_connection_id),
                false => None,
            }
        });
        if let Some(id) = existing {
            self.with_connection(id, now_usec, |conn, env, now| {
                conn.on_duplicate_connect_request(env, now)
            });
            return;
        }

        let secret = self.listeners[listener_index].secret;
        if !check_challenge(&secret, request.challenge, now_usec / 1_000_000, source) {
            // Stale or forged challenge: drop without state change
            logging::debug!(self.log, "connect request with stale challenge dropped";
                           "context" => "listen",
                           "source" => %source);
            return;
        }

        if request.protocol_version < MIN_PROTOCOL_VERSION {
            return;
        }

        let (remote_cert, peer_crypt) = match validate_connect_security(&request, now_usec) {
            Ok(validated) => validated,
            Err(note) => {
                logging::debug!(self.log, "connect request rejected";
                               "context" => "listen",
                               "source" => %source,
                               "note" => note);
                return;
            }
        };

        let cfg = self.listener_view(self.listeners.get(listener_index));
        let conn = Connection::from_connect_request(
            self.local.clone(),
            Transport::Udp {
                socket: token,
                peer: source,
            },
            &request,
            remote_cert,
            peer_crypt,
            &cfg,
            now_usec,
            &self.log,
        );

        let id = conn.local_connection_id;
        logging::info!(self.log, "inbound connection parked for accept";
                       "context" => "listen",
                       "conn_id" => id,
                       "source" => %source);

        if let Some(shared) = self.sockets.get_mut(token) {
            shared.claim(source, id);
        }
        self.connections.insert(id, conn);
    }

    /// Inbound signaling envelope from the application.
    fn on_signal(
        &mut self,
        blob: &[u8],
        reply: Box<dyn SignalTransport>,
        now_usec: u64,
    ) -> NetworkResult<()> {
        let envelope = proto::P2pRendezvous::decode(blob)
            .map_err(|_| NetworkError::Fatal(ErrorType::Serialization))?;

        // Directed at an existing connection?
        if envelope.to_connection_id != 0
            && self.connections.contains_key(&envelope.to_connection_id)
        {
            let id = envelope.to_connection_id;
            return self.deliver_signal_to(id, blob, now_usec);
        }

        // Otherwise it may be addressed by identity (first contact)
        let from_identity: Identity = envelope
            .from_identity
            .parse()
            .map_err(|_| NetworkError::Fatal(ErrorType::Serialization))?;

        // An existing attempt toward that identity picks it up (covers
        // envelope retransmits and simultaneous connects)
        let existing = self
            .connections
            .iter()
            .find(|(_, conn)| {
                conn.remote_identity() == Some(&from_identity)
                    && (conn.remote_connection_id() == 0
                        || conn.remote_connection_id() == envelope.from_connection_id)
            })
            .map(|(&id, conn)| (id, conn.role()));

        if let Some((id, role)) = existing {
            // Simultaneous connect: both peers fired a ConnectRequest at
            // each other. With symmetric mode on, exactly one side yields,
            // decided by the identity ordering; the application handle
            // survives on both.
            if let Some(proto::RendezvousBody::ConnectRequest(request)) = &envelope.body {
                let symmetric = self.config_view().boolean(opt::SYMMETRIC_CONNECT);

                if symmetric && role == ConnRole::Client {
                    let local_rendered = self.local.identity.to_string();

                    if local_rendered <= envelope.from_identity {
                        // We keep the client role; the peer will yield and
                        // answer our request instead
                        return self.deliver_signal_to(id, blob, now_usec);
                    }

                    let (remote_cert, peer_crypt) =
                        validate_connect_security(request, now_usec)
                            .map_err(|_| NetworkError::Fatal(ErrorType::CertRejected))?;
                    let request = request.clone();

                    let registry = &self.registry;
                    if let Some(conn) = self.connections.get_mut(&id) {
                        let deliveries = conn.rendezvous_on_signal(blob).unwrap_or_default();
                        conn.adopt_symmetric_request(
                            &request,
                            remote_cert,
                            peer_crypt,
                            now_usec,
                        );

                        let mut env = NetEnv {
                            sockets: &mut self.sockets,
                            registry: Some(registry),
                        };
                        conn.on_rendezvous_deliveries(&mut env, deliveries, now_usec);
                        // The application already asked for this link;
                        // accept on its behalf
                        drop(conn.accept(&mut env, now_usec));
                    }
                    return Ok(());
                }
            }

            return self.deliver_signal_to(id, blob, now_usec);
        }

        // First contact must carry a connect request
        let request = match &envelope.body {
            Some(proto::RendezvousBody::ConnectRequest(request)) => request.clone(),
            _ => {
                logging::debug!(self.log, "unattributable signal dropped";
                               "context" => "signal");
                return Ok(());
            }
        };

        let (remote_cert, peer_crypt) = validate_connect_security(&request, now_usec)
            .map_err(|_| NetworkError::Fatal(ErrorType::CertRejected))?;

        let cfg = self.config_view();
        let stun_servers = parse_stun_servers(&cfg.string(opt::P2P_STUN_SERVER_LIST));

        let ice = IceSession::new(
            IceRole::Controlled,
            stun_servers,
            candidate_mask::ALL,
            Some(&self.log),
        );

        let mut conn = Connection::from_connect_request(
            self.local.clone(),
            Transport::Ice(Box::new(ice)),
            &request,
            remote_cert,
            peer_crypt,
            &cfg,
            now_usec,
            &self.log,
        );

        let mut rendezvous = RendezvousSession::new(
            self.local.identity.to_string(),
            envelope.from_identity.clone(),
            conn.local_connection_id,
            &self.log,
        );
        // Learn the peer's connection id and absorb its reliable messages
        let deliveries = rendezvous.on_signal(blob);
        conn.attach_rendezvous(rendezvous, reply);

        let id = conn.local_connection_id;
        self.connections.insert(id, conn);

        logging::info!(self.log, "inbound P2P connection parked for accept";
                       "context" => "signal",
                       "conn_id" => id);

        let registry = &self.registry;
        if let Some(conn) = self.connections.get_mut(&id) {
            let mut env = NetEnv {
                sockets: &mut self.sockets,
                registry: Some(registry),
            };
            conn.on_rendezvous_deliveries(&mut env, deliveries, now_usec);
        }

        Ok(())
    }

    fn deliver_signal_to(
        &mut self,
        id: ConnectionId,
        blob: &[u8],
        now_usec: u64,
    ) -> NetworkResult<()> {
        let registry = &self.registry;
        if let Some(conn) = self.connections.get_mut(&id) {
            // The rendezvous session decodes and dedupes; the connection
            // reacts to what is new
            let deliveries = match conn.rendezvous_on_signal(blob) {
                Some(deliveries) => deliveries,
                None => Vec::new(),
            };

            let mut env = NetEnv {
                sockets: &mut self.sockets,
                registry: Some(registry),
            };
            conn.on_rendezvous_deliveries(&mut env, deliveries, now_usec);
        }

        Ok(())
    }

    fn next_deadline_usec(&self, now_usec: u64) -> u64 {
        let mut deadline = now_usec + 1_000_000;

        for conn in self.connections.values() {
            deadline = deadline.min(conn.next_think_usec(now_usec));
        }

        deadline
    }
}

/// Security checks shared by the UDP and signaling connect paths: cert chain,
/// crypt-info signature, and the binding between them.
fn validate_connect_security(
    request: &proto::ConnectRequest,
    now_usec: u64,
) -> Result<(cert::CertInfo, CryptInfo), &'static str> {
    let cert_signed = request.cert.as_ref().ok_or("missing cert")?;
    let crypt_signed = request.crypt.as_ref().ok_or("missing crypt info")?;

    let cert_info = cert::verify_cert(
        cert_signed,
        &[],
        cert::UnsignedPolicy::AllowSelfSigned,
        now_usec / 1_000_000,
    )
    .map_err(|_| "cert rejected")?;

    // The claimed identity must be the certified one
    let claimed: Identity = request.identity.parse().map_err(|_| "bad identity")?;
    if claimed != cert_info.identity {
        return Err("identity does not match cert");
    }

    let crypt_info = cert::verify_crypt_info(crypt_signed, &cert_info.public_key)
        .map_err(|_| "crypt info signature")?;

    Ok((cert_info, crypt_info))
}

fn parse_stun_servers(csv: &str) -> Vec<SocketAddr> {
    csv.split(',')
        .filter_map(|entry| entry.trim().parse().ok())
        .collect()
}

struct ContextInner {
    state: Mutex<Global>,
    waker: Waker,
    running: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

/// Handle to an initialized networking context. Clones share the same
/// service; the last drop should be preceded by `shutdown`.
#[derive(Clone)]
pub struct NetContext {
    inner: Arc<ContextInner>,
}

impl NetContext {
    /// Initializes the library: generates (or adopts) the identity keypair,
    /// mints a self-signed cert, starts the service thread.
    pub fn init<'a, L: Into<Option<&'a logging::Logger>>>(
        identity: Identity,
        keypair: Ed25519KeyPair,
        log: L,
    ) -> NetworkResult<NetContext> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("identity" => identity.to_string())),
            None => logging::discard(),
        };

        let now_secs = timestamp_usecs() / 1_000_000;
        let cert = cert::create_self_signed(&identity, &keypair, now_secs, SELF_SIGNED_LIFETIME_SECS);

        let local = Arc::new(LocalIdentity {
            identity,
            keypair,
            cert,
        });

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let global = Global {
            log: log.clone(),
            local,
            registry,
            sockets: SocketTable::new(&log),
            connections: IndexMap::new(),
            listeners: Vec::new(),
            config: ConfigStore::new(),
            callback: None,
            spew_last_usec: 0,
        };

        let inner = Arc::new(ContextInner {
            state: Mutex::new(global),
            waker,
            running: AtomicBool::new(true),
            thread: Mutex::new(None),
        });

        let context = NetContext { inner };
        context.spawn_service(poll);

        Ok(context)
    }

    fn spawn_service(&self, mut poll: Poll) {
        let inner = self.inner.clone();

        let handle = thread::Builder::new()
            .name("tachyon-service".to_owned())
            .spawn(move || {
                let mut events = Events::with_capacity(256);

                while inner.running.load(Ordering::Acquire) {
                    let now_usec = timestamp_usecs();

                    let timeout = {
                        let state = inner.state.lock().expect("Global lock poisoned");
                        let deadline = state.next_deadline_usec(now_usec);
                        Duration::from_micros(deadline.saturating_sub(now_usec))
                            .min(MAX_POLL_WAIT)
                    };

                    drop(poll.poll(&mut events, Some(timeout)));

                    let mut state = inner.state.lock().expect("Global lock poisoned");
                    let now_usec = timestamp_usecs();
                    let changes = state.frame(now_usec);

                    // Callbacks run on the service thread with the lock
                    // held; applications must not re-enter from inside one
                    if let Some(callback) = &state.callback {
                        for change in &changes {
                            callback(change);
                        }
                    }
                }
            })
            .expect("Service thread spawn failed");

        *self.inner.thread.lock().expect("Thread slot poisoned") = Some(handle);
    }

    /// Stops the service thread and drops every connection without
    /// notification. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        drop(self.inner.waker.wake());

        if let Some(handle) = self
            .inner
            .thread
            .lock()
            .expect("Thread slot poisoned")
            .take()
        {
            drop(handle.join());
        }

        let mut state = self.inner.state.lock().expect("Global lock poisoned");
        state.connections.clear();
    }

    fn with_state<T, F: FnOnce(&mut Global, u64) -> T>(&self, f: F) -> T {
        let mut state = self.inner.state.lock().expect("Global lock poisoned");
        let now_usec = timestamp_usecs();
        let result = f(&mut state, now_usec);
        drop(state);
        drop(self.inner.waker.wake());
        result
    }

    /// Installs the status-changed callback (global scope).
    pub fn set_status_callback(&self, callback: StatusCallback) {
        self.with_state(|state, _| state.callback = Some(callback));
    }

    /// Sets a global-scope configuration value.
    pub fn set_config(&self, name: &str, value: ConfigValue) -> bool {
        self.with_state(|state, _| state.config.set(name, value))
    }

    /// Opens a listen socket bound to `addr`.
    pub fn create_listen_socket(&self, addr: SocketAddr) -> NetworkResult<ListenerId> {
        self.with_state(|state, _| {
            let token = state.sockets.open(addr, Some(&state.registry))?;
            let local_addr = state
                .sockets
                .get(token)
                .expect("Socket just opened")
                .bound()
                .local_addr();

            let mut secret = [0u8; 32];
            crypto::random_bytes(&mut secret);

            logging::info!(state.log, "listening";
                           "context" => "listen",
                           "addr" => %local_addr);

            state.listeners.push(Listener {
                socket: token,
                secret,
                local_addr,
                config: ConfigStore::new(),
            });

            Ok(state.listeners.len() - 1)
        })
    }

    /// Actual bound address of a listener (useful with port 0).
    pub fn listen_addr(&self, listener: ListenerId) -> Option<SocketAddr> {
        self.with_state(|state, _| state.listeners.get(listener).map(|l| l.local_addr))
    }

    /// Client connect to a directly addressable peer.
    pub fn connect_by_ip(&self, peer: SocketAddr) -> NetworkResult<ConnectionId> {
        self.with_state(|state, now_usec| {
            let bind_addr: SocketAddr = match peer.is_ipv4() {
                true => "0.0.0.0:0".parse().expect("Constant address"),
                false => "[::]:0".parse().expect("Constant address"),
            };

            let token = state.sockets.open(bind_addr, Some(&state.registry))?;

            let cfg = state.config_view();
            let conn = Connection::connect_ip(
                state.local.clone(),
                token,
                peer,
                &cfg,
                now_usec,
                &state.log,
            );

            let id = conn.local_connection_id;
            state.connections.insert(id, conn);

            logging::info!(state.log, "connecting";
                           "context" => "connect",
                           "conn_id" => id,
                           "peer" => %peer);

            Ok(id)
        })
    }

    /// Client connect to a peer identity through application signaling.
    pub fn connect_p2p(
        &self,
        remote_identity: Identity,
        remote_virtual_port: VirtualPort,
        signal: Box<dyn SignalTransport>,
    ) -> NetworkResult<ConnectionId> {
        self.with_state(|state, now_usec| {
            let cfg = state.config_view();
            let stun_servers = parse_stun_servers(&cfg.string(opt::P2P_STUN_SERVER_LIST));
            let local_virtual_port = cfg.int(opt::LOCAL_VIRTUAL_PORT) as VirtualPort;

            let ice = IceSession::new(
                IceRole::Controlling,
                stun_servers,
                candidate_mask::ALL,
                Some(&state.log),
            );

            let conn = Connection::connect_p2p(
                state.local.clone(),
                remote_identity,
                remote_virtual_port,
                local_virtual_port,
                ice,
                signal,
                &cfg,
                now_usec,
                &state.log,
            );

            let id = conn.local_connection_id;
            state.connections.insert(id, conn);
            Ok(id)
        })
    }

    /// Feeds an inbound signaling envelope. `reply` is kept only when the
    /// envelope opens a fresh inbound connection.
    pub fn received_signal(
        &self,
        blob: &[u8],
        reply: Box<dyn SignalTransport>,
    ) -> NetworkResult<()> {
        self.with_state(|state, now_usec| state.on_signal(blob, reply, now_usec))
    }

    /// Connections parked waiting for an application accept.
    pub fn pending_connections(&self) -> Vec<ConnectionId> {
        self.with_state(|state, _| {
            state
                .connections
                .values()
                .filter(|conn| {
                    conn.role() == ConnRole::Server
                        && conn.state() == ConnectionState::Connecting
                })
                .map(|conn| conn.local_connection_id)
                .collect()
        })
    }

    /// Accepts a parked inbound connection.
    pub fn accept(&self, id: ConnectionId) -> NetworkResult<()> {
        self.with_state(|state, now_usec| {
            let registry = &state.registry;
            match state.connections.get_mut(&id) {
                Some(conn) => {
                    let mut env = NetEnv {
                        sockets: &mut state.sockets,
                        registry: Some(registry),
                    };
                    conn.accept(&mut env, now_usec)
                }
                None => Err(NetworkError::Fatal(ErrorType::NoMatchingConnection)),
            }
        })
    }

    /// Application close; see the connection state machine for semantics.
    pub fn close(&self, id: ConnectionId, reason_code: u32, debug: &str, linger: bool) {
        self.with_state(|state, now_usec| {
            if let Some(conn) = state.connections.get_mut(&id) {
                conn.close(reason_code, debug, linger, now_usec);
            }
        })
    }

    /// Queues a message; `flags` per `snp::sendflag`.
    pub fn send_message(
        &self,
        id: ConnectionId,
        payload: &[u8],
        channel: u16,
        flags: u32,
    ) -> NetworkResult<u64> {
        self.with_state(|state, now_usec| match state.connections.get_mut(&id) {
            Some(conn) => conn.send_message(payload, channel, flags, now_usec),
            None => Err(NetworkError::Fatal(ErrorType::NoMatchingConnection)),
        })
    }

    /// Drains up to `max` delivered messages from a connection.
    pub fn receive_messages(&self, id: ConnectionId, max: usize) -> Vec<ReceivedMessage> {
        self.with_state(|state, _| match state.connections.get_mut(&id) {
            Some(conn) => conn.receive_messages(max),
            None => Vec::new(),
        })
    }

    /// Builds an already-connected in-process loopback pair.
    pub fn create_socket_pair(&self) -> (ConnectionId, ConnectionId) {
        self.with_state(|state, now_usec| {
            let cfg = state.config_view();
            let (a, b) = Connection::socket_pair(state.local.clone(), &cfg, now_usec, &state.log);

            let (id_a, id_b) = (a.local_connection_id, b.local_connection_id);
            state.connections.insert(id_a, a);
            state.connections.insert(id_b, b);
            (id_a, id_b)
        })
    }

    /// Current state plus terminal reason of a connection.
    pub fn connection_info(&self, id: ConnectionId) -> Option<(ConnectionState, u32, String)> {
        self.with_state(|state, _| {
            state.connections.get(&id).map(|conn| {
                let (code, debug) = conn.end_reason();
                (conn.state(), code, debug.to_owned())
            })
        })
    }

    /// Multi-line diagnostic dump of a connection.
    pub fn detailed_status(&self, id: ConnectionId) -> Option<String> {
        self.with_state(|state, _| state.connections.get(&id).map(Connection::detailed_status))
    }

    /// Opaque application slot on the connection.
    pub fn set_user_data(&self, id: ConnectionId, value: i64) {
        self.with_state(|state, _| {
            if let Some(conn) = state.connections.get_mut(&id) {
                conn.user_data = value;
            }
        })
    }

    pub fn user_data(&self, id: ConnectionId) -> Option<i64> {
        self.with_state(|state, _| state.connections.get(&id).map(|conn| conn.user_data))
    }
}
