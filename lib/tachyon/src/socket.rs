//! UDP socket plumbing. A `BoundSocket` owns one non-blocking OS socket; a
//! `SharedSocket` adds per-peer dispatch so several connections (or an ICE
//! session probing many remotes) can share one local port. All sockets live
//! in the service-owned `SocketTable` and are identified by small tokens.

use crate::shared::{ErrorType, NetworkError, NetworkResult, MAX_UDP_PAYLOAD};
use flare::logging;
use hashbrown::HashMap;
use mio::net::UdpSocket;
use mio::{Interest, Registry, Token};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};

/// Upper bound on datagrams drained per socket per wake, so one noisy peer
/// cannot starve the rest of the poll loop.
pub const MAX_DATAGRAMS_PER_WAKE: usize = 16;

/// Handle into the socket table.
pub type SocketToken = usize;

/// Dispatch result for an inbound datagram on a shared socket.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Dispatch {
    /// Datagram belongs to the connection registered for the source address.
    Connection(u32),
    /// No source-specific registration; the socket-level owner decides.
    Unclaimed,
}

pub struct BoundSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    log: logging::Logger,
}

impl BoundSocket {
    /// Binds a non-blocking UDP socket. Pass port 0 for an ephemeral port;
    /// the actual address is available afterwards via `local_addr`.
    pub fn bind<'a, L: Into<Option<&'a logging::Logger>>>(
        addr: SocketAddr,
        log: L,
    ) -> NetworkResult<BoundSocket> {
        let std_socket = StdUdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;

        let local_addr = std_socket.local_addr()?;
        let socket = UdpSocket::from_std(std_socket);

        let log = match log.into() {
            Some(log) => log.new(logging::o!("local_addr" => local_addr.to_string())),
            None => logging::discard(),
        };

        logging::debug!(log, "socket bound"; "context" => "bind");

        Ok(BoundSocket {
            socket,
            local_addr,
            log,
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Gather-send: the chunks are coalesced into one datagram without the
    /// caller having to build a contiguous buffer. Oversized payloads are a
    /// caller bug. EWOULDBLOCK surfaces as `Wait`; the packet is simply lost
    /// and retransmission recovers.
    pub fn send_gather(&self, target: SocketAddr, chunks: &[&[u8]]) -> NetworkResult<usize> {
        let mut datagram = [0u8; MAX_UDP_PAYLOAD];
        let mut offset = 0;

        for chunk in chunks {
            if offset + chunk.len() > MAX_UDP_PAYLOAD {
                return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
            }

            datagram[offset..offset + chunk.len()].copy_from_slice(chunk);
            offset += chunk.len();
        }

        logging::trace!(self.log, "sending datagram";
                        "context" => "send",
                        "target" => %target,
                        "size" => offset);

        let sent = self.socket.send_to(&datagram[..offset], target)?;
        Ok(sent)
    }

    /// Drains up to `MAX_DATAGRAMS_PER_WAKE` datagrams, invoking the sink for
    /// each. Returns the number received. `Wait` is folded into a normal
    /// return; hard socket errors surface to the owner.
    pub fn recv_batch<F: FnMut(SocketAddr, &[u8])>(&self, mut sink: F) -> NetworkResult<usize> {
        let mut buf = [0u8; MAX_UDP_PAYLOAD + 1];
        let mut count = 0;

        while count < MAX_DATAGRAMS_PER_WAKE {
            match self.socket.recv_from(&mut buf) {
                Ok((size, source)) => {
                    // Anything larger than the protocol maximum is noise
                    if size == 0 || size > MAX_UDP_PAYLOAD {
                        continue;
                    }

                    count += 1;
                    sink(source, &buf[..size]);
                }
                Err(err) => {
                    if err.kind() == ::std::io::ErrorKind::WouldBlock {
                        break;
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(count)
    }

    #[inline]
    fn register(&mut self, registry: &Registry, token: Token) -> NetworkResult<()> {
        registry
            .register(&mut self.socket, token, Interest::READABLE)
            .map_err(Into::into)
    }

    #[inline]
    fn deregister(&mut self, registry: &Registry) -> NetworkResult<()> {
        registry.deregister(&mut self.socket).map_err(Into::into)
    }
}

/// A bound socket plus a source-address dispatch map.
pub struct SharedSocket {
    bound: BoundSocket,
    dispatch: HashMap<SocketAddr, u32>,
}

impl SharedSocket {
    #[inline]
    pub fn new(bound: BoundSocket) -> SharedSocket {
        SharedSocket {
            bound,
            dispatch: HashMap::new(),
        }
    }

    #[inline]
    pub fn bound(&self) -> &BoundSocket {
        &self.bound
    }

    #[inline]
    pub fn claim(&mut self, peer: SocketAddr, connection_id: u32) {
        self.dispatch.insert(peer, connection_id);
    }

    #[inline]
    pub fn release(&mut self, peer: SocketAddr) {
        self.dispatch.remove(&peer);
    }

    #[inline]
    pub fn release_connection(&mut self, connection_id: u32) {
        self.dispatch.retain(|_, id| *id != connection_id);
    }

    #[inline]
    pub fn dispatch(&self, source: SocketAddr) -> Dispatch {
        match self.dispatch.get(&source) {
            Some(id) => Dispatch::Connection(*id),
            None => Dispatch::Unclaimed,
        }
    }
}

/// Service-owned table of open sockets. Tokens index into the table and
/// double as mio tokens.
pub struct SocketTable {
    entries: Vec<Option<SharedSocket>>,
    free: Vec<SocketToken>,
    log: logging::Logger,
}

impl SocketTable {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> SocketTable {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        SocketTable {
            entries: Vec::new(),
            free: Vec::new(),
            log,
        }
    }

    /// Opens and (when a registry is supplied) registers a new shared socket.
    pub fn open(
        &mut self,
        addr: SocketAddr,
        registry: Option<&Registry>,
    ) -> NetworkResult<SocketToken> {
        let mut bound = BoundSocket::bind(addr, &self.log)?;

        let token = match self.free.pop() {
            Some(token) => token,
            None => {
                self.entries.push(None);
                self.entries.len() - 1
            }
        };

        if let Some(registry) = registry {
            bound.register(registry, Token(token))?;
        }

        logging::debug!(self.log, "socket opened";
                        "context" => "open",
                        "token" => token,
                        "local_addr" => %bound.local_addr());

        self.entries[token] = Some(SharedSocket::new(bound));
        Ok(token)
    }

    pub fn close(&mut self, token: SocketToken, registry: Option<&Registry>) {
        if let Some(mut shared) = self.entries.get_mut(token).and_then(Option::take) {
            if let Some(registry) = registry {
                // Socket is going away regardless of deregistration failure
                drop(shared.bound.deregister(registry));
            }

            logging::debug!(self.log, "socket closed"; "context" => "close", "token" => token);
            self.free.push(token);
        }
    }

    #[inline]
    pub fn get(&self, token: SocketToken) -> Option<&SharedSocket> {
        self.entries.get(token).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, token: SocketToken) -> Option<&mut SharedSocket> {
        self.entries.get_mut(token).and_then(Option::as_mut)
    }

    #[inline]
    pub fn tokens(&self) -> impl Iterator<Item = SocketToken> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(token, entry)| entry.as_ref().map(|_| token))
    }
}

/// Local interface addresses usable for candidate gathering. The default
/// route address is discovered with a connected UDP socket, which never
/// sends traffic; loopback is appended for same-host setups.
pub fn enumerate_local_addresses(include_loopback: bool) -> Vec<IpAddr> {
    let mut addrs = Vec::new();

    if let Ok(probe) = StdUdpSocket::bind(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        0,
    )) {
        // connect() on UDP only sets the default destination; no packet is
        // emitted, but the OS resolves the egress interface for us.
        if probe.connect("192.0.2.1:9").is_ok() {
            if let Ok(local) = probe.local_addr() {
                if !local.ip().is_unspecified() && !local.ip().is_loopback() {
                    addrs.push(local.ip());
                }
            }
        }
    }

    if include_loopback || addrs.is_empty() {
        addrs.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_bind_ephemeral() {
        let socket = BoundSocket::bind(loopback(), None).unwrap();
        assert_ne!(socket.local_addr().port(), 0);
    }

    #[test]
    fn test_gather_send_and_receive() {
        let a = BoundSocket::bind(loopback(), None).unwrap();
        let b = BoundSocket::bind(loopback(), None).unwrap();

        let header = [1u8, 2, 3];
        let payload = [9u8; 16];
        a.send_gather(b.local_addr(), &[&header, &payload]).unwrap();

        // Non-blocking receive may need a beat for loopback delivery
        let mut received = Vec::new();
        for _ in 0..100 {
            let count = b
                .recv_batch(|source, data| {
                    assert_eq!(source, a.local_addr());
                    received = data.to_vec();
                })
                .unwrap();

            if count > 0 {
                break;
            }
            ::std::thread::sleep(::std::time::Duration::from_millis(1));
        }

        let mut expected = header.to_vec();
        expected.extend_from_slice(&payload);
        assert_eq!(received, expected);
    }

    #[test]
    fn test_gather_send_rejects_oversize() {
        let a = BoundSocket::bind(loopback(), None).unwrap();
        let big = vec![0u8; MAX_UDP_PAYLOAD];

        let result = a.send_gather(a.local_addr(), &[&big, &[1u8]]);
        assert_eq!(
            result.unwrap_err(),
            NetworkError::Fatal(ErrorType::PayloadTooLarge)
        );
    }

    #[test]
    fn test_shared_socket_dispatch() {
        let bound = BoundSocket::bind(loopback(), None).unwrap();
        let mut shared = SharedSocket::new(bound);

        let peer_a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let peer_b: SocketAddr = "10.0.0.2:1000".parse().unwrap();

        shared.claim(peer_a, 11);
        shared.claim(peer_b, 22);

        assert_eq!(shared.dispatch(peer_a), Dispatch::Connection(11));
        assert_eq!(shared.dispatch(peer_b), Dispatch::Connection(22));

        shared.release(peer_a);
        assert_eq!(shared.dispatch(peer_a), Dispatch::Unclaimed);

        shared.release_connection(22);
        assert_eq!(shared.dispatch(peer_b), Dispatch::Unclaimed);
    }

    #[test]
    fn test_socket_table_reuses_tokens() {
        let mut table = SocketTable::new(None);

        let first = table.open(loopback(), None).unwrap();
        let second = table.open(loopback(), None).unwrap();
        assert_ne!(first, second);

        table.close(first, None);
        assert!(table.get(first).is_none());

        let third = table.open(loopback(), None).unwrap();
        assert_eq!(third, first);
        assert!(table.get(third).is_some());
    }

    #[test]
    fn test_enumerate_local_addresses_never_empty() {
        let addrs = enumerate_local_addresses(true);
        assert!(!addrs.is_empty());
        assert!(addrs.iter().any(|addr| addr.is_loopback()));
    }
}
