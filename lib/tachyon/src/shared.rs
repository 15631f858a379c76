use std::io;
use std::net;

/// Wire protocol version. Peers below `MIN_PROTOCOL_VERSION` are refused.
pub const PROTOCOL_VERSION: u32 = 11;
pub const MIN_PROTOCOL_VERSION: u32 = 11;

/// Largest UDP payload this transport will emit or accept.
pub const MAX_UDP_PAYLOAD: usize = 1280;

/// Connectionless handshake packets are zero-padded up to this size so a
/// reflector cannot use us for amplification.
pub const MIN_HANDSHAKE_PACKET: usize = 512;

/// Per-connection handle as surfaced through the public API.
pub type ConnectionId = u32;

/// Multiplexing tag inside a peer identity.
pub type VirtualPort = u16;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// Not an error: the operation cannot make progress right now.
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    Expired,
    Duplicate,
    PayloadTooLarge,
    EmptyPayload,
    ProtocolMismatch,
    SequenceMismatch,
    BadPacket,
    NoMatchingConnection,
    Serialization,
    Crypto,
    CertRejected,
    AddrParse,
    MisuseOfApi,
    OutOfResources,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

impl From<prost::DecodeError> for NetworkError {
    #[inline]
    fn from(_: prost::DecodeError) -> Self {
        NetworkError::Fatal(ErrorType::Serialization)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Reason codes carried in ConnectionClosed and surfaced through the status
/// callback. Application-supplied codes live in 1000..=1999; everything else
/// is allocated here by failure class.
pub mod reason {
    pub const INVALID: u32 = 0;

    pub const APP_MIN: u32 = 1000;
    pub const APP_GENERIC: u32 = 1000;
    pub const APP_MAX: u32 = 1999;

    // Local misuse / resource failures
    pub const MISC_INTERNAL_ERROR: u32 = 2001;
    pub const MISC_GENERIC: u32 = 2002;
    pub const OUT_OF_RESOURCES: u32 = 2003;

    // Network problems detected locally
    pub const TIMEOUT_INITIAL: u32 = 3001;
    pub const TIMEOUT_INACTIVE: u32 = 3002;
    pub const REFUSED: u32 = 3003;
    pub const SOCKET_ERROR: u32 = 3004;
    pub const P2P_RENDEZVOUS_FAILED: u32 = 3005;
    pub const ICE_FAILED: u32 = 3006;

    // Crypto failures
    pub const CERT_INVALID: u32 = 4001;
    pub const CERT_EXPIRED: u32 = 4002;
    pub const CERT_AUTH_UNKNOWN: u32 = 4003;
    pub const KEY_MISMATCH: u32 = 4004;
    pub const AEAD_FAILURE: u32 = 4005;

    // Peer spoke but we could not go on
    pub const REMOTE_BAD_PROTOCOL_VERSION: u32 = 5001;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetworkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetworkError::Wait);

        let err: NetworkError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(
            err,
            NetworkError::Fatal(ErrorType::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_has_failed() {
        let ok: NetworkResult<()> = Ok(());
        let wait: NetworkResult<()> = Err(NetworkError::Wait);
        let fatal: NetworkResult<()> = Err(NetworkError::Fatal(ErrorType::Crypto));

        assert!(!ok.has_failed());
        assert!(!wait.has_failed());
        assert!(fatal.has_failed());
    }
}
