//! Wire messages. Field numbers are the compatibility contract; renaming a
//! field is fine, renumbering is a protocol break.

use flare::cert::{CertSigned, CryptInfoSigned};
use prost::Message;

pub const ACK_REQUEST_E2E: u32 = 1;
pub const ACK_REQUEST_IMMEDIATE: u32 = 2;

#[derive(Clone, PartialEq, Message)]
pub struct ChallengeRequest {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(fixed64, tag = "2")]
    pub my_timestamp: u64,
    #[prost(uint32, tag = "3")]
    pub protocol_version: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChallengeReply {
    #[prost(uint32, tag = "1")]
    pub connection_id: u32,
    #[prost(fixed64, tag = "2")]
    pub challenge: u64,
    #[prost(fixed64, tag = "3")]
    pub your_timestamp: u64,
    #[prost(uint32, tag = "4")]
    pub protocol_version: u32,
}

#[derive(Clone, Eq, PartialEq, Message)]
pub struct ConnectRequest {
    #[prost(uint32, tag = "1")]
    pub client_connection_id: u32,
    #[prost(fixed64, tag = "2")]
    pub challenge: u64,
    #[prost(fixed64, tag = "3")]
    pub client_steam_id: u64,
    #[prost(fixed64, tag = "4")]
    pub my_timestamp: u64,
    #[prost(uint32, tag = "5")]
    pub ping_est_ms: u32,
    #[prost(message, optional, tag = "6")]
    pub cert: Option<CertSigned>,
    #[prost(message, optional, tag = "7")]
    pub crypt: Option<CryptInfoSigned>,
    #[prost(uint32, tag = "8")]
    pub protocol_version: u32,
    #[prost(string, tag = "9")]
    pub identity: String,
    #[prost(uint32, tag = "10")]
    pub to_virtual_port: u32,
    #[prost(uint32, tag = "11")]
    pub from_virtual_port: u32,
}

#[derive(Clone, Eq, PartialEq, Message)]
pub struct ConnectOk {
    #[prost(uint32, tag = "1")]
    pub client_connection_id: u32,
    #[prost(uint32, tag = "2")]
    pub server_connection_id: u32,
    #[prost(fixed64, tag = "3")]
    pub server_steam_id: u64,
    #[prost(message, optional, tag = "4")]
    pub cert: Option<CertSigned>,
    #[prost(message, optional, tag = "5")]
    pub crypt: Option<CryptInfoSigned>,
    #[prost(fixed64, tag = "6")]
    pub your_timestamp: u64,
    #[prost(uint64, tag = "7")]
    pub delay_time_usec: u64,
    #[prost(uint32, tag = "8")]
    pub protocol_version: u32,
    #[prost(string, tag = "9")]
    pub identity: String,
}

#[derive(Clone, Eq, PartialEq, Message)]
pub struct ConnectionClosed {
    #[prost(uint32, tag = "1")]
    pub to_connection_id: u32,
    #[prost(uint32, tag = "2")]
    pub from_connection_id: u32,
    #[prost(uint32, tag = "3")]
    pub reason_code: u32,
    #[prost(string, tag = "4")]
    pub debug: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct NoConnection {
    #[prost(uint32, tag = "1")]
    pub to_connection_id: u32,
    #[prost(uint32, tag = "2")]
    pub from_connection_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct StatsLifetime {
    #[prost(uint64, tag = "1")]
    pub packets_sent: u64,
    #[prost(uint64, tag = "2")]
    pub bytes_sent: u64,
    #[prost(uint64, tag = "3")]
    pub packets_recv: u64,
    #[prost(uint64, tag = "4")]
    pub bytes_recv: u64,
    #[prost(uint64, tag = "5")]
    pub packets_dropped: u64,
    #[prost(uint64, tag = "6")]
    pub packets_out_of_order: u64,
    #[prost(uint32, repeated, tag = "7")]
    pub ping_histogram: Vec<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StatsInstant {
    #[prost(uint32, tag = "1")]
    pub ping_ms: u32,
    #[prost(uint32, tag = "2")]
    pub send_rate_bytes_per_sec: u32,
    #[prost(uint32, tag = "3")]
    pub pending_reliable_bytes: u32,
    #[prost(uint32, tag = "4")]
    pub recent_loss_permille: u32,
}

/// Inline stats blob attached to data packets. `ack_e2e` entries pack a run
/// of acknowledged wire sequence numbers as `(first_seq << 16) | run_len`.
#[derive(Clone, PartialEq, Message)]
pub struct Stats {
    #[prost(message, optional, tag = "1")]
    pub lifetime: Option<StatsLifetime>,
    #[prost(message, optional, tag = "2")]
    pub instantaneous: Option<StatsInstant>,
    #[prost(uint32, tag = "3")]
    pub flags: u32,
    #[prost(uint32, repeated, tag = "4")]
    pub ack_e2e: Vec<u32>,
    #[prost(uint32, tag = "5")]
    pub seq_num: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct P2pAuth {
    #[prost(string, tag = "1")]
    pub ufrag: String,
    #[prost(string, tag = "2")]
    pub pwd: String,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum P2pReliablePayload {
    #[prost(string, tag = "2")]
    Candidate(String),
    #[prost(message, tag = "3")]
    Auth(P2pAuth),
}

/// A sub-message of the rendezvous envelope delivered exactly once, in order.
#[derive(Clone, PartialEq, Message)]
pub struct P2pReliableMessage {
    #[prost(uint32, tag = "1")]
    pub msg_id: u32,
    #[prost(oneof = "P2pReliablePayload", tags = "2, 3")]
    pub payload: Option<P2pReliablePayload>,
}

#[derive(Clone, Eq, PartialEq, ::prost::Oneof)]
pub enum RendezvousBody {
    #[prost(message, tag = "5")]
    ConnectRequest(ConnectRequest),
    #[prost(message, tag = "6")]
    ConnectOk(ConnectOk),
    #[prost(message, tag = "7")]
    ConnectionClosed(ConnectionClosed),
}

/// The opaque envelope ferried by the application's signaling transport.
#[derive(Clone, PartialEq, Message)]
pub struct P2pRendezvous {
    #[prost(uint32, tag = "1")]
    pub to_connection_id: u32,
    #[prost(uint32, tag = "2")]
    pub from_connection_id: u32,
    #[prost(string, tag = "3")]
    pub to_identity: String,
    #[prost(string, tag = "4")]
    pub from_identity: String,
    #[prost(oneof = "RendezvousBody", tags = "5, 6, 7")]
    pub body: Option<RendezvousBody>,
    #[prost(message, repeated, tag = "8")]
    pub reliable_messages: Vec<P2pReliableMessage>,
    #[prost(uint32, tag = "9")]
    pub ack_msg_id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_request_roundtrip() {
        let msg = ChallengeRequest {
            connection_id: 0xdeadbeef,
            my_timestamp: 123_456_789,
            protocol_version: 11,
        };

        let bytes = msg.encode_to_vec();
        let decoded = ChallengeRequest::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_rendezvous_oneof_roundtrip() {
        let msg = P2pRendezvous {
            to_connection_id: 1,
            from_connection_id: 2,
            to_identity: "str:bob".to_owned(),
            from_identity: "str:alice".to_owned(),
            body: Some(RendezvousBody::ConnectionClosed(ConnectionClosed {
                to_connection_id: 1,
                from_connection_id: 2,
                reason_code: 42,
                debug: "bye".to_owned(),
            })),
            reliable_messages: vec![P2pReliableMessage {
                msg_id: 7,
                payload: Some(P2pReliablePayload::Candidate(
                    "candidate:1 1 udp 2130706431 192.0.2.1 27015 typ host".to_owned(),
                )),
            }],
            ack_msg_id: 6,
        };

        let bytes = msg.encode_to_vec();
        let decoded = P2pRendezvous::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_fields_skipped() {
        // A future peer may append fields; decoding must not choke.
        let msg = NoConnection {
            to_connection_id: 5,
            from_connection_id: 6,
        };
        let mut bytes = msg.encode_to_vec();
        // field 15, varint 1
        bytes.extend_from_slice(&[0x78, 0x01]);

        let decoded = NoConnection::decode(&bytes[..]).unwrap();
        assert_eq!(decoded, msg);
    }
}
