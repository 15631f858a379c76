//! The P2P rendezvous envelope: an opaque blob the application's signaling
//! transport ferries between peers before a direct path exists. Carries the
//! connect handshake plus a miniature reliable stream of ICE candidates and
//! auth credentials.

use crate::proto::{
    P2pAuth, P2pReliableMessage, P2pReliablePayload, P2pRendezvous, RendezvousBody,
};
use flare::logging;
use prost::Message;
use std::collections::VecDeque;

/// Retransmission interval. Uncapped and unbounded: signaling retries until
/// the owning connection dies.
const SIGNAL_RTO_USEC: u64 = 500_000;

/// The application supplies this: whatever channel it has for shuttling
/// blobs to the peer before a direct route exists. Returning false means the
/// channel cannot take the blob right now; the session simply retries.
pub trait SignalTransport: Send {
    fn send_signal(&mut self, blob: &[u8]) -> bool;
}

/// What fell out of an inbound envelope, in delivery order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RendezvousDelivery {
    Candidate(String),
    Auth { ufrag: String, pwd: String },
    Body(RendezvousBody),
}

struct PendingReliable {
    msg_id: u32,
    payload: P2pReliablePayload,
}

/// Per-connection rendezvous state, one per P2P connection attempt.
pub struct RendezvousSession {
    local_identity: String,
    remote_identity: String,
    local_connection_id: u32,
    remote_connection_id: u32,

    /// Body repeated in every outbound envelope until superseded.
    body: Option<RendezvousBody>,

    /// Unacked reliable sub-messages, oldest first.
    pending: VecDeque<PendingReliable>,
    next_msg_id: u32,

    /// Highest contiguous remote id delivered; everything at or below is
    /// acked-but-swallowed on re-receipt.
    last_delivered_remote: u32,

    next_send_usec: u64,
    dirty: bool,

    log: logging::Logger,
}

impl RendezvousSession {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        local_identity: String,
        remote_identity: String,
        local_connection_id: u32,
        log: L,
    ) -> RendezvousSession {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("conn_id" => local_connection_id)),
            None => logging::discard(),
        };

        RendezvousSession {
            local_identity,
            remote_identity,
            local_connection_id,
            remote_connection_id: 0,
            body: None,
            pending: VecDeque::new(),
            next_msg_id: 1,
            last_delivered_remote: 0,
            next_send_usec: 0,
            dirty: false,
            log,
        }
    }

    #[inline]
    pub fn remote_connection_id(&self) -> u32 {
        self.remote_connection_id
    }

    /// Replaces the envelope body (connect request/ok/closed).
    pub fn set_body(&mut self, body: RendezvousBody) {
        self.body = Some(body);
        self.dirty = true;
    }

    /// Stops repeating the body; the reliable sub-messages continue.
    pub fn clear_body(&mut self) {
        self.body = None;
    }

    pub fn queue_candidate(&mut self, candidate: String) {
        self.queue_reliable(P2pReliablePayload::Candidate(candidate));
    }

    pub fn queue_auth(&mut self, ufrag: String, pwd: String) {
        self.queue_reliable(P2pReliablePayload::Auth(P2pAuth { ufrag, pwd }));
    }

    fn queue_reliable(&mut self, payload: P2pReliablePayload) {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;

        logging::debug!(self.log, "reliable signal queued";
                        "context" => "signal",
                        "msg_id" => msg_id);

        self.pending.push_back(PendingReliable { msg_id, payload });
        self.dirty = true;
    }

    /// True while anything still needs (re)transmission.
    #[inline]
    pub fn has_work(&self) -> bool {
        self.dirty || !self.pending.is_empty()
    }

    pub fn next_send_usec(&self) -> Option<u64> {
        match self.has_work() {
            true => Some(match self.dirty {
                true => 0,
                false => self.next_send_usec,
            }),
            false => None,
        }
    }

    /// Emits the current envelope through the signal transport when due.
    pub fn think(&mut self, transport: &mut dyn SignalTransport, now_usec: u64) {
        if !self.has_work() {
            return;
        }

        if !self.dirty && now_usec < self.next_send_usec {
            return;
        }

        let envelope = self.build_envelope();
        let blob = envelope.encode_to_vec();

        logging::trace!(self.log, "signal emitted";
                        "context" => "signal",
                        "bytes" => blob.len(),
                        "pending" => self.pending.len());

        if transport.send_signal(&blob) {
            self.dirty = false;
            self.next_send_usec = now_usec + SIGNAL_RTO_USEC;
        }
    }

    fn build_envelope(&self) -> P2pRendezvous {
        P2pRendezvous {
            to_connection_id: self.remote_connection_id,
            from_connection_id: self.local_connection_id,
            to_identity: self.remote_identity.clone(),
            from_identity: self.local_identity.clone(),
            body: self.body.clone(),
            reliable_messages: self
                .pending
                .iter()
                .map(|pending| P2pReliableMessage {
                    msg_id: pending.msg_id,
                    payload: Some(pending.payload.clone()),
                })
                .collect(),
            ack_msg_id: self.last_delivered_remote,
        }
    }

    /// Ingests an inbound envelope blob. Returns the new deliveries in
    /// order; duplicates are acked but withheld.
    pub fn on_signal(&mut self, blob: &[u8]) -> Vec<RendezvousDelivery> {
        let envelope = match P2pRendezvous::decode(blob) {
            Ok(envelope) => envelope,
            Err(_) => {
                logging::debug!(self.log, "malformed rendezvous blob dropped";
                                "context" => "signal");
                return Vec::new();
            }
        };

        if envelope.from_connection_id != 0 {
            self.remote_connection_id = envelope.from_connection_id;
        }

        // The peer's ack releases everything at or below it
        let before = self.pending.len();
        let ack = envelope.ack_msg_id;
        self.pending.retain(|pending| pending.msg_id > ack);
        if self.pending.len() != before {
            logging::trace!(self.log, "signals acked";
                            "context" => "signal",
                            "ack" => ack);
        }

        let mut deliveries = Vec::new();

        // Reliable sub-messages deliver in id order, exactly once
        let mut messages = envelope.reliable_messages;
        messages.sort_by_key(|m| m.msg_id);

        for message in messages {
            if message.msg_id != self.last_delivered_remote + 1 {
                // Duplicate (acked below) or a gap we must wait out
                continue;
            }

            let payload = match message.payload {
                Some(payload) => payload,
                None => continue,
            };

            self.last_delivered_remote = message.msg_id;
            self.dirty = true;

            deliveries.push(match payload {
                P2pReliablePayload::Candidate(candidate) => {
                    RendezvousDelivery::Candidate(candidate)
                }
                P2pReliablePayload::Auth(auth) => RendezvousDelivery::Auth {
                    ufrag: auth.ufrag,
                    pwd: auth.pwd,
                },
            });
        }

        if let Some(body) = envelope.body {
            deliveries.push(RendezvousDelivery::Body(body));
        }

        deliveries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::ConnectionClosed;

    struct PipeTransport {
        sent: Vec<Vec<u8>>,
        accept: bool,
    }

    impl PipeTransport {
        fn new() -> PipeTransport {
            PipeTransport {
                sent: Vec::new(),
                accept: true,
            }
        }
    }

    impl SignalTransport for PipeTransport {
        fn send_signal(&mut self, blob: &[u8]) -> bool {
            if self.accept {
                self.sent.push(blob.to_vec());
            }
            self.accept
        }
    }

    fn session(name: &str, conn_id: u32) -> RendezvousSession {
        RendezvousSession::new(
            format!("str:{}", name),
            "str:peer".to_owned(),
            conn_id,
            None,
        )
    }

    #[test]
    fn test_reliable_messages_deliver_in_order() {
        let mut alice = session("alice", 1);
        let mut bob = session("bob", 2);
        let mut pipe = PipeTransport::new();

        alice.queue_auth("ufrag".to_owned(), "pwd".to_owned());
        alice.queue_candidate("candidate:a 1 udp 1 10.0.0.1 1 typ host".to_owned());

        alice.think(&mut pipe, 0);
        assert_eq!(pipe.sent.len(), 1);

        let deliveries = bob.on_signal(&pipe.sent[0]);
        assert_eq!(deliveries.len(), 2);
        assert_eq!(
            deliveries[0],
            RendezvousDelivery::Auth {
                ufrag: "ufrag".to_owned(),
                pwd: "pwd".to_owned()
            }
        );
        match &deliveries[1] {
            RendezvousDelivery::Candidate(text) => assert!(text.starts_with("candidate:a")),
            other => panic!("Unexpected delivery {:?}", other),
        }

        assert_eq!(bob.remote_connection_id(), 1);
    }

    #[test]
    fn test_duplicates_acked_not_redelivered() {
        let mut alice = session("alice", 1);
        let mut bob = session("bob", 2);
        let mut pipe = PipeTransport::new();

        alice.queue_candidate("candidate:x 1 udp 1 10.0.0.1 1 typ host".to_owned());
        alice.think(&mut pipe, 0);

        assert_eq!(bob.on_signal(&pipe.sent[0]).len(), 1);
        // The same envelope replayed: nothing new delivered
        assert_eq!(bob.on_signal(&pipe.sent[0]).len(), 0);
    }

    #[test]
    fn test_ack_stops_retransmission() {
        let mut alice = session("alice", 1);
        let mut bob = session("bob", 2);
        let mut alice_pipe = PipeTransport::new();
        let mut bob_pipe = PipeTransport::new();

        alice.queue_candidate("candidate:x 1 udp 1 10.0.0.1 1 typ host".to_owned());
        alice.think(&mut alice_pipe, 0);
        assert!(alice.has_work());

        bob.on_signal(&alice_pipe.sent[0]);
        bob.think(&mut bob_pipe, 0);

        // Bob's envelope acks message 1; Alice goes quiet
        alice.on_signal(&bob_pipe.sent[0]);
        assert!(!alice.has_work());
    }

    #[test]
    fn test_retransmit_schedule() {
        let mut alice = session("alice", 1);
        let mut pipe = PipeTransport::new();

        alice.queue_candidate("candidate:x 1 udp 1 10.0.0.1 1 typ host".to_owned());

        alice.think(&mut pipe, 0);
        assert_eq!(pipe.sent.len(), 1);

        // Unacked: silent until the RTO, then again, without a cap
        alice.think(&mut pipe, SIGNAL_RTO_USEC - 1);
        assert_eq!(pipe.sent.len(), 1);

        alice.think(&mut pipe, SIGNAL_RTO_USEC);
        assert_eq!(pipe.sent.len(), 2);

        alice.think(&mut pipe, SIGNAL_RTO_USEC * 10);
        assert_eq!(pipe.sent.len(), 3);
    }

    #[test]
    fn test_gap_waits_for_missing_message() {
        let mut alice = session("alice", 1);
        let mut bob = session("bob", 2);
        let mut pipe = PipeTransport::new();

        alice.queue_candidate("candidate:a 1 udp 1 10.0.0.1 1 typ host".to_owned());
        alice.queue_candidate("candidate:b 1 udp 1 10.0.0.2 1 typ host".to_owned());
        alice.think(&mut pipe, 0);

        // Simulate a mangled envelope that only carries message 2
        let mut envelope = P2pRendezvous::decode(&pipe.sent[0][..]).unwrap();
        envelope.reliable_messages.remove(0);
        let deliveries = bob.on_signal(&envelope.encode_to_vec());
        assert!(deliveries.is_empty());

        // The full envelope arrives later; both deliver in order
        let deliveries = bob.on_signal(&pipe.sent[0]);
        assert_eq!(deliveries.len(), 2);
    }

    #[test]
    fn test_body_carried_and_delivered() {
        let mut alice = session("alice", 1);
        let mut bob = session("bob", 2);
        let mut pipe = PipeTransport::new();

        alice.set_body(RendezvousBody::ConnectionClosed(ConnectionClosed {
            to_connection_id: 0,
            from_connection_id: 1,
            reason_code: 42,
            debug: "bye".to_owned(),
        }));
        alice.think(&mut pipe, 0);

        let deliveries = bob.on_signal(&pipe.sent[0]);
        assert_eq!(deliveries.len(), 1);
        match &deliveries[0] {
            RendezvousDelivery::Body(RendezvousBody::ConnectionClosed(closed)) => {
                assert_eq!(closed.reason_code, 42);
                assert_eq!(closed.debug, "bye");
            }
            other => panic!("Unexpected delivery {:?}", other),
        }
    }

    #[test]
    fn test_blocked_transport_retries() {
        let mut alice = session("alice", 1);
        let mut pipe = PipeTransport::new();
        pipe.accept = false;

        alice.queue_candidate("candidate:x 1 udp 1 10.0.0.1 1 typ host".to_owned());
        alice.think(&mut pipe, 0);
        assert!(alice.has_work());

        pipe.accept = true;
        alice.think(&mut pipe, 1);
        assert_eq!(pipe.sent.len(), 1);
    }
}
