//! End-to-end exercises over real loopback sockets with the service thread
//! running: handshake, bulk transfer, teardown semantics.

use flare::config::{opt, ConfigValue};
use flare::crypto;
use flare::identity::Identity;
use flare::keys::Ed25519KeyPair;
use rand::RngCore;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tachyon::snp::sendflag;
use tachyon::{ConnectionId, ConnectionState, NetContext};

fn context(name: &str) -> NetContext {
    NetContext::init(
        Identity::Str(name.to_owned()),
        Ed25519KeyPair::generate(),
        None,
    )
    .expect("context init")
}

fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

fn state_of(ctx: &NetContext, id: ConnectionId) -> Option<ConnectionState> {
    ctx.connection_info(id).map(|(state, _, _)| state)
}

/// Brings up a server/client pair over loopback and returns
/// (server, client, server_conn, client_conn).
fn connected_pair(tag: &str) -> (NetContext, NetContext, ConnectionId, ConnectionId) {
    let server = context(&format!("{}-server", tag));
    let client = context(&format!("{}-client", tag));

    // Fast rates so bulk tests do not wait on slow-start
    for ctx in [&server, &client].iter() {
        assert!(ctx.set_config(opt::SEND_RATE_MIN, ConfigValue::Int(262_144)));
        assert!(ctx.set_config(opt::SEND_RATE_MAX, ConfigValue::Int(1_048_576)));
    }

    let listener = server
        .create_listen_socket("127.0.0.1:0".parse().unwrap())
        .expect("listen");
    let addr = server.listen_addr(listener).expect("listen addr");

    let client_conn = client.connect_by_ip(addr).expect("connect");

    let mut server_conn = 0;
    assert!(
        wait_until(Duration::from_secs(5), || {
            match server.pending_connections().first() {
                Some(&id) => {
                    server_conn = id;
                    true
                }
                None => false,
            }
        }),
        "server never saw the connection request"
    );

    server.accept(server_conn).expect("accept");

    assert!(
        wait_until(Duration::from_secs(5), || state_of(&client, client_conn)
            == Some(ConnectionState::Connected)),
        "client never reached Connected"
    );
    assert!(
        wait_until(Duration::from_secs(5), || state_of(&server, server_conn)
            == Some(ConnectionState::Connected)),
        "server never reached Connected"
    );

    (server, client, server_conn, client_conn)
}

#[test]
fn test_direct_ip_handshake_and_bulk_transfer() {
    let (server, client, server_conn, client_conn) = connected_pair("bulk");

    let mut rng = rand::thread_rng();
    let mut sent = Vec::new();
    for _ in 0..100 {
        let mut payload = vec![0u8; 1000];
        rng.fill_bytes(&mut payload);
        sent.extend_from_slice(&payload);
        client
            .send_message(
                client_conn,
                &payload,
                0,
                sendflag::RELIABLE | sendflag::NO_NAGLE,
            )
            .expect("queue send");
    }

    let mut received = Vec::new();
    let mut count = 0usize;
    let mut last_id = 0u64;

    assert!(
        wait_until(Duration::from_secs(20), || {
            for message in server.receive_messages(server_conn, 64) {
                assert!(message.message_id > last_id, "delivery must be in order");
                last_id = message.message_id;
                count += 1;
                received.extend_from_slice(&message.payload);
            }
            count == 100
        }),
        "only {} of 100 messages arrived",
        count
    );

    assert_eq!(crypto::sha256(&received), crypto::sha256(&sent));

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_bidirectional_traffic() {
    let (server, client, server_conn, client_conn) = connected_pair("bidi");

    client
        .send_message(client_conn, b"ping from client", 0, sendflag::RELIABLE)
        .unwrap();
    server
        .send_message(server_conn, b"pong from server", 0, sendflag::RELIABLE)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        server
            .receive_messages(server_conn, 4)
            .iter()
            .any(|m| m.payload == b"ping from client")
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        client
            .receive_messages(client_conn, 4)
            .iter()
            .any(|m| m.payload == b"pong from server")
    }));

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_close_reaches_peer_with_reason() {
    let (server, client, server_conn, client_conn) = connected_pair("close");

    client.close(client_conn, 1042, "bye", false);

    assert!(
        wait_until(Duration::from_secs(5), || {
            match server.connection_info(server_conn) {
                Some((ConnectionState::ClosedByPeer, code, debug)) => {
                    assert_eq!(code, 1042);
                    assert_eq!(debug, "bye");
                    true
                }
                _ => false,
            }
        }),
        "server never learned of the close"
    );

    // The dead end refuses further traffic
    assert!(server
        .send_message(server_conn, b"too late", 0, sendflag::RELIABLE)
        .is_err());

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_status_callback_fires_in_order() {
    use std::sync::{Arc, Mutex};

    let server = context("cb-server");
    let client = context("cb-client");

    let seen: Arc<Mutex<Vec<ConnectionState>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    client.set_status_callback(Box::new(move |change| {
        sink.lock().unwrap().push(change.new_state);
    }));

    let listener = server
        .create_listen_socket("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let addr = server.listen_addr(listener).unwrap();
    let client_conn = client.connect_by_ip(addr).unwrap();

    let mut server_conn = 0;
    assert!(wait_until(Duration::from_secs(5), || {
        match server.pending_connections().first() {
            Some(&id) => {
                server_conn = id;
                true
            }
            None => false,
        }
    }));
    server.accept(server_conn).unwrap();

    assert!(wait_until(Duration::from_secs(5), || state_of(
        &client,
        client_conn
    ) == Some(ConnectionState::Connected)));

    let states = seen.lock().unwrap().clone();
    let connecting = states
        .iter()
        .position(|&s| s == ConnectionState::Connecting);
    let connected = states.iter().position(|&s| s == ConnectionState::Connected);

    assert!(connecting.is_some(), "callback missed Connecting");
    assert!(connected.is_some(), "callback missed Connected");
    assert!(connecting < connected, "transitions out of order");

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_socket_pair_loopback() {
    let ctx = context("pair");
    let (a, b) = ctx.create_socket_pair();

    assert_eq!(state_of(&ctx, a), Some(ConnectionState::Connected));
    assert_eq!(state_of(&ctx, b), Some(ConnectionState::Connected));

    ctx.send_message(a, b"over the pipe", 3, sendflag::RELIABLE | sendflag::NO_NAGLE)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        ctx.receive_messages(b, 4)
            .iter()
            .any(|m| m.payload == b"over the pipe" && m.channel == 3)
    }));

    ctx.shutdown();
}

#[test]
fn test_send_guards() {
    let ctx = context("guards");
    let (a, _b) = ctx.create_socket_pair();

    // Zero-byte sends are a caller error
    assert!(ctx.send_message(a, &[], 0, sendflag::RELIABLE).is_err());

    // Flooding past the buffer ceiling reports would-block
    let big = vec![0u8; 200 * 1024];
    let mut hit_limit = false;
    for _ in 0..8 {
        if ctx.send_message(a, &big, 0, sendflag::RELIABLE).is_err() {
            hit_limit = true;
            break;
        }
    }
    assert!(hit_limit, "buffer ceiling never enforced");

    ctx.shutdown();
}

#[test]
fn test_user_data_and_detailed_status() {
    let ctx = context("diag");
    let (a, _b) = ctx.create_socket_pair();

    ctx.set_user_data(a, 0x5eed);
    assert_eq!(ctx.user_data(a), Some(0x5eed));

    let status = ctx.detailed_status(a).expect("status");
    assert!(status.contains("Connected"));

    ctx.shutdown();
}
