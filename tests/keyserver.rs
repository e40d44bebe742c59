//! End-to-end tests: keyless client against a live keyserver.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use keyless::protocol::{ErrorCode, Op, Operation, Packet, Ski};
use keyless::{ClientError, MemoryKeystore, ServerConfig};

mod common;

#[tokio::test]
async fn ping_round_trip() {
    let server = common::start_keyserver(ServerConfig::default(), Arc::new(MemoryKeystore::new())).await;
    let client = common::tcp_client();

    let conn = client.dial(&server.addr.to_string()).await.unwrap();
    assert_eq!(conn.ping(b"hello").await.unwrap(), b"hello");
    assert_eq!(server.tracker.active_count(), 1);

    server.stop().await;
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let server = common::start_keyserver(ServerConfig::default(), Arc::new(MemoryKeystore::new())).await;
    let client = common::tcp_client();
    let conn = client.dial(&server.addr.to_string()).await.unwrap();

    let results = join_all((0..200u32).map(|i| {
        let conn = Arc::clone(&conn);
        async move { (i, conn.ping(&i.to_be_bytes()).await) }
    }))
    .await;

    for (i, result) in results {
        assert_eq!(result.unwrap(), i.to_be_bytes());
    }
    assert_eq!(conn.in_flight(), 0);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fast_response_overtakes_slow_one() {
    let keystore = MemoryKeystore::new();
    let slow_ski = Ski([0x51; 20]);
    keystore.insert(
        slow_ski,
        Arc::new(common::ReversingKey {
            delay: Duration::from_millis(300),
        }),
    );
    let server = common::start_keyserver(ServerConfig::default(), Arc::new(keystore)).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let slow = Packet::new(1, Operation::new(Op::RsaSignSha256, vec![1, 2, 3]).with_key(slow_ski, None)).unwrap();
    let fast = Packet::new(2, Operation::new(Op::Ping, b"quick".to_vec())).unwrap();
    stream.write_all(&slow.marshal_binary().unwrap()).await.unwrap();
    stream.write_all(&fast.marshal_binary().unwrap()).await.unwrap();

    let first = Packet::read_from(&mut stream).await.unwrap();
    let second = Packet::read_from(&mut stream).await.unwrap();

    assert_eq!(first.id(), 2);
    assert_eq!(first.opcode(), Op::Ping);
    assert_eq!(first.operation.payload, b"quick");
    assert_eq!(second.id(), 1);
    assert_eq!(second.opcode(), Op::RsaSignSha256);
    assert_eq!(second.operation.payload, vec![3, 2, 1]);

    server.stop().await;
}

// As many slow signers as runtime threads; the ping must still be read,
// dispatched and answered while they run.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_overtakes_signs_saturating_the_runtime() {
    let keystore = MemoryKeystore::new();
    let slow_ski = Ski([0x52; 20]);
    keystore.insert(
        slow_ski,
        Arc::new(common::ReversingKey {
            delay: Duration::from_millis(800),
        }),
    );
    let mut config = ServerConfig::default();
    config.pools.rsa.workers = 2;
    let server = common::start_keyserver(config, Arc::new(keystore)).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    for id in 1..=2 {
        let slow = Packet::new(id, Operation::new(Op::RsaSignSha256, vec![id as u8]).with_key(slow_ski, None)).unwrap();
        stream.write_all(&slow.marshal_binary().unwrap()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ping = Packet::new(99, Operation::new(Op::Ping, b"still responsive".to_vec())).unwrap();
    stream.write_all(&ping.marshal_binary().unwrap()).await.unwrap();

    let first = Packet::read_from(&mut stream).await.unwrap();
    assert_eq!(first.id(), 99);
    assert_eq!(first.operation.payload, b"still responsive");

    let mut rest = vec![
        Packet::read_from(&mut stream).await.unwrap().id(),
        Packet::read_from(&mut stream).await.unwrap().id(),
    ];
    rest.sort_unstable();
    assert_eq!(rest, vec![1, 2]);

    server.stop().await;
}

#[tokio::test]
async fn sign_routes_past_unreachable_server() {
    let spki = common::ed25519_spki([7; 32]);
    let keystore = MemoryKeystore::new();
    keystore.insert(
        Ski::from_spki_der(&spki).unwrap(),
        Arc::new(common::ReversingKey { delay: Duration::ZERO }),
    );
    let server = common::start_keyserver(ServerConfig::default(), Arc::new(keystore)).await;
    let live = server.addr.to_string();
    let dead = common::unreachable_addr().await;

    let client = common::tcp_client();
    let key = client.register_public_key(&dead, &spki).unwrap();
    client.register_public_key(&live, &spki).unwrap();

    for _ in 0..5 {
        let signature = key.sign(Op::Ed25519Sign, &[1, 2, 3, 4]).await.unwrap();
        assert_eq!(signature, vec![4, 3, 2, 1]);
    }
    assert_eq!(client.servers_for(&key.ski()), vec![dead, live]);

    server.stop().await;
}

#[tokio::test]
async fn keyserver_errors_reach_the_caller() {
    let server = common::start_keyserver(ServerConfig::default(), Arc::new(MemoryKeystore::new())).await;
    let client = common::tcp_client();

    let key = client
        .register_public_key(&server.addr.to_string(), &common::ed25519_spki([8; 32]))
        .unwrap();
    let missing = key.sign(Op::Ed25519Sign, &[0; 32]).await;
    assert!(matches!(missing, Err(ClientError::Remote(ErrorCode::KeyNotFound))));

    let conn = client.dial(&server.addr.to_string()).await.unwrap();
    let unknown = conn.do_operation(Operation::new(Op::Unknown(0x99), vec![])).await;
    assert!(matches!(unknown, Err(ClientError::Remote(ErrorCode::BadOpcode))));

    // Errors are per request; the connection stays usable.
    assert!(conn.is_open());
    assert_eq!(conn.ping(b"still here").await.unwrap(), b"still here");

    server.stop().await;
}

#[tokio::test]
async fn all_servers_down_is_reported() {
    let client = common::tcp_client();
    let spki = common::ed25519_spki([9; 32]);
    let key = client.register_public_key(&common::unreachable_addr().await, &spki).unwrap();
    client.register_public_key(&common::unreachable_addr().await, &spki).unwrap();

    let result = key.sign(Op::Ed25519Sign, &[0; 32]).await;
    assert!(matches!(result, Err(ClientError::NoReachableServer { attempted: 2, .. })));
    assert_eq!(client.servers_for(&key.ski()).len(), 2);
}

#[tokio::test]
async fn shutdown_closes_client_connections() {
    let server = common::start_keyserver(ServerConfig::default(), Arc::new(MemoryKeystore::new())).await;
    let client = common::tcp_client();
    let conn = client.dial(&server.addr.to_string()).await.unwrap();
    assert_eq!(conn.ping(b"x").await.unwrap(), b"x");

    let tracker = server.tracker.clone();
    server.stop().await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while conn.is_open() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tracker.wait_for_drain().await;
    assert_eq!(tracker.active_count(), 0);
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let mut config = ServerConfig::default();
    config.timeouts.idle_secs = 1;
    let server = common::start_keyserver(config, Arc::new(MemoryKeystore::new())).await;
    let client = common::tcp_client();
    let conn = client.dial(&server.addr.to_string()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), async {
        while conn.is_open() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // The next dial replaces the closed connection.
    let fresh = client.dial(&server.addr.to_string()).await.unwrap();
    assert!(!Arc::ptr_eq(&conn, &fresh));
    assert_eq!(fresh.ping(b"again").await.unwrap(), b"again");

    server.stop().await;
}
