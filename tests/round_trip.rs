//! End-to-end streams between clients through a relay.

use dmsg_core::{Addr, ClientConfig, StreamState};
use dmsg_crypto::PublicKey;
use dmsg_discovery::DiscoveryClient;
use dmsg_integration_tests::{TestEnv, eventually, fast_client_config, within};
use rand::RngCore;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_hello_round_trip_then_eof() {
    let mut env = TestEnv::new(1).await;
    let x = env.client().await;
    let y = env.client().await;

    let listener = x.listen(7).unwrap();
    let mut outbound = within(y.dial(Addr::new(x.local_pk(), 7))).await.unwrap();
    let mut inbound = within(listener.accept()).await.unwrap();

    assert_eq!(outbound.remote_addr(), Addr::new(x.local_pk(), 7));
    assert_eq!(inbound.remote_addr(), outbound.local_addr());
    assert_eq!(inbound.state(), StreamState::Open);
    assert_eq!(outbound.stream_id() % 2, 0);
    assert_eq!(inbound.stream_id() % 2, 1);

    outbound.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    within(inbound.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"hello");

    outbound.close();
    let mut rest = [0u8; 1];
    assert_eq!(within(inbound.read(&mut rest)).await.unwrap(), 0);

    env.shutdown().await;
}

#[tokio::test]
async fn test_bulk_transfer_with_small_windows() {
    let mut env = TestEnv::new(1).await;
    let config = ClientConfig {
        local_window: 1024,
        ..fast_client_config()
    };
    let x = env.client_with(config.clone()).await;
    let y = env.client_with(config).await;

    let mut payload = vec![0u8; 256 * 1024];
    rand::thread_rng().fill_bytes(&mut payload);

    let listener = x.listen(9).unwrap();
    let reader = tokio::spawn(async move {
        let mut stream = listener.accept().await.unwrap();
        let mut got = Vec::new();
        stream.read_to_end(&mut got).await.unwrap();
        got
    });

    let mut stream = within(y.dial(Addr::new(x.local_pk(), 9))).await.unwrap();
    within(stream.write_all(&payload)).await.unwrap();
    stream.shutdown().await.unwrap();

    let got = within(reader).await.unwrap();
    assert_eq!(got.len(), payload.len());
    assert!(got == payload);

    env.shutdown().await;
}

#[tokio::test]
async fn test_echo_both_directions() {
    let mut env = TestEnv::new(1).await;
    let x = env.client().await;
    let y = env.client().await;

    let listener = x.listen(7).unwrap();
    let echo = tokio::spawn(async move {
        let mut stream = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        for _ in 0..3 {
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        }
    });

    let mut stream = within(y.dial(Addr::new(x.local_pk(), 7))).await.unwrap();
    for msg in [b"ping", b"pong", b"done"] {
        stream.write_all(msg).await.unwrap();
        let mut buf = [0u8; 4];
        within(stream.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, msg);
    }
    within(echo).await.unwrap();

    env.shutdown().await;
}

#[tokio::test]
async fn test_dial_through_remote_relay() {
    let mut env = TestEnv::new(2).await;
    let x = env.client().await;
    let y = env.client().await;

    // Every client keeps one session; y must reach x's relay for the dial.
    let listener = x.listen(7).unwrap();
    let mut stream = within(y.dial(Addr::new(x.local_pk(), 7))).await.unwrap();
    let mut inbound = within(listener.accept()).await.unwrap();
    stream.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    within(inbound.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"hi");

    let shared = x.sessions();
    assert!(shared.iter().all(|relay| y.sessions().contains(relay)));

    env.shutdown().await;
}

#[tokio::test]
async fn test_entry_lifecycle() {
    let mut env = TestEnv::new(1).await;
    let relay = env.servers[0].local_pk();
    let x = env.client().await;

    let entry = env.disc.entry(&x.local_pk()).await.unwrap();
    assert_eq!(entry.delegated_servers(), Some(&[relay][..]));
    eventually(|| env.servers[0].session_count() == 1).await;

    x.close().await;
    assert!(env.disc.entry(&x.local_pk()).await.is_err());
    eventually(|| env.servers[0].session_count() == 0).await;

    env.shutdown().await;
}

#[tokio::test]
async fn test_peer_shutdown_unblocks_reader() {
    let mut env = TestEnv::new(1).await;
    let x = env.client().await;
    let y = env.client().await;

    let listener = x.listen(7).unwrap();
    let mut stream = within(y.dial(Addr::new(x.local_pk(), 7))).await.unwrap();
    let _inbound = within(listener.accept()).await.unwrap();

    x.close().await;
    let mut buf = [0u8; 1];
    let read = within(stream.read(&mut buf)).await;
    assert!(matches!(read, Ok(0) | Err(_)));

    env.shutdown().await;
}

fn relay_keys(env: &TestEnv) -> Vec<PublicKey> {
    env.servers.iter().map(|s| s.local_pk()).collect()
}

#[tokio::test]
async fn test_entry_follows_session_loss() {
    let mut env = TestEnv::new(2).await;
    let x = env.client().await;

    let relays = relay_keys(&env);
    let lost = x.sessions()[0];
    let kept = relays.iter().copied().find(|r| *r != lost).unwrap();
    env.wait_for_delegated(x.local_pk(), &[lost]).await;

    let idx = relays.iter().position(|r| *r == lost).unwrap();
    env.servers[idx].close().await;
    env.wait_for_delegated(x.local_pk(), &[kept]).await;
    assert_eq!(x.sessions(), vec![kept]);

    env.shutdown().await;
}

#[tokio::test]
async fn test_min_sessions_lists_every_relay() {
    let mut env = TestEnv::new(2).await;
    let x = env
        .client_with(ClientConfig {
            min_sessions: 2,
            ..fast_client_config()
        })
        .await;

    let mut relays = relay_keys(&env);
    relays.sort();
    env.wait_for_delegated(x.local_pk(), &relays).await;
    eventually(|| x.sessions() == relays).await;

    env.shutdown().await;
}

#[tokio::test]
async fn test_new_session_joins_entry() {
    let mut env = TestEnv::new(2).await;
    let x = env.client().await;

    let first = x.sessions()[0];
    let other = relay_keys(&env).into_iter().find(|r| *r != first).unwrap();
    env.wait_for_delegated(x.local_pk(), &[first]).await;

    within(x.ensure_session(other)).await.unwrap();
    env.wait_for_delegated(x.local_pk(), &[first, other]).await;

    env.shutdown().await;
}

#[tokio::test]
async fn test_stream_introspection() {
    let mut env = TestEnv::new(1).await;
    let relay = env.servers[0].local_pk();
    let x = env.client().await;
    let y = env.client().await;
    assert!(y.all_streams().is_empty());

    let listener = x.listen(7).unwrap();
    let outbound = within(y.dial(Addr::new(x.local_pk(), 7))).await.unwrap();
    let inbound = within(listener.accept()).await.unwrap();
    assert_eq!(outbound.server_pk(), relay);
    assert_eq!(inbound.server_pk(), relay);

    let streams = y.all_streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].stream_id, outbound.stream_id());
    assert_eq!(streams[0].remote, outbound.remote_addr());
    assert_eq!(streams[0].server_pk, relay);

    let server = env.disc.entry(&relay).await.unwrap().server.unwrap();
    let relay_addr: SocketAddr = server.address.parse().unwrap();
    assert_eq!(y.connected_servers(), vec![relay_addr]);

    let summary = x.connections_summary();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[&y.local_pk()], vec![relay]);

    outbound.close();
    eventually(|| y.all_streams().is_empty()).await;

    env.shutdown().await;
}
