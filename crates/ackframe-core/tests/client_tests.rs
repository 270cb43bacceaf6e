//! Client behavior against real servers and raw peers.

use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;

use ackframe_core::testing::{
    test_client, wait_until, within, HarnessBuilder, RawPeer, Recording, RecordingHooks,
    ServerHarness,
};
use ackframe_core::{ConnectionState, ControlCode, NetworkError, ProtocolError};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_client_message_reaches_server() {
    let harness = ServerHarness::new().await;
    let mut client = harness.client();

    let id = client.connect_to("127.0.0.1", harness.port()).await.unwrap();
    let conn = client.connection(&id).unwrap();
    within(WAIT, conn.wait_established()).await.unwrap();

    conn.transmit("ping").await.unwrap();
    assert!(wait_until(WAIT, || harness.recording.message_count() == 1).await);
    assert_eq!(harness.recording.messages()[0], Bytes::from_static(b"ping"));

    client.shutdown().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn test_transmit_straight_after_connect() {
    let harness = ServerHarness::new().await;
    let mut client = harness.client();

    let id = client.connect_to("127.0.0.1", harness.port()).await.unwrap();
    let conn = client.connection(&id).unwrap();
    within(WAIT, conn.transmit("first")).await.unwrap();

    assert!(wait_until(WAIT, || harness.recording.message_count() == 1).await);
    assert_eq!(harness.recording.messages()[0], Bytes::from_static(b"first"));
    assert!(!conn.is_shutdown());
    assert_eq!(conn.state(), ConnectionState::Running);

    client.shutdown().await;
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transmit_straight_after_connect_under_load() {
    const ROUNDS: usize = 30;

    let harness = ServerHarness::new().await;
    let mut client = harness.client();

    for round in 0..ROUNDS {
        let id = client.connect_to("127.0.0.1", harness.port()).await.unwrap();
        let conn = client.connection(&id).unwrap();
        within(WAIT, conn.transmit(format!("round {round}"))).await.unwrap();
        assert!(!conn.is_shutdown(), "round {round} shut the connection down");
    }

    assert!(wait_until(WAIT, || harness.recording.message_count() == ROUNDS).await);
    let mut messages: Vec<String> = harness
        .recording
        .messages()
        .iter()
        .map(|m| String::from_utf8(m.to_vec()).unwrap())
        .collect();
    messages.sort();
    let mut expected: Vec<String> = (0..ROUNDS).map(|r| format!("round {r}")).collect();
    expected.sort();
    assert_eq!(messages, expected);
    assert_eq!(harness.handle.connection_count(), ROUNDS);

    client.shutdown().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn test_echo_round_trip() {
    let harness = HarnessBuilder::new().echo().build().await;
    let replies = Recording::new();

    let mut client = harness.client();
    client.set_connection_handler(replies.factory());
    let id = client.connect_to("localhost", harness.port()).await.unwrap();
    let conn = client.connection(&id).unwrap();
    within(WAIT, conn.wait_established()).await.unwrap();

    conn.transmit("marco").await.unwrap();
    assert!(wait_until(WAIT, || replies.message_count() == 1).await);
    assert_eq!(replies.messages()[0], Bytes::from_static(b"marco"));

    client.shutdown().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn test_full_server_rejects_client_handshake() {
    let harness = HarnessBuilder::new().connection_limit(1).build().await;

    let mut first = harness.client();
    let first_id = first.connect_to("127.0.0.1", harness.port()).await.unwrap();
    within(WAIT, first.connection(&first_id).unwrap().wait_established())
        .await
        .unwrap();
    assert!(wait_until(WAIT, || harness.handle.connection_count() == 1).await);

    let mut second = harness.client();
    let second_id = second.connect_to("127.0.0.1", harness.port()).await.unwrap();
    let conn = second.connection(&second_id).unwrap();

    let err = within(WAIT, conn.wait_established()).await.unwrap_err();
    match err {
        NetworkError::Protocol(e) => {
            assert_eq!(e, ProtocolError::HandshakeRejected(ControlCode::ConnLimit));
        }
        // The server may close before the rejection byte is read back.
        NetworkError::Closed => {}
        other => panic!("unexpected error: {other}"),
    }
    assert!(wait_until(WAIT, || conn.state() == ConnectionState::Closed).await);
    assert!(matches!(conn.transmit("too late").await, Err(NetworkError::Closed)));
    assert_eq!(harness.handle.connection_count(), 1);

    first.shutdown().await;
    second.shutdown().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn test_client_transmit_to_raw_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut client = test_client();
    let id = client.connect_to("127.0.0.1", port).await.unwrap();
    let mut peer = within(WAIT, RawPeer::accept(&listener)).await.unwrap();

    assert_eq!(
        within(WAIT, peer.handshake()).await.unwrap(),
        ControlCode::Ok.as_byte()
    );
    let conn = client.connection(&id).unwrap();
    within(WAIT, conn.wait_established()).await.unwrap();

    let sender = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.transmit(vec![7u8; 300]).await })
    };
    assert_eq!(within(WAIT, peer.read_header()).await.unwrap(), 300);
    peer.write_byte(ControlCode::Ok.as_byte()).await.unwrap();
    assert_eq!(within(WAIT, peer.read_exact(300)).await.unwrap(), vec![7u8; 300]);
    sender.await.unwrap().unwrap();

    client.shutdown().await;
}

#[tokio::test]
async fn test_lifecycle_hooks_fire_on_client() {
    let harness = ServerHarness::new().await;
    let hooks = RecordingHooks::new();

    let mut client = harness.client();
    client.set_lifecycle_hooks(hooks.clone());
    let a = client.connect_to("127.0.0.1", harness.port()).await.unwrap();
    let b = client.connect_to("127.0.0.1", harness.port()).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(hooks.inits().len(), 2);
    assert_eq!(client.connection_count(), 2);

    client.shutdown().await;
    assert_eq!(client.connection_count(), 0);
    let mut shut = hooks.shutdowns();
    shut.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(shut, expected);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_reap_after_server_goes_away() {
    let harness = ServerHarness::new().await;
    let mut client = harness.client();
    let id = client.connect_to("127.0.0.1", harness.port()).await.unwrap();
    let conn = client.connection(&id).unwrap();
    within(WAIT, conn.wait_established()).await.unwrap();

    harness.shutdown().await;

    assert!(wait_until(WAIT, || conn.state() == ConnectionState::Closed).await);
    assert!(conn.is_shutdown());
    assert!(matches!(conn.transmit("late").await, Err(NetworkError::Closed)));

    // The task may still be unwinding right after the state flips.
    assert!(wait_until(WAIT, || client.reap() == 1 || client.connection_count() == 0).await);
    assert!(client.connection(&id).is_none());
}

#[tokio::test]
async fn test_dropping_client_signals_connections() {
    let harness = ServerHarness::new().await;
    let mut client = harness.client();
    let id = client.connect_to("127.0.0.1", harness.port()).await.unwrap();
    let conn = client.connection(&id).unwrap();
    within(WAIT, conn.wait_established()).await.unwrap();

    drop(client);

    assert!(wait_until(WAIT, || conn.state() == ConnectionState::Closed).await);
    assert!(wait_until(WAIT, || harness.handle.connection_count() == 0).await);

    harness.shutdown().await;
}
