//! Server behavior driven by byte-level peers.
//!
//! Each test starts a real server on a loopback port and talks to it with a
//! [`RawPeer`], so every byte of the handshake and exchange is checked.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use ackframe_core::testing::{
    free_port, wait_until, within, HarnessBuilder, RawPeer, SendOutcome, ServerHarness,
};
use ackframe_core::{Connection, ConnectionHandler, ConnectionState, ControlCode, Server};

const WAIT: Duration = Duration::from_secs(2);

async fn established_peer(harness: &ServerHarness) -> RawPeer {
    let mut peer = harness.raw_peer().await;
    let theirs = within(WAIT, peer.handshake()).await.unwrap();
    assert_eq!(theirs, ControlCode::Ok.as_byte());
    peer
}

#[tokio::test]
async fn test_handshake_and_message_delivery() {
    let harness = ServerHarness::new().await;
    let mut peer = established_peer(&harness).await;

    let outcome = within(WAIT, peer.send_message(b"hello")).await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);

    assert!(wait_until(WAIT, || harness.recording.message_count() == 1).await);
    assert_eq!(harness.recording.messages(), vec![Bytes::from_static(b"hello")]);
    assert_eq!(harness.recording.pre_loop_calls(), 1);
    assert!(harness.recording.loop_passes() > 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_empty_payload_is_delivered() {
    let harness = ServerHarness::new().await;
    let mut peer = established_peer(&harness).await;

    let outcome = within(WAIT, peer.send_message(b"")).await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);
    assert!(wait_until(WAIT, || harness.recording.message_count() == 1).await);
    assert!(harness.recording.messages()[0].is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_oversized_header_rejected_connection_survives() {
    let harness = ServerHarness::new().await;
    let mut peer = established_peer(&harness).await;

    peer.write_raw(&[0xF1, 0x00, 0x00, 0x00]).await.unwrap();
    let ack = within(WAIT, peer.read_byte()).await.unwrap();
    assert_eq!(ack, ControlCode::GenericError.as_byte());

    // No payload was consumed; a well-formed message still goes through.
    let outcome = within(WAIT, peer.send_message(b"after")).await.unwrap();
    assert_eq!(outcome, SendOutcome::Delivered);
    assert!(wait_until(WAIT, || harness.recording.message_count() == 1).await);
    assert_eq!(harness.recording.messages()[0], Bytes::from_static(b"after"));
    assert_eq!(harness.handle.connection_count(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_peer() {
    let harness = HarnessBuilder::new().connection_limit(1).build().await;
    let _first = established_peer(&harness).await;
    assert!(wait_until(WAIT, || harness.handle.connection_count() == 1).await);

    let mut second = harness.raw_peer().await;
    let byte = within(WAIT, second.read_byte()).await.unwrap();
    assert_eq!(byte, ControlCode::ConnLimit.as_byte());
    assert!(second.closed_within(WAIT).await);

    assert_eq!(harness.handle.connection_count(), 1);
    assert_eq!(harness.hooks.inits().len(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_slot_frees_after_peer_leaves() {
    let harness = HarnessBuilder::new().connection_limit(1).build().await;
    let first = established_peer(&harness).await;
    assert!(wait_until(WAIT, || harness.handle.connection_count() == 1).await);

    drop(first);
    assert!(wait_until(WAIT, || harness.handle.connection_count() == 0).await);

    let _again = established_peer(&harness).await;
    assert!(wait_until(WAIT, || harness.handle.connection_count() == 1).await);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_is_reaped_with_hooks() {
    let harness = ServerHarness::new().await;
    let peer = established_peer(&harness).await;
    assert!(wait_until(WAIT, || harness.hooks.inits().len() == 1).await);

    drop(peer);

    assert!(wait_until(WAIT, || harness.hooks.shutdowns().len() == 1).await);
    assert_eq!(harness.hooks.inits(), harness.hooks.shutdowns());
    assert_eq!(harness.handle.connection_count(), 0);
    assert_eq!(harness.recording.pre_loop_calls(), 1);
    assert_eq!(harness.recording.post_loop_calls(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_rejected_handshake_skips_loop_hooks() {
    let harness = ServerHarness::new().await;

    // A known non-Ok code, an unknown byte, and the generic error code.
    let replies = [ControlCode::Conflict.as_byte(), 0x42, ControlCode::GenericError.as_byte()];
    for (i, reply) in replies.into_iter().enumerate() {
        let mut peer = harness.raw_peer().await;
        let theirs = within(WAIT, peer.read_byte()).await.unwrap();
        assert_eq!(theirs, ControlCode::Ok.as_byte());
        peer.write_byte(reply).await.unwrap();

        // A well-formed message after the bad reply must never be dispatched.
        let _ = peer.write_raw(&[0x00, 0x00, 0x00, 0x04]).await;
        let _ = peer.write_raw(b"late").await;

        assert!(peer.closed_within(WAIT).await, "reply 0x{reply:02x} left the socket open");
        assert!(wait_until(WAIT, || harness.hooks.shutdowns().len() == i + 1).await);
    }

    assert_eq!(harness.recording.message_count(), 0);
    assert_eq!(harness.recording.pre_loop_calls(), 0);
    assert_eq!(harness.recording.post_loop_calls(), 0);
    assert_eq!(harness.recording.loop_passes(), 0);
    assert_eq!(harness.handle.connection_count(), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_server_transmits_to_peer() {
    let harness = ServerHarness::new().await;
    let mut peer = established_peer(&harness).await;
    assert!(wait_until(WAIT, || harness.handle.connection_count() == 1).await);

    let id = harness.handle.connection_ids().remove(0);
    let conn = harness.handle.connection(&id).unwrap();
    assert!(within(WAIT, conn.wait_established()).await.is_ok());
    assert_eq!(conn.state(), ConnectionState::Running);

    let send = tokio::spawn(async move { conn.transmit("downstream").await });
    let msg = within(WAIT, peer.recv_message()).await.unwrap();
    assert_eq!(msg, Bytes::from_static(b"downstream"));
    assert!(send.await.unwrap().is_ok());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_every_connection() {
    let harness = ServerHarness::new().await;
    let mut a = established_peer(&harness).await;
    let mut b = established_peer(&harness).await;
    assert!(wait_until(WAIT, || harness.handle.connection_count() == 2).await);

    let hooks = harness.hooks.clone();
    let recording = harness.recording.clone();
    harness.shutdown().await;

    assert!(a.closed_within(WAIT).await);
    assert!(b.closed_within(WAIT).await);
    assert_eq!(hooks.shutdowns().len(), 2);
    assert_eq!(recording.post_loop_calls(), 2);
}

#[tokio::test]
async fn test_listens_on_every_address() {
    let ports = [free_port(), free_port()];
    let mut server = Server::new();
    for port in ports {
        server.add_listen_address("127.0.0.1", port).unwrap();
    }
    let handle = server.start().await.unwrap();
    assert_eq!(handle.local_addrs().len(), 2);

    let mut peers = Vec::new();
    for addr in handle.local_addrs() {
        let mut peer = RawPeer::connect(*addr).await.unwrap();
        assert_eq!(
            within(WAIT, peer.handshake()).await.unwrap(),
            ControlCode::Ok.as_byte()
        );
        peers.push(peer);
    }
    assert!(wait_until(WAIT, || handle.connection_count() == 2).await);

    within(WAIT, handle.shutdown_and_wait()).await;
}

/// Never finishes `post_loop`, so shutdown has to abort the task.
struct StallOnExit;

#[async_trait]
impl ConnectionHandler for StallOnExit {
    async fn post_loop(&mut self, _conn: &Connection) {
        std::future::pending::<()>().await;
    }
}

#[tokio::test]
async fn test_aborted_connection_reports_closed() {
    let mut server = Server::new();
    server.add_listen_address("127.0.0.1", free_port()).unwrap();
    server.set_connection_handler(|| -> Box<dyn ConnectionHandler> { Box::new(StallOnExit) });
    server.set_shutdown_grace(Duration::from_millis(50));
    let handle = server.start().await.unwrap();

    let mut peer = RawPeer::connect(handle.local_addrs()[0]).await.unwrap();
    within(WAIT, peer.handshake()).await.unwrap();
    assert!(wait_until(WAIT, || handle.connection_count() == 1).await);
    let id = handle.connection_ids().remove(0);
    let conn = handle.connection(&id).unwrap();
    within(WAIT, conn.wait_established()).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Running);

    within(WAIT, handle.shutdown_and_wait()).await;

    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(conn.is_shutdown());
    assert!(peer.closed_within(WAIT).await);
}
