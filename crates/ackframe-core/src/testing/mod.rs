//! Test utilities for ackframe servers and clients.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`RawPeer`] - A byte-level protocol endpoint for driving real connections
//! - [`ServerHarness`] - A running server with recording handlers and hooks
//! - [`HarnessBuilder`] - Builder pattern for custom test configurations
//!
//! # Example
//!
//! ```rust,ignore
//! use ackframe_core::testing::{wait_until, ServerHarness};
//!
//! #[tokio::test]
//! async fn test_message_delivery() {
//!     let harness = ServerHarness::new().await;
//!     let mut client = harness.client();
//!     let id = client.connect_to("127.0.0.1", harness.port()).await.unwrap();
//!
//!     let conn = client.connection(&id).unwrap();
//!     conn.wait_established().await.unwrap();
//!     conn.transmit("hello").await.unwrap();
//!
//!     assert!(wait_until(Duration::from_secs(1), || harness.recording.message_count() == 1).await);
//! }
//! ```

pub mod handlers;
pub mod harness;
pub mod raw_peer;

pub use handlers::{EchoHandler, Recording, RecordingHandler, RecordingHooks};
pub use harness::{
    free_port, test_client, wait_until, within, HarnessBuilder, ServerHarness, TEST_POLL_INTERVAL,
};
pub use raw_peer::{RawPeer, SendOutcome};
