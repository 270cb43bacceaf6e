//! Byte-level protocol peer for integration testing.
//!
//! A `RawPeer` speaks the wire protocol step by step over a plain
//! [`TcpStream`], so tests can drive a real connection through conforming
//! and non-conforming exchanges.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::wire::{encode_size, ControlCode, HEADER_SIZE};

/// Outcome of sending a message as a raw peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Header acknowledged and payload written.
    Delivered,
    /// Peer answered the header with another control byte.
    Refused(u8),
}

/// A hand-driven protocol endpoint.
pub struct RawPeer {
    stream: TcpStream,
}

impl RawPeer {
    /// Connect to a listening address.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Accept one inbound connection on `listener`.
    pub async fn accept(listener: &TcpListener) -> io::Result<Self> {
        let (stream, _) = listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Read the peer's handshake byte, then answer with `Ok`.
    pub async fn handshake(&mut self) -> io::Result<u8> {
        let theirs = self.read_byte().await?;
        self.write_byte(ControlCode::Ok.as_byte()).await?;
        Ok(theirs)
    }

    pub async fn read_byte(&mut self) -> io::Result<u8> {
        self.stream.read_u8().await
    }

    pub async fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.stream.write_all(&[byte]).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    pub async fn read_exact(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Read a 4-byte length header.
    pub async fn read_header(&mut self) -> io::Result<u32> {
        let mut header = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header).await?;
        Ok(u32::from_be_bytes(header))
    }

    /// Perform a full sending exchange.
    pub async fn send_message(&mut self, payload: &[u8]) -> io::Result<SendOutcome> {
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;
        let header = encode_size(len)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        self.stream.write_all(&header).await?;

        let ack = self.read_byte().await?;
        if ack != ControlCode::Ok.as_byte() {
            return Ok(SendOutcome::Refused(ack));
        }
        self.stream.write_all(payload).await?;
        Ok(SendOutcome::Delivered)
    }

    /// Perform a full receiving exchange, acknowledging the header.
    pub async fn recv_message(&mut self) -> io::Result<Bytes> {
        let len = self.read_header().await?;
        self.write_byte(ControlCode::Ok.as_byte()).await?;
        let payload = self.read_exact(len as usize).await?;
        Ok(payload.into())
    }

    /// Whether the remote side closes the socket within `wait`.
    ///
    /// Any bytes still in flight are discarded.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let drain = async {
            let mut buf = [0u8; 256];
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        };
        tokio::time::timeout(wait, drain).await.is_ok()
    }

    /// Take back the underlying stream.
    #[must_use]
    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}
