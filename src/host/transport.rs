//! TCP transport with a per-connection deadline
//!
//! Single responsibility: move frames over a socket before a deadline.
//! Knows the framing, not the meaning of messages.

use super::protocol::{self, SectorHeader, FRAME_HEADER_LEN, SECTOR_HEADER_LEN};
use crate::error::{RenterError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

/// A connected socket. Every read and write must finish before `deadline`.
pub struct Transport {
    stream: TcpStream,
    peer: String,
    deadline: Instant,
}

impl Transport {
    /// Dial `address`, then allow `idle` until the first deadline.
    pub async fn connect(address: &str, dial_timeout: Duration, idle: Duration) -> Result<Self> {
        debug!(address = %address, "Dialing host");
        let stream = match timeout(dial_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RenterError::Connection(format!(
                    "connect to {} failed: {}",
                    address, e
                )))
            }
            Err(_) => {
                return Err(RenterError::Connection(format!(
                    "connect to {} timed out",
                    address
                )))
            }
        };
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            peer: address.to_string(),
            deadline: Instant::now() + idle,
        })
    }

    pub fn set_deadline(&mut self, from_now: Duration) {
        self.deadline = Instant::now() + from_now;
    }

    #[cfg(test)]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let frame = protocol::encode_frame(message)?;
        self.write_all(&frame).await
    }

    pub async fn recv<T: DeserializeOwned>(&mut self, max_len: usize) -> Result<T> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.read_exact(&mut header).await?;
        let len = protocol::frame_len(header, max_len)?;
        let mut body = vec![0u8; len];
        self.read_exact(&mut body).await?;
        protocol::decode_body(&body)
    }

    /// Read a sector frame into `buf`, returning the payload length.
    pub async fn recv_sector(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut header = [0u8; SECTOR_HEADER_LEN];
        self.read_exact(&mut header).await?;
        let payload = SectorHeader::parse(&header).validate()?;
        let target = buf.get_mut(..payload).ok_or_else(|| {
            RenterError::Protocol(format!("sector payload of {} bytes overflows buffer", payload))
        })?;
        self.read_exact(target).await?;
        Ok(payload)
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match timeout_at(self.deadline, self.stream.write_all(bytes)).await {
            Ok(result) => result.map_err(|e| classify(e, &self.peer)),
            Err(_) => Err(self.deadline_exceeded("writing")),
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match timeout_at(self.deadline, self.stream.read_exact(buf)).await {
            Ok(result) => result.map(|_| ()).map_err(|e| classify(e, &self.peer)),
            Err(_) => Err(self.deadline_exceeded("reading")),
        }
    }

    fn deadline_exceeded(&self, during: &str) -> RenterError {
        RenterError::Connection(format!("deadline exceeded {} {}", during, self.peer))
    }

    /// Close the write half; errors are irrelevant at this point.
    pub async fn shutdown(&mut self) {
        let _ = timeout_at(self.deadline, self.stream.shutdown()).await;
    }
}

/// Map socket errors: peer drops become `HostDisconnected`, the rest `Connection`.
fn classify(error: io::Error, peer: &str) -> RenterError {
    match error.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::NotConnected => {
            RenterError::HostDisconnected(format!("{}: {}", peer, error))
        }
        _ => RenterError::Connection(format!("{}: {}", peer, error)),
    }
}

/// Tightens a transport's deadline for one exchange and restores the idle
/// deadline when dropped, on every exit path.
pub struct NegotiationWindow<'a> {
    transport: &'a mut Transport,
    idle: Duration,
}

impl<'a> NegotiationWindow<'a> {
    pub fn open(transport: &'a mut Transport, window: Duration, idle: Duration) -> Self {
        transport.set_deadline(window);
        Self { transport, idle }
    }
}

impl Deref for NegotiationWindow<'_> {
    type Target = Transport;

    fn deref(&self) -> &Transport {
        self.transport
    }
}

impl DerefMut for NegotiationWindow<'_> {
    fn deref_mut(&mut self) -> &mut Transport {
        self.transport
    }
}

impl Drop for NegotiationWindow<'_> {
    fn drop(&mut self) {
        self.transport.set_deadline(self.idle);
    }
}
