//! Delimiter-framed TCP connection.
//!
//! A `Connection` is split into a `FrameReader`, owned by the single task
//! that consumes frames, and a cloneable `FrameWriter` that any task may use
//! to send (pushes, keep-alives, replies). Both halves share one liveness
//! flag that flips to `false` on EOF, on a write error or on `close()`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::TransportError;

/// Upper bound for one buffered frame.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// An established TCP connection, not yet split.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    /// Connect to `host:port`, giving up after `timeout`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                addr: format!("{host}:{port}"),
            })??;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let connected = Arc::new(AtomicBool::new(true));
        let (read, write) = self.stream.into_split();
        let reader = FrameReader {
            half: read,
            buf: BytesMut::with_capacity(READ_CHUNK),
            connected: connected.clone(),
            peer: self.peer,
        };
        let writer = FrameWriter {
            half: Arc::new(Mutex::new(Some(write))),
            connected,
            peer: self.peer,
        };
        (reader, writer)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
    connected: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl FrameReader {
    /// Read until `delimiter` matches and return everything up to and
    /// including the match.
    ///
    /// Cancel-safe: bytes already received stay buffered, so dropping this
    /// future (e.g. in a `select!` or `timeout`) loses nothing.
    pub async fn read_frame(&mut self, delimiter: &Regex) -> Result<Bytes, TransportError> {
        loop {
            if let Some(frame) = self.take_frame(delimiter) {
                return Ok(frame);
            }
            if !self.connected.load(Ordering::Acquire) {
                return Err(TransportError::Disconnected);
            }
            if self.buf.len() > MAX_FRAME_SIZE {
                return Err(TransportError::FrameTooLarge { limit: MAX_FRAME_SIZE });
            }

            self.buf.reserve(READ_CHUNK);
            let n = self.half.read_buf(&mut self.buf).await?;
            if n == 0 {
                debug!(peer = %self.peer, buffered = self.buf.len(), "Peer closed the stream");
                self.connected.store(false, Ordering::Release);
                return Err(TransportError::Disconnected);
            }
        }
    }

    /// Wait up to `wait` for a complete frame. `Ok(None)` means nothing
    /// arrived in time; the caller decides whether to keep polling.
    pub async fn poll_frame(
        &mut self,
        delimiter: &Regex,
        wait: Duration,
    ) -> Result<Option<Bytes>, TransportError> {
        match tokio::time::timeout(wait, self.read_frame(delimiter)).await {
            Ok(frame) => frame.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Split off one complete frame if the buffer already holds one.
    pub fn take_frame(&mut self, delimiter: &Regex) -> Option<Bytes> {
        let end = delimiter.find(&self.buf)?.end();
        Some(self.buf.split_to(end).freeze())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct FrameWriter {
    half: Arc<Mutex<Option<OwnedWriteHalf>>>,
    connected: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl FrameWriter {
    /// Write one encoded document. Concurrent writers are serialised so
    /// documents never interleave on the wire.
    pub async fn write_all(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.half.lock().await;
        let half = guard.as_mut().ok_or(TransportError::Disconnected)?;

        let result = async {
            half.write_all(bytes).await?;
            half.flush().await
        }
        .await;

        if let Err(e) = result {
            self.connected.store(false, Ordering::Release);
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Shut down the write side and mark the connection dead. Idempotent.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Some(mut half) = self.half.lock().await.take() {
            let _ = half.shutdown().await;
            debug!(peer = %self.peer, "Connection closed");
        }
    }
}
