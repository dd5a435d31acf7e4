// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Frame transport abstraction.
//!
//! A [`Transport`] moves complete UA TCP frames. [`StreamTransport`] frames
//! any `AsyncRead + AsyncWrite` stream by the size field of the 8-byte
//! header, so tests can run the full stack over `tokio::io::duplex`.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{CodecError, ConnectionError, TimeoutError, UaError, UaResult};
use crate::protocol::header::{MessageHeader, TRANSPORT_HEADER_SIZE};

/// Frames larger than this are rejected before allocation.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// =============================================================================
// TransportState
// =============================================================================

/// Connection state of the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    /// Transport is not connected.
    #[default]
    Disconnected,

    /// Transport is connected and ready.
    Connected,

    /// Transport was closed locally or by the peer.
    Closed,
}

impl TransportState {
    /// Returns `true` if the transport is connected.
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connected => 1,
            Self::Closed => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connected => write!(f, "Connected"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Moves complete frames to and from the server.
///
/// `receive` is only ever called by one task at a time; `send` may be called
/// concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes one complete frame.
    async fn send(&self, frame: Bytes) -> UaResult<()>;

    /// Reads one complete frame. `Ok(None)` on a clean end of stream.
    async fn receive(&self) -> UaResult<Option<Bytes>>;

    /// Closes the write side and marks the transport closed.
    async fn close(&self) -> UaResult<()>;

    /// Current state.
    fn state(&self) -> TransportState;

    /// Sends `frame` and waits for the next frame, bounded by `timeout`.
    ///
    /// Only valid before a reader task owns the receive side.
    async fn send_and_expect_response(&self, frame: Bytes, timeout: Duration) -> UaResult<Bytes> {
        self.send(frame).await?;
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(ConnectionError::closed(Some("peer closed during exchange".into())).into()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TimeoutError::negotiation("exchange", timeout).into()),
        }
    }
}

// =============================================================================
// TransportStats
// =============================================================================

/// Frame and byte counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TransportStats {
    fn record_send(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_receive(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Frames written.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames read.
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Bytes written.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes read.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

// =============================================================================
// StreamTransport
// =============================================================================

/// Frames a byte stream.
pub struct StreamTransport<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    state: AtomicU8,
    max_frame_size: usize,
    stats: TransportStats,
}

/// TCP transport.
pub type TcpTransport = StreamTransport<TcpStream>;

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps a connected stream.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            state: AtomicU8::new(TransportState::Connected.as_u8()),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stats: TransportStats::default(),
        }
    }

    /// Caps the size of received frames.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Frame and byte counters.
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    fn set_state(&self, state: TransportState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

impl TcpTransport {
    /// Opens a TCP connection to `host:port`.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> UaResult<Self> {
        let endpoint = format!("{}:{}", host, port);
        debug!(endpoint = %endpoint, "Opening TCP connection");

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ConnectionError::timed_out(&endpoint, timeout))?
            .map_err(|e| ConnectionError::refused_with(&endpoint, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ConnectionError::io("set TCP_NODELAY", e))?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(&self, frame: Bytes) -> UaResult<()> {
        if !self.state().is_connected() {
            return Err(UaError::not_connected());
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await.map_err(|e| {
            self.set_state(TransportState::Closed);
            UaError::from(ConnectionError::from(e))
        })?;
        writer.flush().await.map_err(ConnectionError::from)?;
        self.stats.record_send(frame.len());
        trace!(bytes = frame.len(), "Frame sent");
        Ok(())
    }

    async fn receive(&self) -> UaResult<Option<Bytes>> {
        let mut reader = self.reader.lock().await;

        let mut header = [0u8; TRANSPORT_HEADER_SIZE];
        let mut filled = 0;
        while filled < header.len() {
            let n = reader
                .read(&mut header[filled..])
                .await
                .map_err(ConnectionError::from)?;
            if n == 0 {
                self.set_state(TransportState::Closed);
                if filled == 0 {
                    return Ok(None);
                }
                return Err(ConnectionError::closed(Some("truncated frame header".into())).into());
            }
            filled += n;
        }

        let size = MessageHeader::peek_size(&header).unwrap_or(0);
        if size < TRANSPORT_HEADER_SIZE || size > self.max_frame_size {
            return Err(CodecError::MessageTooLarge {
                size,
                limit: self.max_frame_size,
            }
            .into());
        }

        let mut frame = BytesMut::zeroed(size);
        frame[..TRANSPORT_HEADER_SIZE].copy_from_slice(&header);
        reader
            .read_exact(&mut frame[TRANSPORT_HEADER_SIZE..])
            .await
            .map_err(|e| {
                self.set_state(TransportState::Closed);
                UaError::from(ConnectionError::from(e))
            })?;

        self.stats.record_receive(size);
        trace!(bytes = size, "Frame received");
        Ok(Some(frame.freeze()))
    }

    async fn close(&self) -> UaResult<()> {
        if self.state() == TransportState::Closed {
            return Ok(());
        }
        self.set_state(TransportState::Closed);
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(ConnectionError::from)?;
        Ok(())
    }

    fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }
}

impl<S> fmt::Debug for StreamTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("state", &TransportState::from_u8(self.state.load(Ordering::Relaxed)))
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
