// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Transport negotiation: Hello, Acknowledge and Error messages.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::MIN_BUFFER_SIZE;
use crate::error::{CodecError, ConfigurationError, ConnectionError, UaError, UaResult};
use crate::protocol::encoding::{BinaryDecodable, BinaryEncodable};
use crate::protocol::header::{ChunkType, MessageHeader, MessageType, TRANSPORT_HEADER_SIZE};

/// UA TCP protocol version sent in Hello.
pub const PROTOCOL_VERSION: u32 = 0;

// =============================================================================
// ProtocolLimits
// =============================================================================

/// Buffer and message limits exchanged during Hello/Acknowledge.
///
/// For `max_message_size` and `max_chunk_count`, zero means "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolLimits {
    /// Largest chunk this side accepts.
    pub receive_buffer_size: u32,
    /// Largest chunk this side sends.
    pub send_buffer_size: u32,
    /// Largest reassembled message.
    pub max_message_size: u32,
    /// Most chunks per message.
    pub max_chunk_count: u32,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            receive_buffer_size: 8196,
            send_buffer_size: 8196,
            max_message_size: 2_097_152,
            max_chunk_count: 64,
        }
    }
}

impl ProtocolLimits {
    /// Validates the proposed limits.
    pub fn validate(&self) -> UaResult<()> {
        for (field, value) in [
            ("receive_buffer_size", self.receive_buffer_size),
            ("send_buffer_size", self.send_buffer_size),
        ] {
            if value < MIN_BUFFER_SIZE {
                return Err(ConfigurationError::invalid_limit(
                    field,
                    u64::from(value),
                    format!("must be at least {} bytes", MIN_BUFFER_SIZE),
                )
                .into());
            }
        }
        if self.max_message_size != 0 && self.max_message_size < self.receive_buffer_size {
            return Err(ConfigurationError::invalid_limit(
                "max_message_size",
                u64::from(self.max_message_size),
                "must not be smaller than the receive buffer",
            )
            .into());
        }
        Ok(())
    }

    /// Combines our proposal with the server's Acknowledge.
    ///
    /// Our receive buffer is capped by what the server sends and our send
    /// buffer by what the server receives.
    pub fn merge(&self, server: &ProtocolLimits) -> ProtocolLimits {
        ProtocolLimits {
            receive_buffer_size: self.receive_buffer_size.min(server.send_buffer_size),
            send_buffer_size: self.send_buffer_size.min(server.receive_buffer_size),
            max_message_size: min_nonzero(self.max_message_size, server.max_message_size),
            max_chunk_count: min_nonzero(self.max_chunk_count, server.max_chunk_count),
        }
    }
}

fn min_nonzero(a: u32, b: u32) -> u32 {
    match (a, b) {
        (0, other) | (other, 0) => other,
        (a, b) => a.min(b),
    }
}

// =============================================================================
// Messages
// =============================================================================

/// `HEL` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// Protocol version.
    pub protocol_version: u32,
    /// Proposed limits.
    pub limits: ProtocolLimits,
    /// Endpoint the client wants to reach.
    pub endpoint_url: String,
}

impl Hello {
    /// Creates a Hello for `endpoint_url`.
    pub fn new(endpoint_url: impl Into<String>, limits: ProtocolLimits) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            limits,
            endpoint_url: endpoint_url.into(),
        }
    }

    /// Encodes the complete `HEL` frame.
    pub fn encode_frame(&self) -> Bytes {
        encode_frame(MessageType::Hello, self)
    }
}

impl BinaryEncodable for Hello {
    fn length_in_bytes(&self) -> usize {
        20 + self.endpoint_url.length_in_bytes()
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.protocol_version.encode(buf);
        encode_limits(&self.limits, buf);
        self.endpoint_url.encode(buf);
    }
}

impl BinaryDecodable for Hello {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            protocol_version: u32::decode(buf)?,
            limits: decode_limits(buf)?,
            endpoint_url: String::decode(buf)?,
        })
    }
}

/// `ACK` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge {
    /// Protocol version.
    pub protocol_version: u32,
    /// Server limits.
    pub limits: ProtocolLimits,
}

impl Acknowledge {
    /// Encodes the complete `ACK` frame.
    pub fn encode_frame(&self) -> Bytes {
        encode_frame(MessageType::Acknowledge, self)
    }
}

impl BinaryEncodable for Acknowledge {
    fn length_in_bytes(&self) -> usize {
        20
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.protocol_version.encode(buf);
        encode_limits(&self.limits, buf);
    }
}

impl BinaryDecodable for Acknowledge {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            protocol_version: u32::decode(buf)?,
            limits: decode_limits(buf)?,
        })
    }
}

/// `ERR` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Status code.
    pub error: u32,
    /// Server supplied reason.
    pub reason: Option<String>,
}

impl ErrorMessage {
    /// Encodes the complete `ERR` frame.
    pub fn encode_frame(&self) -> Bytes {
        encode_frame(MessageType::Error, self)
    }

    /// Converts into a connection error.
    pub fn into_error(self) -> UaError {
        let reason = self.reason.unwrap_or_else(|| {
            crate::error::status_code_name(self.error)
                .unwrap_or("Unknown")
                .to_string()
        });
        ConnectionError::server_error(self.error, reason).into()
    }
}

impl BinaryEncodable for ErrorMessage {
    fn length_in_bytes(&self) -> usize {
        4 + self.reason.length_in_bytes()
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.error.encode(buf);
        self.reason.encode(buf);
    }
}

impl BinaryDecodable for ErrorMessage {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            error: u32::decode(buf)?,
            reason: Option::<String>::decode(buf)?,
        })
    }
}

/// Reply to a Hello.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloReply {
    /// Server accepted the connection.
    Acknowledge(Acknowledge),
    /// Server rejected the connection.
    Error(ErrorMessage),
}

impl HelloReply {
    /// Parses a complete `ACK` or `ERR` frame.
    pub fn decode_frame(frame: Bytes) -> UaResult<Self> {
        let mut buf = frame;
        let header = MessageHeader::decode(&mut buf)?;
        match header.message_type {
            MessageType::Acknowledge => Ok(Self::Acknowledge(Acknowledge::decode(&mut buf)?)),
            MessageType::Error => Ok(Self::Error(ErrorMessage::decode(&mut buf)?)),
            other => Err(ConnectionError::unexpected_message("ACK", other.to_string()).into()),
        }
    }
}

fn encode_limits(limits: &ProtocolLimits, buf: &mut BytesMut) {
    limits.receive_buffer_size.encode(buf);
    limits.send_buffer_size.encode(buf);
    limits.max_message_size.encode(buf);
    limits.max_chunk_count.encode(buf);
}

fn decode_limits(buf: &mut Bytes) -> Result<ProtocolLimits, CodecError> {
    Ok(ProtocolLimits {
        receive_buffer_size: u32::decode(buf)?,
        send_buffer_size: u32::decode(buf)?,
        max_message_size: u32::decode(buf)?,
        max_chunk_count: u32::decode(buf)?,
    })
}

fn encode_frame<T: BinaryEncodable>(message_type: MessageType, body: &T) -> Bytes {
    let size = TRANSPORT_HEADER_SIZE + body.length_in_bytes();
    let mut header = MessageHeader::new(message_type, ChunkType::Final, 0);
    header.message_size = size as u32;

    let mut buf = BytesMut::with_capacity(size);
    header.encode(&mut buf);
    body.encode(&mut buf);
    buf.freeze()
}

// =============================================================================
// Tests
// =============================================================================
