// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Secure conversation message and security headers.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;
use crate::protocol::encoding::{ensure, BinaryDecodable, BinaryEncodable};

/// Size of the header on HEL, ACK and ERR messages.
pub const TRANSPORT_HEADER_SIZE: usize = 8;

/// Size of the header on OPN, MSG and CLO chunks.
pub const MESSAGE_HEADER_SIZE: usize = 12;

/// Size of [`SequenceHeader`].
pub const SEQUENCE_HEADER_SIZE: usize = 8;

/// Size of [`SymmetricSecurityHeader`].
pub const SYMMETRIC_SECURITY_HEADER_SIZE: usize = 4;

// =============================================================================
// MessageType / ChunkType
// =============================================================================

/// Three-letter message type at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `HEL`
    Hello,
    /// `ACK`
    Acknowledge,
    /// `ERR`
    Error,
    /// `OPN`
    OpenSecureChannel,
    /// `MSG`
    Message,
    /// `CLO`
    CloseSecureChannel,
}

impl MessageType {
    /// Wire representation.
    pub const fn as_bytes(&self) -> &'static [u8; 3] {
        match self {
            Self::Hello => b"HEL",
            Self::Acknowledge => b"ACK",
            Self::Error => b"ERR",
            Self::OpenSecureChannel => b"OPN",
            Self::Message => b"MSG",
            Self::CloseSecureChannel => b"CLO",
        }
    }

    /// Parses the wire representation.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"HEL" => Some(Self::Hello),
            b"ACK" => Some(Self::Acknowledge),
            b"ERR" => Some(Self::Error),
            b"OPN" => Some(Self::OpenSecureChannel),
            b"MSG" => Some(Self::Message),
            b"CLO" => Some(Self::CloseSecureChannel),
            _ => None,
        }
    }

    /// Returns `true` for messages that carry a secure channel id.
    pub const fn is_secure(&self) -> bool {
        matches!(
            self,
            Self::OpenSecureChannel | Self::Message | Self::CloseSecureChannel
        )
    }

    /// Returns `true` for messages secured with the asymmetric profile.
    pub const fn is_asymmetric(&self) -> bool {
        matches!(self, Self::OpenSecureChannel)
    }

    /// Size of the header for this message type.
    pub const fn header_size(&self) -> usize {
        if self.is_secure() {
            MESSAGE_HEADER_SIZE
        } else {
            TRANSPORT_HEADER_SIZE
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hello => "HEL",
            Self::Acknowledge => "ACK",
            Self::Error => "ERR",
            Self::OpenSecureChannel => "OPN",
            Self::Message => "MSG",
            Self::CloseSecureChannel => "CLO",
        })
    }
}

/// Chunk marker following the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    /// `F`: last chunk of a message.
    Final,
    /// `C`: more chunks follow.
    Intermediate,
    /// `A`: the sender abandoned the message.
    Abort,
}

impl ChunkType {
    /// Wire representation.
    pub const fn as_byte(&self) -> u8 {
        match self {
            Self::Final => b'F',
            Self::Intermediate => b'C',
            Self::Abort => b'A',
        }
    }

    /// Parses the wire representation.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'F' => Some(Self::Final),
            b'C' => Some(Self::Intermediate),
            b'A' => Some(Self::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_byte() as char)
    }
}

// =============================================================================
// MessageHeader
// =============================================================================

/// Frame header. `secure_channel_id` is only on the wire for secure messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Message type.
    pub message_type: MessageType,
    /// Chunk type.
    pub chunk_type: ChunkType,
    /// Total frame size including this header.
    pub message_size: u32,
    /// Secure channel id (0 for transport messages and the first OPN).
    pub secure_channel_id: u32,
}

impl MessageHeader {
    /// Creates a header with a zero size, patched once the frame is complete.
    pub fn new(message_type: MessageType, chunk_type: ChunkType, secure_channel_id: u32) -> Self {
        Self {
            message_type,
            chunk_type,
            message_size: 0,
            secure_channel_id,
        }
    }

    /// Reads the declared frame size from the first 8 bytes of a frame.
    pub fn peek_size(bytes: &[u8]) -> Option<usize> {
        if bytes.len() < TRANSPORT_HEADER_SIZE {
            return None;
        }
        Some(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize)
    }

    /// Overwrites the size field of an encoded frame.
    pub fn patch_size(frame: &mut [u8], size: u32) {
        frame[4..8].copy_from_slice(&size.to_le_bytes());
    }
}

impl BinaryEncodable for MessageHeader {
    fn length_in_bytes(&self) -> usize {
        self.message_type.header_size()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(self.message_type.as_bytes());
        buf.put_u8(self.chunk_type.as_byte());
        buf.put_u32_le(self.message_size);
        if self.message_type.is_secure() {
            buf.put_u32_le(self.secure_channel_id);
        }
    }
}

impl BinaryDecodable for MessageHeader {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        ensure(buf, TRANSPORT_HEADER_SIZE, "MessageHeader")?;
        let message_type = MessageType::from_bytes(&buf[..3]).ok_or_else(|| {
            CodecError::invalid_value(
                "MessageType",
                format!("unknown message type {:?}", String::from_utf8_lossy(&buf[..3])),
            )
        })?;
        let chunk_type = ChunkType::from_byte(buf[3]).ok_or_else(|| {
            CodecError::invalid_value("ChunkType", format!("unknown chunk type 0x{:02X}", buf[3]))
        })?;
        buf.advance(4);
        let message_size = buf.get_u32_le();
        let secure_channel_id = if message_type.is_secure() {
            u32::decode(buf)?
        } else {
            0
        };
        Ok(Self {
            message_type,
            chunk_type,
            message_size,
            secure_channel_id,
        })
    }
}

// =============================================================================
// SequenceHeader
// =============================================================================

/// Per-chunk sequence number and request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceHeader {
    /// Monotonic per-channel chunk counter.
    pub sequence_number: u32,
    /// Request the chunk belongs to.
    pub request_id: u32,
}

impl BinaryEncodable for SequenceHeader {
    fn length_in_bytes(&self) -> usize {
        SEQUENCE_HEADER_SIZE
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.sequence_number);
        buf.put_u32_le(self.request_id);
    }
}

impl BinaryDecodable for SequenceHeader {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            sequence_number: u32::decode(buf)?,
            request_id: u32::decode(buf)?,
        })
    }
}

// =============================================================================
// Security headers
// =============================================================================

/// Security header on OPN chunks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AsymmetricSecurityHeader {
    /// Security policy URI.
    pub security_policy_uri: String,
    /// DER certificate of the sender, null when unsecured.
    pub sender_certificate: Option<Bytes>,
    /// SHA-1 thumbprint of the receiver certificate, null when unsecured.
    pub receiver_certificate_thumbprint: Option<Bytes>,
}

impl BinaryEncodable for AsymmetricSecurityHeader {
    fn length_in_bytes(&self) -> usize {
        self.security_policy_uri.length_in_bytes()
            + self.sender_certificate.length_in_bytes()
            + self.receiver_certificate_thumbprint.length_in_bytes()
    }

    fn encode(&self, buf: &mut BytesMut) {
        self.security_policy_uri.encode(buf);
        self.sender_certificate.encode(buf);
        self.receiver_certificate_thumbprint.encode(buf);
    }
}

impl BinaryDecodable for AsymmetricSecurityHeader {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            security_policy_uri: String::decode(buf)?,
            sender_certificate: Option::<Bytes>::decode(buf)?,
            receiver_certificate_thumbprint: Option::<Bytes>::decode(buf)?,
        })
    }
}

/// Security header on MSG and CLO chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymmetricSecurityHeader {
    /// Id of the channel security token the chunk was secured with.
    pub token_id: u32,
}

impl BinaryEncodable for SymmetricSecurityHeader {
    fn length_in_bytes(&self) -> usize {
        SYMMETRIC_SECURITY_HEADER_SIZE
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.token_id);
    }
}

impl BinaryDecodable for SymmetricSecurityHeader {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            token_id: u32::decode(buf)?,
        })
    }
}

/// Either security header, chosen by message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityHeader {
    /// OPN
    Asymmetric(AsymmetricSecurityHeader),
    /// MSG / CLO
    Symmetric(SymmetricSecurityHeader),
}

impl SecurityHeader {
    /// Decodes the header that belongs to `message_type`.
    pub fn decode_for(message_type: MessageType, buf: &mut Bytes) -> Result<Self, CodecError> {
        if message_type.is_asymmetric() {
            AsymmetricSecurityHeader::decode(buf).map(Self::Asymmetric)
        } else {
            SymmetricSecurityHeader::decode(buf).map(Self::Symmetric)
        }
    }

    /// Token id for symmetric headers.
    pub fn token_id(&self) -> Option<u32> {
        match self {
            Self::Symmetric(header) => Some(header.token_id),
            Self::Asymmetric(_) => None,
        }
    }
}

impl BinaryEncodable for SecurityHeader {
    fn length_in_bytes(&self) -> usize {
        match self {
            Self::Asymmetric(h) => h.length_in_bytes(),
            Self::Symmetric(h) => h.length_in_bytes(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Asymmetric(h) => h.encode(buf),
            Self::Symmetric(h) => h.encode(buf),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
