// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Per-direction chunk geometry.

use crate::config::{MessageSecurityMode, SecurityPolicy};
use crate::protocol::header::{MESSAGE_HEADER_SIZE, SEQUENCE_HEADER_SIZE, SYMMETRIC_SECURITY_HEADER_SIZE};

/// Block sizes, overheads and the resulting body capacity of one chunk.
///
/// Built once per channel state change; never recomputed per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProfile {
    /// Region after the security header is encrypted.
    pub is_encrypted: bool,
    /// A signature trails the chunk.
    pub is_signed: bool,
    /// Encoded size of the security header.
    pub security_header_size: usize,
    /// Signature length.
    pub signature_size: usize,
    /// Plaintext bytes per cipher block.
    pub plain_block_size: usize,
    /// Ciphertext bytes per cipher block.
    pub cipher_block_size: usize,
    /// Bytes taken by the padding size field(s).
    pub padding_overhead: usize,
    /// Largest chunk on the wire.
    pub max_chunk_size: usize,
    /// Largest body that fits in one chunk.
    pub max_body_size: usize,
}

impl ChunkProfile {
    fn build(
        is_encrypted: bool,
        is_signed: bool,
        security_header_size: usize,
        signature_size: usize,
        plain_block_size: usize,
        cipher_block_size: usize,
        max_chunk_size: usize,
    ) -> Self {
        let (plain_block_size, cipher_block_size) = if is_encrypted {
            (plain_block_size.max(1), cipher_block_size.max(1))
        } else {
            (1, 1)
        };
        let signature_size = if is_signed { signature_size } else { 0 };
        let padding_overhead = match (is_encrypted, cipher_block_size > 256) {
            (false, _) => 0,
            (true, false) => 1,
            (true, true) => 2,
        };

        let available = max_chunk_size.saturating_sub(MESSAGE_HEADER_SIZE + security_header_size);
        let max_body_size = (available / cipher_block_size * plain_block_size)
            .saturating_sub(SEQUENCE_HEADER_SIZE + signature_size + padding_overhead);

        Self {
            is_encrypted,
            is_signed,
            security_header_size,
            signature_size,
            plain_block_size,
            cipher_block_size,
            padding_overhead,
            max_chunk_size,
            max_body_size,
        }
    }

    /// Profile for OPN chunks.
    ///
    /// `signature_key_size` is the sender's RSA modulus length and
    /// `encryption_key_size` the receiver's. Any secured policy signs and
    /// encrypts OPN regardless of the message security mode.
    pub fn asymmetric(
        policy: SecurityPolicy,
        security_header_size: usize,
        signature_key_size: usize,
        encryption_key_size: usize,
        max_chunk_size: usize,
    ) -> Self {
        let secured = policy != SecurityPolicy::None;
        let plain_block_size = policy
            .asymmetric_padding()
            .map_or(1, |padding| encryption_key_size.saturating_sub(padding.overhead()));
        Self::build(
            secured,
            secured,
            security_header_size,
            signature_key_size,
            plain_block_size,
            encryption_key_size,
            max_chunk_size,
        )
    }

    /// Profile for MSG and CLO chunks.
    pub fn symmetric(
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        max_chunk_size: usize,
    ) -> Self {
        let secured = policy != SecurityPolicy::None;
        let block = policy.symmetric_block_size();
        Self::build(
            secured && mode.is_encrypted(),
            secured && mode.is_signed(),
            SYMMETRIC_SECURITY_HEADER_SIZE,
            policy.symmetric_signature_size(),
            block,
            block,
            max_chunk_size,
        )
    }

    /// Padding bytes (excluding the size field) needed for a body of `body_len`.
    pub fn padding_size(&self, body_len: usize) -> usize {
        if !self.is_encrypted {
            return 0;
        }
        let plain = self.plain_block_size;
        let used = SEQUENCE_HEADER_SIZE + body_len + self.signature_size + self.padding_overhead;
        (plain - used % plain) % plain
    }

    /// Wire size of a chunk carrying `body_len` bytes.
    pub fn chunk_size(&self, body_len: usize) -> usize {
        let plain_region = SEQUENCE_HEADER_SIZE
            + body_len
            + self.padding_size(body_len)
            + if self.is_encrypted { self.padding_overhead } else { 0 }
            + self.signature_size;
        let region = if self.is_encrypted {
            plain_region / self.plain_block_size * self.cipher_block_size
        } else {
            plain_region
        };
        MESSAGE_HEADER_SIZE + self.security_header_size + region
    }
}
