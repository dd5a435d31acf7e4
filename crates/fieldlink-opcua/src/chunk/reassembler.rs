// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Reassembly of chunk bodies into complete messages.

use bytes::{Bytes, BytesMut};

use crate::error::{CodecError, UaResult};
use crate::protocol::header::ChunkType;

/// Outcome of feeding one chunk to a [`ChunkAccumulator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More chunks are expected.
    Pending,
    /// The message is complete.
    Complete(Bytes),
    /// The sender aborted the message; accumulated data was discarded.
    Aborted(Bytes),
}

/// Collects chunk bodies for one request until the final chunk arrives.
#[derive(Debug, Default)]
pub struct ChunkAccumulator {
    buffer: BytesMut,
    chunks: usize,
    max_message_size: usize,
    max_chunk_count: usize,
}

impl ChunkAccumulator {
    /// Creates an accumulator; zero limits mean unlimited.
    pub fn new(max_message_size: usize, max_chunk_count: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            chunks: 0,
            max_message_size,
            max_chunk_count,
        }
    }

    /// Appends a body without completing.
    pub fn append(&mut self, body: &[u8]) -> UaResult<()> {
        let size = self.buffer.len() + body.len();
        if self.max_message_size > 0 && size > self.max_message_size {
            self.reset();
            return Err(CodecError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            }
            .into());
        }
        if self.max_chunk_count > 0 && self.chunks + 1 > self.max_chunk_count {
            let count = self.chunks + 1;
            self.reset();
            return Err(CodecError::TooManyChunks {
                count,
                limit: self.max_chunk_count,
            }
            .into());
        }
        self.buffer.extend_from_slice(body);
        self.chunks += 1;
        Ok(())
    }

    /// Returns the accumulated message and resets.
    pub fn take(&mut self) -> Bytes {
        self.chunks = 0;
        self.buffer.split().freeze()
    }

    /// Discards everything accumulated.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.chunks = 0;
    }

    /// Feeds one chunk according to its type.
    ///
    /// An aborted chunk's body carries the error status and reason and is
    /// handed back untouched.
    pub fn push(&mut self, chunk_type: ChunkType, body: &[u8]) -> UaResult<Reassembly> {
        match chunk_type {
            ChunkType::Intermediate => {
                self.append(body)?;
                Ok(Reassembly::Pending)
            }
            ChunkType::Final => {
                self.append(body)?;
                Ok(Reassembly::Complete(self.take()))
            }
            ChunkType::Abort => {
                self.reset();
                Ok(Reassembly::Aborted(Bytes::copy_from_slice(body)))
            }
        }
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `true` when nothing is accumulated.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Chunks accumulated so far.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }
}
