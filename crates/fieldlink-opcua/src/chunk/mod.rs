// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Message chunking.
//!
//! - [`ChunkProfile`]: block sizes and body capacity for one direction
//! - [`ChunkCodec`]: pad, sign and encrypt on send; decrypt, check and strip on receive
//! - [`ChunkAccumulator`]: joins chunk bodies into a message

pub mod codec;
pub mod profile;
pub mod reassembler;

pub use codec::{ChunkCodec, ChunkKeys, DecodeFailure, DecodedChunk, EncodeLimits};
pub use profile::ChunkProfile;
pub use reassembler::{ChunkAccumulator, Reassembly};
