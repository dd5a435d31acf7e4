// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! OPC UA binary protocol: encoding primitives, frame headers, transport
//! negotiation and the handshake services.
//!
//! ```text
//! ┌──────────────────────┬──────────────────┬──────────────┬──────────┬─────────┬───────────┐
//! │ MessageHeader (12)   │ SecurityHeader   │ Sequence (8) │ Body     │ Padding │ Signature │
//! └──────────────────────┴──────────────────┴──────────────┴──────────┴─────────┴───────────┘
//! ```
//!
//! `HEL`, `ACK` and `ERR` use an 8-byte header and carry no security.

pub mod encoding;
pub mod header;
pub mod hello;
pub mod services;

pub use encoding::{BinaryDecodable, BinaryEncodable, ExtensionObject, NodeId};
pub use header::{
    AsymmetricSecurityHeader, ChunkType, MessageHeader, MessageType, SecurityHeader,
    SequenceHeader, SymmetricSecurityHeader,
};
pub use hello::{Acknowledge, ErrorMessage, Hello, HelloReply, ProtocolLimits};
pub use services::{ResponseBody, ServiceMessage, ServiceRequest, ServiceResponse};
