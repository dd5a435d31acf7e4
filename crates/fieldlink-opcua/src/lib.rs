// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # fieldlink-opcua
//!
//! Client side of OPC UA Secure Conversation over `opc.tcp`.
//!
//! This crate opens a secure channel to an OPC UA server, creates and
//! activates a session, and exchanges service requests over it:
//!
//! - **Protocol**: binary encoding, frame headers, Hello/Acknowledge, handshake services
//! - **Security**: `None`, `Basic128Rsa15` and `Basic256Sha256` policies
//! - **Chunk**: splitting, padding, signing, encryption and reassembly
//! - **Session**: channel state machine, request ordering, token renewal
//! - **Transport**: framed TCP and in-memory streams
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldlink_opcua::{ChannelConfig, SecureChannelSession};
//!
//! let config = ChannelConfig::builder()
//!     .endpoint("opc.tcp://plc-01:4840")
//!     .build()?;
//! let session = SecureChannelSession::from_config(config).await?;
//! session.connect().await?;
//!
//! let response = session.submit(type_id, body).await?;
//!
//! session.disconnect().await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod chunk;
pub mod config;
pub mod error;
pub mod protocol;
pub mod security;
pub mod session;
pub mod transport;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use config::{
    ChannelConfig, ChannelConfigBuilder, MessageSecurityMode, RequestHandlePolicy,
    SecurityPolicy, UserIdentity,
};
pub use error::{
    CodecError, ConfigurationError, ConnectionError, SecurityError, SequenceError, SessionError,
    TimeoutError, TransactionError, UaError, UaErrorContext, UaResult,
};
pub use protocol::{ProtocolLimits, ResponseBody};
pub use security::{
    Certificate, CertificateProvider, FileCertificateProvider, MemoryCertificateProvider,
    PrivateKey,
};
pub use session::{SecureChannelSession, SessionState, SessionStats};
pub use transport::{StreamTransport, TcpTransport, Transport};
