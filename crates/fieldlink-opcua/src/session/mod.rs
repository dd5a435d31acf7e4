// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Secure channel lifecycle and the session on top of it.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ─► HelloSent ─► ChannelOpening ─► ChannelOpen ─► SessionCreating ─► SessionActive
//!       ▲                                                                               │
//!       │                              (any failure)                                    ▼
//!       └──────────────────────────── Closed ◄──────────────────────────────────── Closing
//! ```
//!
//! - [`SecureChannelSession`]: handshake, request dispatch, renewal and close
//! - [`TransactionSequencer`]: sends requests in request-id order
//! - [`ResponsePipeline`]: decode, sequence check and reassembly of responses
//! - [`KeepAliveLoop`]: periodic token renewal

pub mod channel;
pub mod endpoint;
pub mod keepalive;
pub mod pipeline;
pub mod sequencer;
pub mod state;

pub use channel::SecureChannelSession;
pub use endpoint::select_endpoint;
pub use keepalive::{renewal_interval, KeepAliveLoop, Renewable};
pub use pipeline::{PipelineEvent, PipelineFailure, PipelineStage, ResponsePipeline};
pub use sequencer::TransactionSequencer;
pub use state::{ChannelState, SequenceValidator, SessionState, SessionStats};
