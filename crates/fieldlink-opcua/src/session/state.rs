// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Session lifecycle state, the channel snapshot and receive-side sequence
//! checking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkProfile;
use crate::config::{MessageSecurityMode, SecurityPolicy};
use crate::error::{SecurityError, SequenceError};
use crate::protocol::encoding::NodeId;
use crate::protocol::hello::ProtocolLimits;
use crate::protocol::services::ChannelSecurityToken;
use crate::security::certificate::Certificate;
use crate::security::keys::{ChannelKeys, SymmetricKeys};

// =============================================================================
// SessionState
// =============================================================================

/// State of a secure channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No transport.
    #[default]
    Disconnected,

    /// Hello sent, waiting for Acknowledge.
    HelloSent,

    /// OpenSecureChannel in flight.
    ChannelOpening,

    /// Secure channel is open, no session yet.
    ChannelOpen,

    /// CreateSession / ActivateSession in flight.
    SessionCreating,

    /// Session is active and ready for service calls.
    SessionActive,

    /// Close in progress.
    Closing,

    /// Channel is closed; a new `connect` starts over.
    Closed,
}

impl SessionState {
    /// Returns `true` if service calls may be submitted.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::SessionActive)
    }

    /// Returns `true` if the secure channel carries traffic.
    #[inline]
    pub fn is_channel_open(&self) -> bool {
        matches!(self, Self::ChannelOpen | Self::SessionCreating | Self::SessionActive)
    }

    /// Returns `true` while a handshake or close is running.
    #[inline]
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::HelloSent | Self::ChannelOpening | Self::SessionCreating | Self::Closing
        )
    }

    /// Returns `true` if `connect` may be called.
    #[inline]
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::HelloSent => write!(f, "HelloSent"),
            Self::ChannelOpening => write!(f, "ChannelOpening"),
            Self::ChannelOpen => write!(f, "ChannelOpen"),
            Self::SessionCreating => write!(f, "SessionCreating"),
            Self::SessionActive => write!(f, "SessionActive"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

// =============================================================================
// ChannelState
// =============================================================================

/// Receive keys of the token that was replaced by the last renewal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousToken {
    /// Token id the server may still use.
    pub token_id: u32,
    /// Keys derived for that token, `None` when unsecured.
    pub keys: Option<ChannelKeys>,
}

/// Immutable snapshot of everything the codec needs.
///
/// A new snapshot is published whole on every change; readers never observe
/// a half-updated token.
#[derive(Debug, Clone)]
pub struct ChannelState {
    /// Secure channel id assigned by the server, 0 until opened.
    pub channel_id: u32,
    /// Current security token id.
    pub token_id: u32,
    /// Lifetime revised by the server, in milliseconds.
    pub token_lifetime_ms: u32,
    /// Our application certificate.
    pub local_certificate: Option<Certificate>,
    /// The server certificate.
    pub remote_certificate: Option<Certificate>,
    /// Client nonce of the current token.
    pub local_nonce: Bytes,
    /// Server nonce of the current token.
    pub remote_nonce: Bytes,
    /// Keys of the current token.
    pub keys: Option<ChannelKeys>,
    /// Keys of the replaced token, valid until the server switches.
    pub previous: Option<PreviousToken>,
    /// Session authentication token.
    pub authentication_token: NodeId,
    /// Session id.
    pub session_id: NodeId,
    /// Server nonce from CreateSession / ActivateSession.
    pub session_nonce: Bytes,
    /// Negotiated limits.
    pub limits: ProtocolLimits,
    /// Profile for MSG and CLO chunks we send.
    pub send_profile: ChunkProfile,
    /// Profile for MSG and CLO chunks we receive.
    pub receive_profile: ChunkProfile,
}

impl ChannelState {
    /// A snapshot before any channel is open.
    pub fn new(
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        limits: ProtocolLimits,
        local_certificate: Option<Certificate>,
        remote_certificate: Option<Certificate>,
    ) -> Self {
        Self {
            channel_id: 0,
            token_id: 0,
            token_lifetime_ms: 0,
            local_certificate,
            remote_certificate,
            local_nonce: Bytes::new(),
            remote_nonce: Bytes::new(),
            keys: None,
            previous: None,
            authentication_token: NodeId::null(),
            session_id: NodeId::null(),
            session_nonce: Bytes::new(),
            limits,
            send_profile: ChunkProfile::symmetric(policy, mode, limits.send_buffer_size as usize),
            receive_profile: ChunkProfile::symmetric(
                policy,
                mode,
                limits.receive_buffer_size as usize,
            ),
        }
    }

    /// Returns `true` once OpenSecureChannel succeeded.
    pub fn is_open(&self) -> bool {
        self.channel_id != 0
    }

    /// Snapshot for a newly issued or renewed token.
    ///
    /// The replaced token's keys are kept for receiving.
    pub fn with_token(
        &self,
        token: &ChannelSecurityToken,
        local_nonce: Bytes,
        remote_nonce: Bytes,
        keys: Option<ChannelKeys>,
    ) -> Self {
        let previous = (self.token_id != 0 && self.token_id != token.token_id).then(|| PreviousToken {
            token_id: self.token_id,
            keys: self.keys.clone(),
        });
        Self {
            channel_id: token.channel_id,
            token_id: token.token_id,
            token_lifetime_ms: token.revised_lifetime,
            local_nonce,
            remote_nonce,
            keys,
            previous,
            ..self.clone()
        }
    }

    /// Snapshot after CreateSession.
    pub fn with_session(
        &self,
        session_id: NodeId,
        authentication_token: NodeId,
        session_nonce: Bytes,
        remote_certificate: Option<Certificate>,
    ) -> Self {
        Self {
            session_id,
            authentication_token,
            session_nonce,
            remote_certificate: remote_certificate.or_else(|| self.remote_certificate.clone()),
            ..self.clone()
        }
    }

    /// Snapshot with a fresh server nonce from ActivateSession.
    pub fn with_session_nonce(&self, session_nonce: Bytes) -> Self {
        Self {
            session_nonce,
            ..self.clone()
        }
    }

    /// Snapshot once the server switched to the current token.
    pub fn without_previous(&self) -> Self {
        Self {
            previous: None,
            ..self.clone()
        }
    }

    /// Server-to-client keys for a received token id.
    ///
    /// `Ok(None)` means the channel is unsecured.
    pub fn receive_keys(&self, token_id: u32) -> Result<Option<&SymmetricKeys>, SecurityError> {
        if token_id == self.token_id {
            return Ok(self.keys.as_ref().map(|keys| &keys.server));
        }
        match &self.previous {
            Some(previous) if previous.token_id == token_id => {
                Ok(previous.keys.as_ref().map(|keys| &keys.server))
            }
            _ => Err(SecurityError::UnknownToken { token_id }),
        }
    }

    /// Client-to-server keys of the current token.
    pub fn send_keys(&self) -> Option<&SymmetricKeys> {
        self.keys.as_ref().map(|keys| &keys.client)
    }
}

// =============================================================================
// SequenceValidator
// =============================================================================

/// Sequence numbers may wrap to a value below this once they pass
/// `u32::MAX - SEQUENCE_ROLLOVER_WINDOW`. The receiver accepts any such value
/// as the wrap since the sender picks it.
pub const SEQUENCE_ROLLOVER_WINDOW: u32 = 1024;

/// Checks that received sequence numbers increase by exactly one.
#[derive(Debug, Default, Clone)]
pub struct SequenceValidator {
    last: Option<u32>,
}

impl SequenceValidator {
    /// Creates a validator for a fresh channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `received` if it follows the previous number.
    ///
    /// The first number on a channel is unconstrained.
    pub fn check(&mut self, received: u32) -> Result<(), SequenceError> {
        let Some(last) = self.last else {
            self.last = Some(received);
            return Ok(());
        };

        let expected = last.wrapping_add(1);
        let rollover =
            last > u32::MAX - SEQUENCE_ROLLOVER_WINDOW && received < SEQUENCE_ROLLOVER_WINDOW;
        if received != expected && !rollover {
            return Err(SequenceError::violation(expected, received));
        }
        self.last = Some(received);
        Ok(())
    }

    /// Last accepted number.
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Forgets history, e.g. for a new channel.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

// =============================================================================
// SessionStats
// =============================================================================

/// Channel and session counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    channels_opened: AtomicU64,
    tokens_renewed: AtomicU64,
    renewal_failures: AtomicU64,
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    service_faults: AtomicU64,
    request_timeouts: AtomicU64,
}

impl SessionStats {
    /// Records an issued channel.
    pub fn record_channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a renewed token.
    pub fn record_token_renewed(&self) {
        self.tokens_renewed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed renewal.
    pub fn record_renewal_failure(&self) {
        self.renewal_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dispatched request.
    pub fn record_request(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed response.
    pub fn record_response(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a ServiceFault response.
    pub fn record_service_fault(&self) {
        self.service_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a request that timed out.
    pub fn record_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Channels opened.
    pub fn channels_opened(&self) -> u64 {
        self.channels_opened.load(Ordering::Relaxed)
    }

    /// Tokens renewed.
    pub fn tokens_renewed(&self) -> u64 {
        self.tokens_renewed.load(Ordering::Relaxed)
    }

    /// Failed renewals.
    pub fn renewal_failures(&self) -> u64 {
        self.renewal_failures.load(Ordering::Relaxed)
    }

    /// Requests dispatched.
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Responses completed.
    pub fn responses_received(&self) -> u64 {
        self.responses_received.load(Ordering::Relaxed)
    }

    /// ServiceFault responses.
    pub fn service_faults(&self) -> u64 {
        self.service_faults.load(Ordering::Relaxed)
    }

    /// Requests that timed out.
    pub fn request_timeouts(&self) -> u64 {
        self.request_timeouts.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn token(channel_id: u32, token_id: u32) -> ChannelSecurityToken {
        ChannelSecurityToken {
            channel_id,
            token_id,
            created_at: 0,
            revised_lifetime: 60_000,
        }
    }

    fn keys(byte: u8) -> ChannelKeys {
        ChannelKeys::derive(SecurityPolicy::Basic256Sha256, &[byte; 32], &[byte + 1; 32]).unwrap()
    }

    #[test]
    fn test_state_helpers() {
        assert!(SessionState::Disconnected.can_connect());
        assert!(SessionState::Closed.can_connect());
        assert!(!SessionState::SessionActive.can_connect());
        assert!(SessionState::SessionActive.is_active());
        assert!(SessionState::ChannelOpen.is_channel_open());
        assert!(SessionState::HelloSent.is_transitioning());
        assert_eq!(SessionState::SessionCreating.to_string(), "SessionCreating");
    }

    #[test]
    fn test_sequence_first_is_unconstrained() {
        let mut validator = SequenceValidator::new();
        validator.check(5000).unwrap();
        validator.check(5001).unwrap();
        assert_eq!(validator.last(), Some(5001));
    }

    #[test]
    fn test_sequence_gap_and_repeat_rejected() {
        let mut validator = SequenceValidator::new();
        validator.check(1).unwrap();
        let err = validator.check(3).unwrap_err();
        assert!(matches!(
            err,
            SequenceError::Violation {
                expected: 2,
                received: 3
            }
        ));
        assert!(validator.check(1).is_err());
        validator.check(2).unwrap();
    }

    #[test]
    fn test_sequence_rollover() {
        let mut validator = SequenceValidator::new();
        validator.check(u32::MAX - 10).unwrap();
        validator.check(3).unwrap();
        validator.check(4).unwrap();

        let mut early = SequenceValidator::new();
        early.check(1000).unwrap();
        assert!(early.check(3).is_err());

        // the wrap is only legal past the window and only to a value below it
        let mut at_edge = SequenceValidator::new();
        at_edge.check(u32::MAX - SEQUENCE_ROLLOVER_WINDOW).unwrap();
        assert!(at_edge.check(3).is_err());

        let mut past_edge = SequenceValidator::new();
        past_edge.check(u32::MAX - SEQUENCE_ROLLOVER_WINDOW + 1).unwrap();
        past_edge.check(SEQUENCE_ROLLOVER_WINDOW - 1).unwrap();

        let mut too_high = SequenceValidator::new();
        too_high.check(u32::MAX - 10).unwrap();
        assert!(matches!(
            too_high.check(SEQUENCE_ROLLOVER_WINDOW),
            Err(SequenceError::Violation { .. })
        ));
    }

    #[test]
    fn test_renewal_keeps_previous_keys() {
        let initial = ChannelState::new(
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
            ProtocolLimits::default(),
            None,
            None,
        );
        assert!(!initial.is_open());

        let first = initial.with_token(&token(7, 1), Bytes::new(), Bytes::new(), Some(keys(1)));
        assert!(first.is_open());
        assert!(first.previous.is_none());

        let second = first.with_token(&token(7, 2), Bytes::new(), Bytes::new(), Some(keys(3)));
        assert_eq!(second.token_id, 2);
        assert_eq!(
            second.receive_keys(1).unwrap(),
            first.keys.as_ref().map(|k| &k.server)
        );
        assert_eq!(
            second.receive_keys(2).unwrap(),
            second.keys.as_ref().map(|k| &k.server)
        );
        assert!(matches!(
            second.receive_keys(9),
            Err(SecurityError::UnknownToken { token_id: 9 })
        ));

        let settled = second.without_previous();
        assert!(settled.receive_keys(1).is_err());
    }

    #[test]
    fn test_session_snapshot_keeps_certificate() {
        let state = ChannelState::new(
            SecurityPolicy::None,
            MessageSecurityMode::None,
            ProtocolLimits::default(),
            None,
            None,
        )
        .with_session(
            NodeId::numeric(1, 42),
            NodeId::opaque(0, Bytes::from_static(b"token")),
            Bytes::from_static(b"nonce"),
            None,
        );
        assert_eq!(state.session_id, NodeId::numeric(1, 42));
        assert_eq!(state.session_nonce, Bytes::from_static(b"nonce"));
        assert!(state.remote_certificate.is_none());
    }

    #[test]
    fn test_stats() {
        let stats = SessionStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_service_fault();
        assert_eq!(stats.requests_sent(), 2);
        assert_eq!(stats.service_faults(), 1);
        assert_eq!(stats.tokens_renewed(), 0);
    }
}
