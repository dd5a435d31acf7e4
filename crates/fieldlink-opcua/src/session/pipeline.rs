// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Per-chunk response processing.
//!
//! Every received chunk walks the same stages in order:
//!
//! ```text
//! Sent -> AwaitingDecode -> AwaitingSequenceCheck -> AwaitingReassembly -> Complete
//! ```
//!
//! Decoding decrypts and verifies; the sequence check runs on the decrypted
//! header; reassembly joins chunk bodies per request id. A failure reports
//! the stage it happened in.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::chunk::{ChunkAccumulator, ChunkCodec, ChunkKeys, ChunkProfile, Reassembly};
use crate::error::{SecurityError, UaError};
use crate::protocol::encoding::{BinaryDecodable, BinaryEncodable};
use crate::protocol::header::{MessageHeader, MessageType, SecurityHeader};
use crate::security::crypto::CryptoProvider;

use super::state::{ChannelState, SequenceValidator};

/// Where a request's response currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    /// Request written, nothing received.
    Sent,
    /// A chunk is being decrypted and verified.
    AwaitingDecode,
    /// A decoded chunk's sequence number is being checked.
    AwaitingSequenceCheck,
    /// Chunks are being joined.
    AwaitingReassembly,
    /// The final chunk arrived.
    Complete,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "Sent"),
            Self::AwaitingDecode => write!(f, "AwaitingDecode"),
            Self::AwaitingSequenceCheck => write!(f, "AwaitingSequenceCheck"),
            Self::AwaitingReassembly => write!(f, "AwaitingReassembly"),
            Self::Complete => write!(f, "Complete"),
        }
    }
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// More chunks are expected for `request_id`.
    Pending {
        /// Request the chunk belongs to.
        request_id: u32,
    },
    /// A complete response.
    Complete {
        /// Request the response belongs to.
        request_id: u32,
        /// OPN, MSG or CLO.
        message_type: MessageType,
        /// Token the final chunk was secured with, for MSG and CLO.
        token_id: Option<u32>,
        /// Reassembled message body.
        body: Bytes,
    },
    /// The server abandoned the chunks sent so far for `request_id`.
    /// The request remains outstanding.
    Aborted {
        /// Request the abort belongs to.
        request_id: u32,
        /// Status code from the abort chunk.
        status_code: u32,
        /// Reason from the abort chunk.
        reason: Option<String>,
    },
}

/// A chunk that could not be processed.
#[derive(Debug)]
pub struct PipelineFailure {
    /// Stage that failed.
    pub stage: PipelineStage,
    /// Request the chunk belonged to, when it got far enough to tell.
    pub request_id: Option<u32>,
    /// The cause.
    pub error: UaError,
}

impl PipelineFailure {
    fn new(stage: PipelineStage, request_id: Option<u32>, error: impl Into<UaError>) -> Self {
        Self {
            stage,
            request_id,
            error: error.into(),
        }
    }
}

/// Receive side of a secure channel.
#[derive(Debug)]
pub struct ResponsePipeline {
    validator: SequenceValidator,
    partial: HashMap<u32, ChunkAccumulator>,
    stages: HashMap<u32, PipelineStage>,
    max_message_size: usize,
    max_chunk_count: usize,
}

impl ResponsePipeline {
    /// Creates a pipeline enforcing receive limits; zero means unlimited.
    pub fn new(max_message_size: usize, max_chunk_count: usize) -> Self {
        Self {
            validator: SequenceValidator::new(),
            partial: HashMap::new(),
            stages: HashMap::new(),
            max_message_size,
            max_chunk_count,
        }
    }

    /// Applies negotiated limits to responses started from now on.
    pub fn set_limits(&mut self, max_message_size: usize, max_chunk_count: usize) {
        self.max_message_size = max_message_size;
        self.max_chunk_count = max_chunk_count;
    }

    /// Records that a request was written.
    pub fn register(&mut self, request_id: u32) {
        self.stages.insert(request_id, PipelineStage::Sent);
    }

    /// Current stage of a registered request.
    pub fn stage(&self, request_id: u32) -> Option<PipelineStage> {
        self.stages.get(&request_id).copied()
    }

    /// Drops a request and any partial response, e.g. after a timeout.
    pub fn discard(&mut self, request_id: u32) {
        self.stages.remove(&request_id);
        if self.partial.remove(&request_id).is_some() {
            debug!(request_id, "Discarded partial response");
        }
    }

    /// Forgets everything, for a new channel.
    pub fn reset(&mut self) {
        self.validator.reset();
        self.partial.clear();
        self.stages.clear();
    }

    /// Runs one OPN, MSG or CLO frame through every stage.
    pub fn process(
        &mut self,
        frame: Bytes,
        crypto: &CryptoProvider,
        channel: &ChannelState,
    ) -> Result<PipelineEvent, PipelineFailure> {
        let codec = ChunkCodec::new(crypto);
        let decoded = codec
            .try_decode(frame, |header, security_header| {
                select_keys(crypto, channel, header, security_header)
            })
            .map_err(|failure| {
                let request_id = failure.sequence.map(|sequence| sequence.request_id);
                PipelineFailure::new(PipelineStage::AwaitingDecode, request_id, failure.error)
            })?;

        let request_id = decoded.sequence.request_id;
        self.advance(request_id, PipelineStage::AwaitingSequenceCheck);
        if let Err(e) = self.validator.check(decoded.sequence.sequence_number) {
            self.discard(request_id);
            return Err(PipelineFailure::new(
                PipelineStage::AwaitingSequenceCheck,
                Some(request_id),
                e,
            ));
        }

        self.advance(request_id, PipelineStage::AwaitingReassembly);
        let (max_message_size, max_chunk_count) = (self.max_message_size, self.max_chunk_count);
        let outcome = self
            .partial
            .entry(request_id)
            .or_insert_with(|| ChunkAccumulator::new(max_message_size, max_chunk_count))
            .push(decoded.chunk_type(), &decoded.body);

        trace!(
            request_id,
            sequence_number = decoded.sequence.sequence_number,
            chunk_type = ?decoded.chunk_type(),
            "Chunk accepted"
        );

        match outcome {
            Ok(Reassembly::Pending) => Ok(PipelineEvent::Pending { request_id }),
            Ok(Reassembly::Complete(body)) => {
                self.partial.remove(&request_id);
                self.stages.remove(&request_id);
                Ok(PipelineEvent::Complete {
                    request_id,
                    message_type: decoded.header.message_type,
                    token_id: decoded.security_header.token_id(),
                    body,
                })
            }
            Ok(Reassembly::Aborted(mut body)) => {
                // the request stays registered; a later FINAL may still answer it
                self.advance(request_id, PipelineStage::Sent);
                let status_code = u32::decode(&mut body).map_err(|e| {
                    PipelineFailure::new(PipelineStage::AwaitingReassembly, Some(request_id), e)
                })?;
                let reason = Option::<String>::decode(&mut body).unwrap_or_default();
                Ok(PipelineEvent::Aborted {
                    request_id,
                    status_code,
                    reason,
                })
            }
            Err(e) => {
                self.discard(request_id);
                Err(PipelineFailure::new(
                    PipelineStage::AwaitingReassembly,
                    Some(request_id),
                    e,
                ))
            }
        }
    }

    fn advance(&mut self, request_id: u32, stage: PipelineStage) {
        if let Some(current) = self.stages.get_mut(&request_id) {
            *current = stage;
        }
    }
}

/// Picks the profile and keys for a received chunk.
fn select_keys<'a>(
    crypto: &CryptoProvider,
    channel: &'a ChannelState,
    header: &MessageHeader,
    security_header: &SecurityHeader,
) -> Result<(ChunkProfile, ChunkKeys<'a>), UaError> {
    match security_header {
        SecurityHeader::Asymmetric(asymmetric) => {
            let policy = crypto.policy();
            if asymmetric.security_policy_uri != policy.uri() {
                return Err(SecurityError::policy_mismatch(
                    policy.uri(),
                    asymmetric.security_policy_uri.clone(),
                )
                .into());
            }
            let receive_buffer = channel.limits.receive_buffer_size as usize;
            if !policy.requires_certificates() {
                let profile =
                    ChunkProfile::asymmetric(policy, asymmetric.length_in_bytes(), 0, 0, receive_buffer);
                return Ok((profile, ChunkKeys::Unsecured));
            }
            let remote = channel.remote_certificate.as_ref().ok_or_else(|| {
                SecurityError::missing_credential("server certificate", policy.uri())
            })?;
            let profile = ChunkProfile::asymmetric(
                policy,
                asymmetric.length_in_bytes(),
                remote.key_size(),
                crypto.local_key_size(),
                receive_buffer,
            );
            Ok((
                profile,
                ChunkKeys::Asymmetric {
                    remote_key: remote.public_key(),
                },
            ))
        }
        SecurityHeader::Symmetric(symmetric) => {
            if header.message_type == MessageType::OpenSecureChannel {
                return Err(SecurityError::policy_mismatch("asymmetric header", "symmetric header").into());
            }
            let keys = match channel.receive_keys(symmetric.token_id)? {
                Some(keys) => ChunkKeys::Symmetric(keys),
                None => ChunkKeys::Unsecured,
            };
            Ok((channel.receive_profile, keys))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::EncodeLimits;
    use crate::config::{MessageSecurityMode, SecurityPolicy};
    use crate::error::{CodecError, SequenceError};
    use crate::protocol::header::SymmetricSecurityHeader;
    use crate::protocol::hello::ProtocolLimits;
    use crate::protocol::services::ChannelSecurityToken;
    use crate::security::keys::ChannelKeys;
    use bytes::{BufMut, BytesMut};

    struct Server {
        crypto: CryptoProvider,
        channel: ChannelState,
        keys: Option<ChannelKeys>,
        sequence: u32,
    }

    impl Server {
        fn new(policy: SecurityPolicy, mode: MessageSecurityMode) -> Self {
            let crypto = CryptoProvider::new(policy, None);
            let keys = (policy != SecurityPolicy::None)
                .then(|| crypto.derive_channel_keys(&[1u8; 32], &[2u8; 32]).unwrap());
            let token = ChannelSecurityToken {
                channel_id: 9,
                token_id: 1,
                created_at: 0,
                revised_lifetime: 60_000,
            };
            let channel = ChannelState::new(policy, mode, ProtocolLimits::default(), None, None)
                .with_token(&token, Bytes::new(), Bytes::new(), keys.clone());
            Self {
                crypto,
                channel,
                keys,
                sequence: 100,
            }
        }

        fn frames(&mut self, request_id: u32, body: &[u8]) -> Vec<Bytes> {
            let codec = ChunkCodec::new(&self.crypto);
            let keys = match &self.keys {
                Some(keys) => ChunkKeys::Symmetric(&keys.server),
                None => ChunkKeys::Unsecured,
            };
            let sequence = &mut self.sequence;
            let mut next = || {
                *sequence += 1;
                *sequence
            };
            codec
                .encode(
                    MessageType::Message,
                    9,
                    &SecurityHeader::Symmetric(SymmetricSecurityHeader { token_id: 1 }),
                    request_id,
                    body,
                    &self.channel.receive_profile,
                    keys,
                    EncodeLimits::default(),
                    &mut next,
                )
                .unwrap()
        }
    }

    #[test]
    fn test_multi_chunk_response_completes() {
        let mut server = Server::new(SecurityPolicy::Basic256Sha256, MessageSecurityMode::SignAndEncrypt);
        let mut pipeline = ResponsePipeline::new(0, 0);
        pipeline.register(5);
        assert_eq!(pipeline.stage(5), Some(PipelineStage::Sent));

        let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let frames = server.frames(5, &body);
        assert!(frames.len() > 1);

        let last = frames.len() - 1;
        for (index, frame) in frames.into_iter().enumerate() {
            let event = pipeline.process(frame, &server.crypto, &server.channel).unwrap();
            if index < last {
                assert_eq!(event, PipelineEvent::Pending { request_id: 5 });
                assert_eq!(pipeline.stage(5), Some(PipelineStage::AwaitingReassembly));
            } else {
                match event {
                    PipelineEvent::Complete {
                        request_id,
                        message_type,
                        token_id,
                        body: received,
                    } => {
                        assert_eq!(request_id, 5);
                        assert_eq!(message_type, MessageType::Message);
                        assert_eq!(token_id, Some(1));
                        assert_eq!(received.to_vec(), body);
                    }
                    other => panic!("unexpected event {:?}", other),
                }
            }
        }
        assert_eq!(pipeline.stage(5), None);
    }

    #[test]
    fn test_skipped_sequence_fails_at_sequence_check() {
        let mut server = Server::new(SecurityPolicy::None, MessageSecurityMode::None);
        let mut pipeline = ResponsePipeline::new(0, 0);

        let first = server.frames(1, b"one").remove(0);
        pipeline.process(first, &server.crypto, &server.channel).unwrap();

        server.sequence += 1;
        let skipped = server.frames(2, b"two").remove(0);
        let failure = pipeline
            .process(skipped, &server.crypto, &server.channel)
            .unwrap_err();
        assert_eq!(failure.stage, PipelineStage::AwaitingSequenceCheck);
        assert_eq!(failure.request_id, Some(2));
        assert!(matches!(
            failure.error,
            UaError::Sequence(SequenceError::Violation {
                expected: 102,
                received: 103
            })
        ));
    }

    #[test]
    fn test_unknown_token_fails_at_decode() {
        let mut server = Server::new(SecurityPolicy::Basic128Rsa15, MessageSecurityMode::Sign);
        let frame = server.frames(1, b"body").remove(0);
        let mut tampered = BytesMut::from(&frame[..]);
        tampered[12..16].copy_from_slice(&7u32.to_le_bytes());

        let mut pipeline = ResponsePipeline::new(0, 0);
        let failure = pipeline
            .process(tampered.freeze(), &server.crypto, &server.channel)
            .unwrap_err();
        assert_eq!(failure.stage, PipelineStage::AwaitingDecode);
        assert!(failure.request_id.is_none());
        assert!(matches!(
            failure.error,
            UaError::Security(SecurityError::UnknownToken { token_id: 7 })
        ));
    }

    #[test]
    fn test_tampered_padding_names_its_request() {
        let mut server = Server::new(SecurityPolicy::Basic256Sha256, MessageSecurityMode::SignAndEncrypt);
        let keys = server.keys.clone().unwrap();
        let mut pipeline = ResponsePipeline::new(0, 0);
        pipeline.register(6);

        let frame = server.frames(6, b"abc").remove(0);
        let mut tampered = frame.to_vec();
        server
            .crypto
            .symmetric_decrypt(&keys.server, &mut tampered[16..])
            .unwrap();
        let padding_at = tampered.len() - 32 - 1;
        tampered[padding_at] ^= 0x40;
        server
            .crypto
            .symmetric_encrypt(&keys.server, &mut tampered[16..])
            .unwrap();

        let failure = pipeline
            .process(Bytes::from(tampered), &server.crypto, &server.channel)
            .unwrap_err();
        assert_eq!(failure.stage, PipelineStage::AwaitingDecode);
        assert_eq!(failure.request_id, Some(6));
        assert!(matches!(
            failure.error,
            UaError::Security(SecurityError::MalformedPadding { .. })
        ));
    }

    /// One unsecured chunk with its chunk type byte overwritten.
    fn chunk_of_type(server: &mut Server, request_id: u32, body: &[u8], chunk_type: u8) -> Bytes {
        let mut frame = BytesMut::from(&server.frames(request_id, body)[0][..]);
        frame[3] = chunk_type;
        frame.freeze()
    }

    #[test]
    fn test_abort_resets_and_keeps_request_open() {
        let mut server = Server::new(SecurityPolicy::None, MessageSecurityMode::None);
        let mut pipeline = ResponsePipeline::new(0, 0);
        pipeline.register(4);

        let partial = chunk_of_type(&mut server, 4, b"AAAA", b'C');
        assert_eq!(
            pipeline.process(partial, &server.crypto, &server.channel).unwrap(),
            PipelineEvent::Pending { request_id: 4 }
        );

        let mut reason = BytesMut::new();
        reason.put_u32_le(0x8002_0000);
        Some("shutting down".to_string()).encode(&mut reason);
        let abort = chunk_of_type(&mut server, 4, &reason, b'A');
        assert_eq!(
            pipeline.process(abort, &server.crypto, &server.channel).unwrap(),
            PipelineEvent::Aborted {
                request_id: 4,
                status_code: 0x8002_0000,
                reason: Some("shutting down".to_string()),
            }
        );
        assert_eq!(pipeline.stage(4), Some(PipelineStage::Sent));

        let last = server.frames(4, b"fresh").remove(0);
        match pipeline.process(last, &server.crypto, &server.channel).unwrap() {
            PipelineEvent::Complete { request_id, body, .. } => {
                assert_eq!(request_id, 4);
                assert_eq!(&body[..], b"fresh");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(pipeline.stage(4), None);
    }

    #[test]
    fn test_receive_limit_discards_partial() {
        let mut server = Server::new(SecurityPolicy::None, MessageSecurityMode::None);
        let mut pipeline = ResponsePipeline::new(10_000, 0);
        pipeline.register(3);

        let frames = server.frames(3, &vec![0u8; 20_000]);
        let mut failure = None;
        for frame in frames {
            if let Err(e) = pipeline.process(frame, &server.crypto, &server.channel) {
                failure = Some(e);
                break;
            }
        }
        let failure = failure.unwrap();
        assert_eq!(failure.stage, PipelineStage::AwaitingReassembly);
        assert!(matches!(
            failure.error,
            UaError::Codec(CodecError::MessageTooLarge { .. })
        ));
        assert_eq!(pipeline.stage(3), None);
    }
}
