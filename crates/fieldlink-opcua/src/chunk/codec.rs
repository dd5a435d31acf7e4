// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Splitting messages into secured chunks and opening received chunks.
//!
//! Encoding a chunk:
//!
//! 1. message header with a placeholder size, security header, sequence header, body
//! 2. padding when encrypted: `padding_size + 1` bytes of `padding_size & 0xFF`,
//!    plus `padding_size >> 8` when the cipher block exceeds 256 bytes
//! 3. final size patched into the header
//! 4. signature over everything written so far
//! 5. sequence header through signature encrypted in plaintext blocks

use bytes::{BufMut, Bytes, BytesMut};
use rsa::RsaPublicKey;
use tracing::trace;

use crate::error::{CodecError, SecurityError, UaError, UaResult};
use crate::protocol::encoding::{BinaryDecodable, BinaryEncodable};
use crate::protocol::header::{
    ChunkType, MessageHeader, MessageType, SecurityHeader, SequenceHeader, SEQUENCE_HEADER_SIZE,
};
use crate::security::crypto::CryptoProvider;
use crate::security::keys::SymmetricKeys;

use super::profile::ChunkProfile;

/// Key material for one chunk direction.
#[derive(Debug, Clone, Copy)]
pub enum ChunkKeys<'a> {
    /// No signing or encryption.
    Unsecured,
    /// RSA with the peer's public key. Our private key lives in the
    /// [`CryptoProvider`].
    Asymmetric {
        /// Peer public key: encrypts on send, verifies on receive.
        remote_key: &'a RsaPublicKey,
    },
    /// HMAC and AES-CBC with derived keys.
    Symmetric(&'a SymmetricKeys),
}

/// Negotiated limits applied while encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeLimits {
    /// Largest message body, 0 for unlimited.
    pub max_message_size: usize,
    /// Most chunks per message, 0 for unlimited.
    pub max_chunk_count: usize,
}

/// A verified and decrypted chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    /// Message header as received.
    pub header: MessageHeader,
    /// Security header as received.
    pub security_header: SecurityHeader,
    /// Sequence header.
    pub sequence: SequenceHeader,
    /// Body with padding and signature stripped.
    pub body: Bytes,
}

impl DecodedChunk {
    /// Chunk type of this chunk.
    pub fn chunk_type(&self) -> ChunkType {
        self.header.chunk_type
    }
}

/// A chunk that could not be decoded.
#[derive(Debug)]
pub struct DecodeFailure {
    /// The cause.
    pub error: UaError,
    /// Sequence header of a chunk that decrypted but failed verification.
    /// It is unauthenticated and only good for routing the error.
    pub sequence: Option<SequenceHeader>,
}

impl From<UaError> for DecodeFailure {
    fn from(error: UaError) -> Self {
        Self { error, sequence: None }
    }
}

/// Encodes and decodes chunks under one [`CryptoProvider`].
#[derive(Debug, Clone, Copy)]
pub struct ChunkCodec<'a> {
    crypto: &'a CryptoProvider,
}

impl<'a> ChunkCodec<'a> {
    /// Creates a codec.
    pub fn new(crypto: &'a CryptoProvider) -> Self {
        Self { crypto }
    }

    // =========================================================================
    // Encode
    // =========================================================================

    /// Splits `body` into chunks. Every chunk draws a sequence number from
    /// `next_sequence`.
    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        &self,
        message_type: MessageType,
        secure_channel_id: u32,
        security_header: &SecurityHeader,
        request_id: u32,
        body: &[u8],
        profile: &ChunkProfile,
        keys: ChunkKeys<'_>,
        limits: EncodeLimits,
        next_sequence: &mut dyn FnMut() -> u32,
    ) -> UaResult<Vec<Bytes>> {
        if limits.max_message_size > 0 && body.len() > limits.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: body.len(),
                limit: limits.max_message_size,
            }
            .into());
        }
        if profile.max_body_size == 0 {
            return Err(CodecError::invalid_value(
                "ChunkProfile",
                "chunk size leaves no room for a body",
            )
            .into());
        }

        let chunk_count = body.len().div_ceil(profile.max_body_size).max(1);
        if limits.max_chunk_count > 0 && chunk_count > limits.max_chunk_count {
            return Err(CodecError::TooManyChunks {
                count: chunk_count,
                limit: limits.max_chunk_count,
            }
            .into());
        }

        let security_header = security_header.to_bytes();
        let mut chunks = Vec::with_capacity(chunk_count);
        let mut pieces = body.chunks(profile.max_body_size).peekable();
        let mut first = true;

        while first || pieces.peek().is_some() {
            first = false;
            let piece = pieces.next().unwrap_or(&[]);
            let chunk_type = if pieces.peek().is_some() {
                ChunkType::Intermediate
            } else {
                ChunkType::Final
            };
            let sequence = SequenceHeader {
                sequence_number: next_sequence(),
                request_id,
            };
            let header = MessageHeader::new(message_type, chunk_type, secure_channel_id);
            chunks.push(self.encode_chunk(header, &security_header, sequence, piece, profile, keys)?);
        }

        trace!(
            message_type = %message_type,
            request_id,
            chunks = chunks.len(),
            "Encoded message"
        );
        Ok(chunks)
    }

    fn encode_chunk(
        &self,
        header: MessageHeader,
        security_header: &[u8],
        sequence: SequenceHeader,
        body: &[u8],
        profile: &ChunkProfile,
        keys: ChunkKeys<'_>,
    ) -> UaResult<Bytes> {
        let total = profile.chunk_size(body.len());
        let mut buf = BytesMut::with_capacity(total.max(header.length_in_bytes()));
        header.encode(&mut buf);
        buf.put_slice(security_header);
        let region_start = buf.len();
        sequence.encode(&mut buf);
        buf.put_slice(body);

        if profile.is_encrypted {
            let padding_size = profile.padding_size(body.len());
            let fill = (padding_size & 0xFF) as u8;
            buf.put_bytes(fill, padding_size + 1);
            if profile.padding_overhead == 2 {
                buf.put_u8((padding_size >> 8) as u8);
            }
        }

        MessageHeader::patch_size(&mut buf, total as u32);

        if profile.is_signed {
            let signature = match keys {
                ChunkKeys::Symmetric(keys) => self.crypto.symmetric_sign(keys, &buf)?,
                ChunkKeys::Asymmetric { .. } => self.crypto.asymmetric_sign(&buf)?,
                ChunkKeys::Unsecured => {
                    return Err(SecurityError::missing_credential(
                        "signing keys",
                        self.crypto.policy().uri(),
                    )
                    .into())
                }
            };
            if signature.len() != profile.signature_size {
                return Err(SecurityError::signing_failed(format!(
                    "signature is {} bytes, expected {}",
                    signature.len(),
                    profile.signature_size
                ))
                .into());
            }
            buf.put_slice(&signature);
        }

        if profile.is_encrypted {
            match keys {
                ChunkKeys::Symmetric(keys) => {
                    self.crypto.symmetric_encrypt(keys, &mut buf[region_start..])?;
                }
                ChunkKeys::Asymmetric { remote_key } => {
                    let encrypted = self
                        .crypto
                        .asymmetric_encrypt(remote_key, &buf[region_start..])?;
                    buf.truncate(region_start);
                    buf.put_slice(&encrypted);
                }
                ChunkKeys::Unsecured => {
                    return Err(SecurityError::missing_credential(
                        "encryption keys",
                        self.crypto.policy().uri(),
                    )
                    .into())
                }
            }
        }

        if buf.len() != total {
            return Err(SecurityError::encryption_failed(format!(
                "chunk is {} bytes, expected {}",
                buf.len(),
                total
            ))
            .into());
        }
        Ok(buf.freeze())
    }

    // =========================================================================
    // Decode
    // =========================================================================

    /// Decrypts, checks padding, verifies and strips one chunk.
    ///
    /// `select` picks the profile and keys from the parsed headers, e.g. by
    /// token id.
    pub fn decode<'k>(
        &self,
        frame: Bytes,
        select: impl FnOnce(&MessageHeader, &SecurityHeader) -> UaResult<(ChunkProfile, ChunkKeys<'k>)>,
    ) -> UaResult<DecodedChunk> {
        self.try_decode(frame, select).map_err(|failure| failure.error)
    }

    /// Like [`decode`](Self::decode), but a chunk that decrypts and then
    /// fails its padding or signature check still reports its sequence
    /// header, so the failure can be routed to the request it belongs to.
    pub fn try_decode<'k>(
        &self,
        frame: Bytes,
        select: impl FnOnce(&MessageHeader, &SecurityHeader) -> UaResult<(ChunkProfile, ChunkKeys<'k>)>,
    ) -> Result<DecodedChunk, DecodeFailure> {
        let opened = self.open(frame, select)?;
        let sequence = opened.sequence_header();
        self.verify(opened).map_err(|error| DecodeFailure { error, sequence })
    }

    /// Parses the headers and decrypts the rest of the frame.
    fn open<'k>(
        &self,
        frame: Bytes,
        select: impl FnOnce(&MessageHeader, &SecurityHeader) -> UaResult<(ChunkProfile, ChunkKeys<'k>)>,
    ) -> UaResult<OpenedChunk<'k>> {
        let mut cursor = frame.clone();
        let header = MessageHeader::decode(&mut cursor)?;
        if header.message_size as usize != frame.len() {
            return Err(CodecError::invalid_value(
                "MessageSize",
                format!("header says {} bytes, frame has {}", header.message_size, frame.len()),
            )
            .into());
        }
        let security_header = SecurityHeader::decode_for(header.message_type, &mut cursor)?;
        let (profile, keys) = select(&header, &security_header)?;
        let region_start = frame.len() - cursor.len();

        let mut plain = BytesMut::with_capacity(frame.len());
        plain.put_slice(&frame[..region_start]);
        if profile.is_encrypted {
            match keys {
                ChunkKeys::Symmetric(keys) => {
                    plain.put_slice(&cursor);
                    self.crypto.symmetric_decrypt(keys, &mut plain[region_start..])?;
                }
                ChunkKeys::Asymmetric { .. } => {
                    plain.put_slice(&self.crypto.asymmetric_decrypt(&cursor)?);
                }
                ChunkKeys::Unsecured => {
                    return Err(SecurityError::decryption_failed("no keys for encrypted chunk").into())
                }
            }
        } else {
            plain.put_slice(&cursor);
        }

        let min_len = region_start + SEQUENCE_HEADER_SIZE + profile.signature_size;
        if plain.len() < min_len {
            return Err(CodecError::eof("Chunk", min_len, plain.len()).into());
        }

        Ok(OpenedChunk {
            header,
            security_header,
            profile,
            keys,
            plain,
            region_start,
        })
    }

    /// Checks padding and signature, then strips both.
    fn verify(&self, opened: OpenedChunk<'_>) -> UaResult<DecodedChunk> {
        let OpenedChunk {
            header,
            security_header,
            profile,
            keys,
            plain,
            region_start,
        } = opened;
        let signature_start = plain.len() - profile.signature_size;

        let padding_total = if profile.is_encrypted {
            check_padding(&plain[..signature_start], region_start + SEQUENCE_HEADER_SIZE, &profile)?
        } else {
            0
        };

        if profile.is_signed {
            let (signed, signature) = plain.split_at(signature_start);
            match keys {
                ChunkKeys::Symmetric(keys) => self.crypto.symmetric_verify(keys, signed, signature)?,
                ChunkKeys::Asymmetric { remote_key } => {
                    self.crypto.asymmetric_verify(remote_key, signed, signature)?
                }
                ChunkKeys::Unsecured => {
                    return Err(SecurityError::signature_failed("no keys for signed chunk").into())
                }
            }
        }

        let plain = plain.freeze();
        let mut sequence_bytes = plain.slice(region_start..region_start + SEQUENCE_HEADER_SIZE);
        let sequence = SequenceHeader::decode(&mut sequence_bytes)?;
        let body = plain.slice(region_start + SEQUENCE_HEADER_SIZE..signature_start - padding_total);

        Ok(DecodedChunk {
            header,
            security_header,
            sequence,
            body,
        })
    }
}

/// A decrypted chunk whose padding and signature are not yet checked.
struct OpenedChunk<'k> {
    header: MessageHeader,
    security_header: SecurityHeader,
    profile: ChunkProfile,
    keys: ChunkKeys<'k>,
    plain: BytesMut,
    region_start: usize,
}

impl OpenedChunk<'_> {
    /// Sequence header as decrypted, not yet authenticated.
    fn sequence_header(&self) -> Option<SequenceHeader> {
        let start = self.region_start;
        SequenceHeader::from_bytes(&self.plain[start..start + SEQUENCE_HEADER_SIZE]).ok()
    }
}

/// Validates the padding that ends `data` and returns its total length
/// including the size field(s). `body_start` bounds how far back it may reach.
fn check_padding(data: &[u8], body_start: usize, profile: &ChunkProfile) -> UaResult<usize> {
    let end = data.len();
    let (padding_size, fill_end) = if profile.padding_overhead == 2 {
        if end < body_start + 2 {
            return Err(CodecError::eof("Padding", 2, end.saturating_sub(body_start)).into());
        }
        let low = data[end - 2] as usize;
        let high = data[end - 1] as usize;
        ((high << 8) | low, end - 1)
    } else {
        if end < body_start + 1 {
            return Err(CodecError::eof("Padding", 1, 0).into());
        }
        (data[end - 1] as usize, end)
    };

    // padding_size fill bytes plus the size byte itself
    let fill_len = padding_size + 1;
    if fill_end < body_start + fill_len {
        return Err(SecurityError::malformed_padding(
            fill_end.saturating_sub(1),
            (padding_size & 0xFF) as u8,
            data[fill_end - 1],
        )
        .into());
    }

    let expected = (padding_size & 0xFF) as u8;
    let fill_start = fill_end - fill_len;
    if let Some(position) = data[fill_start..fill_end].iter().position(|b| *b != expected) {
        return Err(SecurityError::malformed_padding(
            fill_start + position,
            expected,
            data[fill_start + position],
        )
        .into());
    }
    Ok(fill_len + profile.padding_overhead - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MessageSecurityMode, SecurityPolicy};
    use crate::error::UaError;
    use crate::protocol::header::{AsymmetricSecurityHeader, SymmetricSecurityHeader};
    use crate::security::certificate::{Certificate, PrivateKey};
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    fn counter() -> impl FnMut() -> u32 {
        let mut next = 0u32;
        move || {
            next += 1;
            next
        }
    }

    fn symmetric_header() -> SecurityHeader {
        SecurityHeader::Symmetric(SymmetricSecurityHeader { token_id: 1 })
    }

    fn encode_symmetric(
        crypto: &CryptoProvider,
        keys: &SymmetricKeys,
        profile: &ChunkProfile,
        body: &[u8],
    ) -> Vec<Bytes> {
        let mut seq = counter();
        ChunkCodec::new(crypto)
            .encode(
                MessageType::Message,
                5,
                &symmetric_header(),
                42,
                body,
                profile,
                ChunkKeys::Symmetric(keys),
                EncodeLimits::default(),
                &mut seq,
            )
            .unwrap()
    }

    fn decode_all(
        crypto: &CryptoProvider,
        keys: &SymmetricKeys,
        profile: &ChunkProfile,
        chunks: &[Bytes],
    ) -> UaResult<Vec<DecodedChunk>> {
        let codec = ChunkCodec::new(crypto);
        chunks
            .iter()
            .map(|chunk| {
                codec.decode(chunk.clone(), |_, _| Ok((*profile, ChunkKeys::Symmetric(keys))))
            })
            .collect()
    }

    #[test]
    fn test_unsecured_single_chunk() {
        let crypto = CryptoProvider::new(SecurityPolicy::None, None);
        let profile = ChunkProfile::symmetric(SecurityPolicy::None, MessageSecurityMode::None, 8196);
        let mut seq = counter();
        let chunks = ChunkCodec::new(&crypto)
            .encode(
                MessageType::Message,
                5,
                &symmetric_header(),
                42,
                b"hello",
                &profile,
                ChunkKeys::Unsecured,
                EncodeLimits::default(),
                &mut seq,
            )
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 12 + 4 + 8 + 5);

        let decoded = ChunkCodec::new(&crypto)
            .decode(chunks[0].clone(), |_, _| Ok((profile, ChunkKeys::Unsecured)))
            .unwrap();
        assert_eq!(decoded.chunk_type(), ChunkType::Final);
        assert_eq!(decoded.sequence, SequenceHeader { sequence_number: 1, request_id: 42 });
        assert_eq!(&decoded.body[..], b"hello");
        assert_eq!(decoded.header.secure_channel_id, 5);
    }

    #[test]
    fn test_empty_body_is_one_chunk() {
        let crypto = CryptoProvider::new(SecurityPolicy::None, None);
        let profile = ChunkProfile::symmetric(SecurityPolicy::None, MessageSecurityMode::None, 8196);
        let mut seq = counter();
        let chunks = ChunkCodec::new(&crypto)
            .encode(
                MessageType::CloseSecureChannel,
                5,
                &symmetric_header(),
                1,
                &[],
                &profile,
                ChunkKeys::Unsecured,
                EncodeLimits::default(),
                &mut seq,
            )
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..4], b"CLOF");
    }

    #[test]
    fn test_symmetric_roundtrip_each_policy() {
        for policy in [SecurityPolicy::Basic128Rsa15, SecurityPolicy::Basic256Sha256] {
            let crypto = CryptoProvider::new(policy, None);
            let nonce_len = policy.nonce_length();
            let keys = crypto
                .derive_channel_keys(&vec![1u8; nonce_len], &vec![2u8; nonce_len])
                .unwrap();
            let profile = ChunkProfile::symmetric(policy, MessageSecurityMode::SignAndEncrypt, 8196);

            let body: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
            let chunks = encode_symmetric(&crypto, &keys.client, &profile, &body);
            assert_eq!(chunks.len(), body.len().div_ceil(profile.max_body_size));
            assert!(chunks.iter().all(|c| c.len() <= 8196));

            let decoded = decode_all(&crypto, &keys.client, &profile, &chunks).unwrap();
            let rebuilt: Vec<u8> = decoded.iter().flat_map(|c| c.body.to_vec()).collect();
            assert_eq!(rebuilt, body);
            let numbers: Vec<u32> = decoded.iter().map(|c| c.sequence.sequence_number).collect();
            assert_eq!(numbers, vec![1, 2, 3]);
            assert_eq!(decoded.last().map(|c| c.chunk_type()), Some(ChunkType::Final));
            assert_eq!(decoded[0].chunk_type(), ChunkType::Intermediate);
        }
    }

    #[test]
    fn test_tampered_padding_is_malformed() {
        let crypto = CryptoProvider::new(SecurityPolicy::Basic256Sha256, None);
        let keys = crypto.derive_channel_keys(&[1u8; 32], &[2u8; 32]).unwrap();
        let profile = ChunkProfile::symmetric(
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
            8196,
        );
        // 8 + 3 + 32 + 1 = 44, so 4 bytes of padding fill
        let chunks = encode_symmetric(&crypto, &keys.client, &profile, b"abc");
        assert_eq!(profile.padding_size(3), 4);

        let mut frame = chunks[0].to_vec();
        crypto.symmetric_decrypt(&keys.client, &mut frame[16..]).unwrap();
        let padding_at = frame.len() - 32 - 3;
        assert_eq!(frame[padding_at], 4);
        frame[padding_at] = 9;
        crypto.symmetric_encrypt(&keys.client, &mut frame[16..]).unwrap();

        let frame = Bytes::from(frame);
        let err = decode_all(&crypto, &keys.client, &profile, &[frame.clone()]).unwrap_err();
        match err {
            UaError::Security(SecurityError::MalformedPadding { expected, found, .. }) => {
                assert_eq!(expected, 4);
                assert_eq!(found, 9);
            }
            other => panic!("unexpected error {:?}", other),
        }

        // the decrypted sequence header still names the request
        let failure = ChunkCodec::new(&crypto)
            .try_decode(frame, |_, _| Ok((profile, ChunkKeys::Symmetric(&keys.client))))
            .unwrap_err();
        assert!(matches!(failure.error, UaError::Security(SecurityError::MalformedPadding { .. })));
        assert_eq!(
            failure.sequence,
            Some(SequenceHeader {
                sequence_number: 1,
                request_id: 42
            })
        );
    }

    #[test]
    fn test_undecryptable_chunk_has_no_sequence() {
        let crypto = CryptoProvider::new(SecurityPolicy::Basic256Sha256, None);
        let keys = crypto.derive_channel_keys(&[1u8; 32], &[2u8; 32]).unwrap();
        let profile = ChunkProfile::symmetric(
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
            8196,
        );
        let chunks = encode_symmetric(&crypto, &keys.client, &profile, b"abc");

        // drop one byte so the ciphertext is no longer whole blocks
        let mut frame = chunks[0][..chunks[0].len() - 1].to_vec();
        let size = frame.len() as u32;
        frame[4..8].copy_from_slice(&size.to_le_bytes());
        let failure = ChunkCodec::new(&crypto)
            .try_decode(Bytes::from(frame), |_, _| Ok((profile, ChunkKeys::Symmetric(&keys.client))))
            .unwrap_err();
        assert!(matches!(failure.error, UaError::Security(SecurityError::DecryptionFailed { .. })));
        assert!(failure.sequence.is_none());
    }

    #[test]
    fn test_tampered_ciphertext_fails_verification() {
        let crypto = CryptoProvider::new(SecurityPolicy::Basic128Rsa15, None);
        let keys = crypto.derive_channel_keys(&[1u8; 16], &[2u8; 16]).unwrap();
        let profile =
            ChunkProfile::symmetric(SecurityPolicy::Basic128Rsa15, MessageSecurityMode::Sign, 8196);
        let chunks = encode_symmetric(&crypto, &keys.client, &profile, b"signed only");

        let mut frame = chunks[0].to_vec();
        frame[16 + 8] ^= 0x01;
        let err = decode_all(&crypto, &keys.client, &profile, &[Bytes::from(frame)]).unwrap_err();
        assert!(matches!(
            err,
            UaError::Security(SecurityError::SignatureVerificationFailed { .. })
        ));
    }

    #[test]
    fn test_limits_enforced_before_sending() {
        let crypto = CryptoProvider::new(SecurityPolicy::None, None);
        let profile = ChunkProfile::symmetric(SecurityPolicy::None, MessageSecurityMode::None, 8196);
        let mut seq = counter();
        let codec = ChunkCodec::new(&crypto);
        let body = vec![0u8; profile.max_body_size * 3];

        let err = codec
            .encode(
                MessageType::Message,
                5,
                &symmetric_header(),
                1,
                &body,
                &profile,
                ChunkKeys::Unsecured,
                EncodeLimits {
                    max_message_size: 0,
                    max_chunk_count: 2,
                },
                &mut seq,
            )
            .unwrap_err();
        assert!(matches!(err, UaError::Codec(CodecError::TooManyChunks { count: 3, limit: 2 })));

        let err = codec
            .encode(
                MessageType::Message,
                5,
                &symmetric_header(),
                1,
                &body,
                &profile,
                ChunkKeys::Unsecured,
                EncodeLimits {
                    max_message_size: 100,
                    max_chunk_count: 0,
                },
                &mut seq,
            )
            .unwrap_err();
        assert!(matches!(err, UaError::Codec(CodecError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_asymmetric_roundtrip() {
        for policy in [SecurityPolicy::Basic128Rsa15, SecurityPolicy::Basic256Sha256] {
            let client_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
            let server_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
            let client_cert = Certificate::from_parts(Bytes::from_static(b"client"), client_key.to_public_key());
            let server_cert = Certificate::from_parts(Bytes::from_static(b"server"), server_key.to_public_key());

            let client = CryptoProvider::new(policy, Some(PrivateKey::new(client_key)));
            let server = CryptoProvider::new(policy, Some(PrivateKey::new(server_key)));

            let header = SecurityHeader::Asymmetric(AsymmetricSecurityHeader {
                security_policy_uri: policy.uri().to_string(),
                sender_certificate: Some(client_cert.der().clone()),
                receiver_certificate_thumbprint: Some(Bytes::copy_from_slice(server_cert.thumbprint())),
            });
            let profile = ChunkProfile::asymmetric(
                policy,
                header.length_in_bytes(),
                client_cert.key_size(),
                server_cert.key_size(),
                8196,
            );

            let body: Vec<u8> = (0..700u32).map(|i| i as u8).collect();
            let mut seq = counter();
            let chunks = ChunkCodec::new(&client)
                .encode(
                    MessageType::OpenSecureChannel,
                    0,
                    &header,
                    1,
                    &body,
                    &profile,
                    ChunkKeys::Asymmetric {
                        remote_key: server_cert.public_key(),
                    },
                    EncodeLimits::default(),
                    &mut seq,
                )
                .unwrap();
            assert_eq!(chunks.len(), 1);

            let decoded = ChunkCodec::new(&server)
                .decode(chunks[0].clone(), |_, _| {
                    Ok((
                        profile,
                        ChunkKeys::Asymmetric {
                            remote_key: client_cert.public_key(),
                        },
                    ))
                })
                .unwrap();
            assert_eq!(decoded.body.to_vec(), body);
            assert_eq!(decoded.security_header, header);
        }
    }

    fn two_byte_padding_fixture(
        policy: SecurityPolicy,
        client_key: &RsaPrivateKey,
        server_key: &RsaPrivateKey,
    ) -> (CryptoProvider, CryptoProvider, Certificate, Certificate, SecurityHeader, ChunkProfile) {
        let client_cert = Certificate::from_parts(Bytes::from_static(b"client"), client_key.to_public_key());
        let server_cert = Certificate::from_parts(Bytes::from_static(b"server"), server_key.to_public_key());
        let client = CryptoProvider::new(policy, Some(PrivateKey::new(client_key.clone())));
        let server = CryptoProvider::new(policy, Some(PrivateKey::new(server_key.clone())));
        let header = SecurityHeader::Asymmetric(AsymmetricSecurityHeader {
            security_policy_uri: policy.uri().to_string(),
            sender_certificate: Some(client_cert.der().clone()),
            receiver_certificate_thumbprint: Some(Bytes::copy_from_slice(server_cert.thumbprint())),
        });
        let profile = ChunkProfile::asymmetric(
            policy,
            header.length_in_bytes(),
            client_cert.key_size(),
            server_cert.key_size(),
            8196,
        );
        (client, server, client_cert, server_cert, header, profile)
    }

    fn encode_open(
        client: &CryptoProvider,
        server_cert: &Certificate,
        header: &SecurityHeader,
        profile: &ChunkProfile,
        body: &[u8],
    ) -> Vec<Bytes> {
        let mut seq = counter();
        ChunkCodec::new(client)
            .encode(
                MessageType::OpenSecureChannel,
                0,
                header,
                1,
                body,
                profile,
                ChunkKeys::Asymmetric {
                    remote_key: server_cert.public_key(),
                },
                EncodeLimits::default(),
                &mut seq,
            )
            .unwrap()
    }

    #[test]
    fn test_asymmetric_roundtrip_with_two_byte_padding() {
        // 258-byte blocks need a second padding size byte
        let client_key = RsaPrivateKey::new(&mut OsRng, 2064).unwrap();
        let server_key = RsaPrivateKey::new(&mut OsRng, 2064).unwrap();

        for policy in [SecurityPolicy::Basic128Rsa15, SecurityPolicy::Basic256Sha256] {
            let (client, server, client_cert, server_cert, header, profile) =
                two_byte_padding_fixture(policy, &client_key, &server_key);
            assert_eq!(profile.padding_overhead, 2);

            let max = profile.max_body_size;
            for len in [0, 1, 300, max - 1, max, max + 1, 3 * max] {
                let body: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
                let chunks = encode_open(&client, &server_cert, &header, &profile, &body);
                assert_eq!(chunks.len(), len.div_ceil(max).max(1), "body of {}", len);
                assert!(chunks.iter().all(|c| c.len() <= 8196));

                let rebuilt: Vec<u8> = chunks
                    .iter()
                    .flat_map(|chunk| {
                        ChunkCodec::new(&server)
                            .decode(chunk.clone(), |_, _| {
                                Ok((
                                    profile,
                                    ChunkKeys::Asymmetric {
                                        remote_key: client_cert.public_key(),
                                    },
                                ))
                            })
                            .unwrap()
                            .body
                            .to_vec()
                    })
                    .collect();
                assert_eq!(rebuilt, body, "body of {}", len);
            }
        }
    }

    #[test]
    fn test_tampered_padding_high_byte_is_malformed() {
        let client_key = RsaPrivateKey::new(&mut OsRng, 2064).unwrap();
        let server_key = RsaPrivateKey::new(&mut OsRng, 2064).unwrap();
        let policy = SecurityPolicy::Basic256Sha256;
        let (client, server, client_cert, server_cert, header, profile) =
            two_byte_padding_fixture(policy, &client_key, &server_key);

        let chunks = encode_open(&client, &server_cert, &header, &profile, b"abc");
        let region_start = 12 + header.length_in_bytes();
        let mut plain = server.asymmetric_decrypt(&chunks[0][region_start..]).unwrap();
        let high_at = plain.len() - profile.signature_size - 1;
        assert_eq!(plain[high_at], 0);
        assert_eq!(plain[high_at - 1] as usize, profile.padding_size(3));
        plain[high_at] = 1;

        let mut frame = chunks[0][..region_start].to_vec();
        frame.extend(client.asymmetric_encrypt(server_cert.public_key(), &plain).unwrap());
        let err = ChunkCodec::new(&server)
            .decode(Bytes::from(frame), |_, _| {
                Ok((
                    profile,
                    ChunkKeys::Asymmetric {
                        remote_key: client_cert.public_key(),
                    },
                ))
            })
            .unwrap_err();
        assert!(
            matches!(err, UaError::Security(SecurityError::MalformedPadding { .. })),
            "unexpected error {:?}",
            err
        );
    }
}
