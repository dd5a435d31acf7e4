// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Shared helpers for the session integration tests.
//!
//! [`MockServer`] plays the server side of a channel over an in-memory
//! duplex stream. Each test scripts the server step by step. Secured
//! channels use [`fixtures`] keys with in-memory certificates.

#![allow(dead_code)]

use std::sync::{Arc, Once, OnceLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use tokio::io::DuplexStream;

use fieldlink_opcua::chunk::{ChunkCodec, ChunkKeys, ChunkProfile, DecodedChunk, EncodeLimits};
use fieldlink_opcua::protocol::encoding::{BinaryDecodable, BinaryEncodable, NodeId};
use fieldlink_opcua::protocol::header::{
    AsymmetricSecurityHeader, ChunkType, MessageHeader, MessageType, SecurityHeader,
    SymmetricSecurityHeader,
};
use fieldlink_opcua::protocol::hello::{Acknowledge, ErrorMessage, Hello, ProtocolLimits};
use fieldlink_opcua::protocol::services::{
    type_ids, ActivateSessionRequest, ActivateSessionResponse, ChannelSecurityToken,
    CreateSessionRequest, CreateSessionResponse, EndpointDescription, OpenSecureChannelRequest,
    OpenSecureChannelResponse, RequestHeader, ResponseHeader, ServiceMessage, SignatureData,
    UserNameIdentityToken, UserTokenPolicy, UserTokenType,
};
use fieldlink_opcua::security::{ChannelKeys, CryptoProvider};
use fieldlink_opcua::{
    Certificate, ChannelConfig, MemoryCertificateProvider, MessageSecurityMode, PrivateKey,
    SecureChannelSession, SecurityPolicy, StreamTransport, Transport,
};

pub const ENDPOINT: &str = "opc.tcp://localhost:4840";
pub const CHANNEL_ID: u32 = 7;

static INIT: Once = Once::new();

/// Routes `tracing` output to the test harness. Honors `RUST_LOG`.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A test configuration for [`ENDPOINT`].
pub fn test_config() -> ChannelConfig {
    ChannelConfig::builder()
        .endpoint(ENDPOINT)
        .request_timeout(Duration::from_secs(5))
        .negotiation_timeout(Duration::from_secs(5))
        .close_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

/// A session with no credentials.
pub fn session(config: ChannelConfig) -> SecureChannelSession {
    SecureChannelSession::new(config, Arc::new(MemoryCertificateProvider::new())).unwrap()
}

// =============================================================================
// Fixtures
// =============================================================================

pub mod fixtures {
    use super::*;

    static KEYS: OnceLock<(RsaPrivateKey, RsaPrivateKey)> = OnceLock::new();

    fn keys() -> &'static (RsaPrivateKey, RsaPrivateKey) {
        KEYS.get_or_init(|| {
            (
                RsaPrivateKey::new(&mut OsRng, 2048).unwrap(),
                RsaPrivateKey::new(&mut OsRng, 2048).unwrap(),
            )
        })
    }

    pub fn client_key() -> PrivateKey {
        PrivateKey::new(keys().0.clone())
    }

    pub fn server_key() -> PrivateKey {
        PrivateKey::new(keys().1.clone())
    }

    /// Certificates carry opaque DER; only the public key matters here.
    pub fn client_certificate() -> Certificate {
        Certificate::from_parts(Bytes::from_static(b"client certificate"), keys().0.to_public_key())
    }

    pub fn server_certificate() -> Certificate {
        Certificate::from_parts(Bytes::from_static(b"server certificate"), keys().1.to_public_key())
    }

    /// A client credential store that already trusts the server.
    pub fn client_provider() -> MemoryCertificateProvider {
        MemoryCertificateProvider::with_credentials(client_certificate(), client_key())
            .with_remote_certificate(server_certificate())
    }
}

// =============================================================================
// MockServer
// =============================================================================

/// A connected client transport and the server it talks to.
pub fn pair(server_limits: ProtocolLimits) -> (Arc<dyn Transport>, MockServer) {
    let (client, server) = tokio::io::duplex(1 << 20);
    (
        Arc::new(StreamTransport::new(client)),
        MockServer::new(StreamTransport::new(server), server_limits),
    )
}

/// A decoded client request.
#[derive(Debug)]
pub struct Request {
    pub message_type: MessageType,
    pub request_id: u32,
    pub sequence_number: u32,
    pub token_id: Option<u32>,
    pub type_id: u32,
    pub header: RequestHeader,
    /// Encoded structure after the request header.
    pub body: Bytes,
    /// Encoded structure including the request header.
    pub raw: Bytes,
}

impl Request {
    pub fn decode<T: BinaryDecodable>(&self) -> T {
        let mut raw = self.raw.clone();
        T::decode(&mut raw).unwrap()
    }
}

/// Server side of a secured channel.
struct Security {
    mode: MessageSecurityMode,
    client_certificate: Certificate,
    server_certificate: Certificate,
    keys: Option<ChannelKeys>,
    session_nonce: Bytes,
}

pub struct MockServer {
    transport: StreamTransport<DuplexStream>,
    crypto: CryptoProvider,
    security: Option<Security>,
    pub limits: ProtocolLimits,
    pub token_id: u32,
    pub sequence: u32,
    pub hello: Option<Hello>,
    /// Password recovered from the last UserName ActivateSession.
    pub password: Option<String>,
}

impl MockServer {
    fn new(transport: StreamTransport<DuplexStream>, limits: ProtocolLimits) -> Self {
        Self {
            transport,
            crypto: CryptoProvider::new(SecurityPolicy::None, None),
            security: None,
            limits,
            token_id: 1,
            sequence: 50,
            hello: None,
            password: None,
        }
    }

    /// Switches to a secured policy with the fixture server key.
    pub fn secured(mut self, policy: SecurityPolicy, mode: MessageSecurityMode) -> Self {
        self.crypto = CryptoProvider::new(policy, Some(fixtures::server_key()));
        self.security = Some(Security {
            mode,
            client_certificate: fixtures::client_certificate(),
            server_certificate: fixtures::server_certificate(),
            keys: None,
            session_nonce: Bytes::new(),
        });
        self
    }

    fn policy(&self) -> SecurityPolicy {
        self.crypto.policy()
    }

    /// Reads the Hello and answers with an Acknowledge carrying our limits.
    pub async fn accept_hello(&mut self) {
        let mut frame = self.transport.receive().await.unwrap().unwrap();
        let header = MessageHeader::decode(&mut frame).unwrap();
        assert_eq!(header.message_type, MessageType::Hello);
        self.hello = Some(Hello::decode(&mut frame).unwrap());

        let ack = Acknowledge {
            protocol_version: 0,
            limits: self.limits,
        };
        self.transport.send(ack.encode_frame()).await.unwrap();
    }

    /// Reads the Hello and answers with an Error message.
    pub async fn reject_hello(&mut self, error: u32, reason: &str) {
        self.transport.receive().await.unwrap().unwrap();
        let message = ErrorMessage {
            error,
            reason: Some(reason.to_string()),
        };
        self.transport.send(message.encode_frame()).await.unwrap();
    }

    /// Reads one chunk and returns its request id, sequence number and
    /// whether it was the final chunk.
    pub async fn receive_chunk(&mut self) -> (u32, u32, bool) {
        let decoded = self.receive_decoded().await;
        (
            decoded.sequence.request_id,
            decoded.sequence.sequence_number,
            decoded.chunk_type() == ChunkType::Final,
        )
    }

    /// Reads one single-chunk request.
    pub async fn receive(&mut self) -> Request {
        let decoded = self.receive_decoded().await;
        let mut body = decoded.body;
        let type_id = NodeId::decode(&mut body).unwrap().as_ns0_numeric().unwrap();
        let raw = body.clone();
        let header = RequestHeader::decode(&mut body).unwrap();
        Request {
            message_type: decoded.header.message_type,
            request_id: decoded.sequence.request_id,
            sequence_number: decoded.sequence.sequence_number,
            token_id: decoded.security_header.token_id(),
            type_id,
            header,
            body,
            raw,
        }
    }

    async fn receive_decoded(&mut self) -> DecodedChunk {
        let frame = self.transport.receive().await.unwrap().expect("client closed the connection");
        let policy = self.policy();
        let security = self.security.as_ref();
        let server_key_size = self.crypto.local_key_size();
        let codec = ChunkCodec::new(&self.crypto);
        codec
            .decode(frame, |header, security_header| {
                if header.message_type.is_asymmetric() {
                    let length = security_header.length_in_bytes();
                    return Ok(match security {
                        Some(security) => (
                            ChunkProfile::asymmetric(
                                policy,
                                length,
                                security.client_certificate.key_size(),
                                server_key_size,
                                1 << 20,
                            ),
                            ChunkKeys::Asymmetric {
                                remote_key: security.client_certificate.public_key(),
                            },
                        ),
                        None => (
                            ChunkProfile::asymmetric(policy, length, 0, 0, 1 << 20),
                            ChunkKeys::Unsecured,
                        ),
                    });
                }
                Ok(match security {
                    Some(Security {
                        mode,
                        keys: Some(keys),
                        ..
                    }) => (
                        ChunkProfile::symmetric(policy, *mode, 1 << 20),
                        ChunkKeys::Symmetric(&keys.client),
                    ),
                    _ => (
                        ChunkProfile::symmetric(policy, MessageSecurityMode::None, 1 << 20),
                        ChunkKeys::Unsecured,
                    ),
                })
            })
            .unwrap()
    }

    /// Sends an encoded service structure in as many chunks as the client's
    /// receive buffer requires.
    pub async fn respond<T>(&mut self, request: &Request, response: &T)
    where
        T: ServiceMessage + BinaryEncodable,
    {
        let mut body = BytesMut::new();
        NodeId::numeric(0, T::TYPE_ID).encode(&mut body);
        response.encode(&mut body);
        self.respond_raw(request.message_type, request.request_id, &body).await;
    }

    /// Sends a message body as-is.
    pub async fn respond_raw(&mut self, message_type: MessageType, request_id: u32, body: &[u8]) {
        for frame in self.frames(message_type, request_id, body) {
            self.transport.send(frame).await.unwrap();
        }
    }

    /// Encodes a response without sending it.
    pub fn frames(&mut self, message_type: MessageType, request_id: u32, body: &[u8]) -> Vec<Bytes> {
        let policy = self.policy();
        let chunk_size = self.limits.send_buffer_size as usize;
        let server_key_size = self.crypto.local_key_size();
        let security = self.security.as_ref();

        let (security_header, profile, keys) = if message_type.is_asymmetric() {
            let header = AsymmetricSecurityHeader {
                security_policy_uri: policy.uri().to_string(),
                sender_certificate: security.map(|s| s.server_certificate.der().clone()),
                receiver_certificate_thumbprint: security
                    .map(|s| Bytes::copy_from_slice(s.client_certificate.thumbprint())),
            };
            let length = header.length_in_bytes();
            let (profile, keys) = match security {
                Some(security) => (
                    ChunkProfile::asymmetric(
                        policy,
                        length,
                        server_key_size,
                        security.client_certificate.key_size(),
                        chunk_size,
                    ),
                    ChunkKeys::Asymmetric {
                        remote_key: security.client_certificate.public_key(),
                    },
                ),
                None => (
                    ChunkProfile::asymmetric(policy, length, 0, 0, chunk_size),
                    ChunkKeys::Unsecured,
                ),
            };
            (SecurityHeader::Asymmetric(header), profile, keys)
        } else {
            let (profile, keys) = match security {
                Some(Security {
                    mode,
                    keys: Some(keys),
                    ..
                }) => (
                    ChunkProfile::symmetric(policy, *mode, chunk_size),
                    ChunkKeys::Symmetric(&keys.server),
                ),
                _ => (
                    ChunkProfile::symmetric(policy, MessageSecurityMode::None, chunk_size),
                    ChunkKeys::Unsecured,
                ),
            };
            (
                SecurityHeader::Symmetric(SymmetricSecurityHeader {
                    token_id: self.token_id,
                }),
                profile,
                keys,
            )
        };

        let codec = ChunkCodec::new(&self.crypto);
        let sequence = &mut self.sequence;
        let mut next = || {
            *sequence += 1;
            *sequence
        };
        codec
            .encode(
                message_type,
                CHANNEL_ID,
                &security_header,
                request_id,
                body,
                &profile,
                keys,
                EncodeLimits::default(),
                &mut next,
            )
            .unwrap()
    }

    /// Sends a raw frame.
    pub async fn send_frame(&mut self, frame: Bytes) {
        self.transport.send(frame).await.unwrap();
    }

    /// One MSG chunk for `request_id` with its chunk type byte replaced,
    /// e.g. `b'C'` or `b'A'`. Unsecured channels only, since the type byte
    /// is covered by the signature.
    pub fn chunk_of_type(&mut self, request_id: u32, body: &[u8], chunk_type: u8) -> Bytes {
        let frames = self.frames(MessageType::Message, request_id, body);
        let mut frame = BytesMut::from(&frames[0][..]);
        frame[3] = chunk_type;
        frame.freeze()
    }

    /// Re-encrypts a secured MSG chunk with its padding size byte flipped.
    pub fn corrupt_padding(&self, frame: &Bytes) -> Bytes {
        let security = self.security.as_ref().expect("secured server");
        let keys = &security.keys.as_ref().expect("channel keys").server;
        let mut plain = frame.to_vec();
        self.crypto.symmetric_decrypt(keys, &mut plain[16..]).unwrap();
        let size_at = plain.len() - self.policy().symmetric_signature_size() - 1;
        plain[size_at] ^= 0x40;
        self.crypto.symmetric_encrypt(keys, &mut plain[16..]).unwrap();
        Bytes::from(plain)
    }

    /// Answers an OpenSecureChannel request with the current token.
    pub async fn open_channel(&mut self) -> Request {
        let request = self.receive().await;
        assert_eq!(request.message_type, MessageType::OpenSecureChannel);
        assert_eq!(request.type_id, type_ids::OPEN_SECURE_CHANNEL_REQUEST);

        let mut server_nonce = None;
        if self.security.is_some() {
            let open: OpenSecureChannelRequest = request.decode();
            let client_nonce = open.client_nonce.unwrap_or_default();
            let nonce = self.crypto.create_nonce();
            let keys = self.crypto.derive_channel_keys(&client_nonce, &nonce).unwrap();
            if let Some(security) = self.security.as_mut() {
                security.keys = Some(keys);
            }
            server_nonce = Some(nonce);
        }

        let response = OpenSecureChannelResponse {
            response_header: ResponseHeader::good(request.header.request_handle),
            server_protocol_version: 0,
            security_token: ChannelSecurityToken {
                channel_id: CHANNEL_ID,
                token_id: self.token_id,
                created_at: 0,
                revised_lifetime: 3_600_000,
            },
            server_nonce,
        };
        self.respond(&request, &response).await;
        request
    }

    /// Answers CreateSession with the endpoint matching our policy.
    pub async fn create_session(&mut self) -> Request {
        let request = self.receive().await;
        assert_eq!(request.type_id, type_ids::CREATE_SESSION_REQUEST);

        let mut response = CreateSessionResponse {
            response_header: ResponseHeader::good(request.header.request_handle),
            session_id: NodeId::numeric(1, 1001),
            authentication_token: NodeId::opaque(0, Bytes::from_static(b"auth-token")),
            revised_session_timeout: 120_000.0,
            server_endpoints: vec![endpoint_for(self.policy(), self.mode())],
            ..Default::default()
        };

        if self.security.is_some() {
            let create: CreateSessionRequest = request.decode();
            let data = [
                create.client_certificate.unwrap_or_default(),
                create.client_nonce.unwrap_or_default(),
            ]
            .concat();
            response.server_signature = SignatureData {
                algorithm: self.policy().asymmetric_signature_uri().map(str::to_string),
                signature: Some(Bytes::from(self.crypto.asymmetric_sign(&data).unwrap())),
            };
            let session_nonce = CryptoProvider::create_session_nonce();
            response.server_nonce = Some(session_nonce.clone());
            if let Some(security) = self.security.as_mut() {
                security.session_nonce = session_nonce;
            }
        }

        self.respond(&request, &response).await;
        request
    }

    /// Answers ActivateSession, checking the client signature and recovering
    /// an encrypted password.
    pub async fn activate_session(&mut self) -> Request {
        let request = self.receive().await;
        assert_eq!(request.type_id, type_ids::ACTIVATE_SESSION_REQUEST);
        let activate: ActivateSessionRequest = request.decode();

        if let Some(security) = &self.security {
            let data = [security.server_certificate.der().as_ref(), security.session_nonce.as_ref()].concat();
            let signature = activate.client_signature.signature.clone().unwrap_or_default();
            self.crypto
                .asymmetric_verify(security.client_certificate.public_key(), &data, &signature)
                .unwrap();
        }

        let identity = &activate.user_identity_token;
        if identity.type_id == NodeId::numeric(0, type_ids::USER_NAME_IDENTITY_TOKEN) {
            let token = identity
                .decode_body::<UserNameIdentityToken>()
                .unwrap()
                .unwrap();
            let plain = self
                .crypto
                .asymmetric_decrypt(&token.password.unwrap_or_default())
                .unwrap();
            let length = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) as usize;
            let nonce_length = self.security.as_ref().map_or(0, |s| s.session_nonce.len());
            let password = &plain[4..4 + length - nonce_length];
            self.password = Some(String::from_utf8(password.to_vec()).unwrap());
        }

        let response = ActivateSessionResponse {
            response_header: ResponseHeader::good(request.header.request_handle),
            ..Default::default()
        };
        self.respond(&request, &response).await;
        request
    }

    fn mode(&self) -> MessageSecurityMode {
        self.security.as_ref().map_or(MessageSecurityMode::None, |s| s.mode)
    }

    /// Runs the server side of a full connect.
    pub async fn handshake(&mut self) {
        self.accept_hello().await;
        self.open_channel().await;
        self.create_session().await;
        self.activate_session().await;
    }

    /// Closes the server side of the connection.
    pub async fn hang_up(&self) {
        let _ = self.transport.close().await;
    }
}

/// The unsecured endpoint the mock server advertises.
pub fn endpoint() -> EndpointDescription {
    endpoint_for(SecurityPolicy::None, MessageSecurityMode::None)
}

/// An endpoint for `policy` and `mode` offering anonymous and username login.
pub fn endpoint_for(policy: SecurityPolicy, mode: MessageSecurityMode) -> EndpointDescription {
    EndpointDescription {
        endpoint_url: Some(ENDPOINT.to_string()),
        security_mode: mode.value(),
        security_policy_uri: Some(policy.uri().to_string()),
        user_identity_tokens: vec![
            UserTokenPolicy {
                policy_id: Some("anonymous".to_string()),
                token_type: UserTokenType::Anonymous.value(),
                ..Default::default()
            },
            UserTokenPolicy {
                policy_id: Some("username".to_string()),
                token_type: UserTokenType::UserName.value(),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}

/// Connects `session` against a freshly scripted server.
pub async fn connected(config: ChannelConfig) -> (SecureChannelSession, MockServer) {
    init_test_logging();
    let session = session(config);
    let (transport, mut server) = pair(ProtocolLimits::default());
    let (connected, ()) = tokio::join!(session.connect_with(transport), server.handshake());
    connected.unwrap();
    (session, server)
}
