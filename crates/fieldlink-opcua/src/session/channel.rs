// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The client secure channel and session.
//!
//! # Flow
//!
//! ```text
//! connect:  HEL/ACK -> OPN(Issue) -> CreateSession -> ActivateSession
//! submit:   sequencer -> encode + writer queue ... reader -> pipeline -> completion
//! renew:    OPN(Renew) every ceil(lifetime * 0.75) ms
//! close:    CloseSession -> CLO -> wait for EOF (bounded) -> Closed
//! ```
//!
//! A reader task owns the receive half of the transport and feeds every
//! frame through the [`ResponsePipeline`]. Writes are queued, in transaction
//! order, to a writer task. Handshake steps are serialized by one async
//! mutex that the keepalive loop shares.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::chunk::{ChunkCodec, ChunkKeys, ChunkProfile, EncodeLimits};
use crate::config::{ChannelConfig, MessageSecurityMode, RequestHandlePolicy, SecurityPolicy, UserIdentity};
use crate::error::{
    status_code_name, CodecError, ConnectionError, SecurityError, SessionError, TimeoutError,
    UaError, UaErrorContext, UaResult,
};
use crate::protocol::encoding::{BinaryDecodable, BinaryEncodable, LocalizedText, NodeId};
use crate::protocol::header::{
    AsymmetricSecurityHeader, MessageHeader, MessageType, SecurityHeader, SymmetricSecurityHeader,
};
use crate::protocol::hello::{ErrorMessage, Hello, HelloReply, ProtocolLimits, PROTOCOL_VERSION};
use crate::protocol::services::{
    encode_message, identity_token, ActivateSessionRequest, ActivateSessionResponse,
    AnonymousIdentityToken, ApplicationDescription, CloseSecureChannelRequest,
    CloseSessionRequest, CloseSessionResponse, CreateSessionRequest, CreateSessionResponse,
    EndpointDescription, GetEndpointsRequest, GetEndpointsResponse, OpenSecureChannelRequest,
    OpenSecureChannelResponse, RequestHeader, ResponseBody, ResponseHeader,
    SecurityTokenRequestType, ServiceRequest, ServiceResponse, SignatureData,
    UserNameIdentityToken,
};
use crate::security::certificate::{
    Certificate, CertificateProvider, FileCertificateProvider, MemoryCertificateProvider,
};
use crate::security::crypto::CryptoProvider;
use crate::transport::{TcpTransport, Transport};

use super::endpoint::select_endpoint;
use super::keepalive::{KeepAliveLoop, Renewable};
use super::pipeline::{PipelineEvent, ResponsePipeline};
use super::sequencer::TransactionSequencer;
use super::state::{ChannelState, SessionState, SessionStats, SEQUENCE_ROLLOVER_WINDOW};

type Completion = oneshot::Sender<UaResult<Bytes>>;

// =============================================================================
// SendContext
// =============================================================================

/// Send-side counters and the writer queue.
#[derive(Debug)]
struct SendContext {
    next_sequence: u32,
    next_handle: u32,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
}

impl SendContext {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            next_handle: 1,
            writer: None,
        }
    }

    fn next_sequence_number(&mut self) -> u32 {
        let number = self.next_sequence;
        self.next_sequence = if number > u32::MAX - SEQUENCE_ROLLOVER_WINDOW {
            1
        } else {
            number + 1
        };
        number
    }

    fn next_request_handle(&mut self) -> u32 {
        let handle = self.next_handle;
        self.next_handle = handle.checked_add(1).unwrap_or(1);
        handle
    }
}

/// Transport and tasks of one connection.
struct Connection {
    transport: Arc<dyn Transport>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    keepalive: Option<KeepAliveLoop>,
}

impl Connection {
    fn abort(&self) {
        if let Some(keepalive) = &self.keepalive {
            keepalive.stop();
        }
        self.reader.abort();
        self.writer.abort();
    }
}

// =============================================================================
// SecureChannelSession
// =============================================================================

/// A client secure channel with an activated session on top.
///
/// Cloning is cheap; clones share the channel.
#[derive(Clone)]
pub struct SecureChannelSession {
    shared: Arc<Shared>,
}

impl SecureChannelSession {
    /// Creates a session with explicit credentials.
    pub fn new(config: ChannelConfig, certificates: Arc<dyn CertificateProvider>) -> UaResult<Self> {
        Ok(Self {
            shared: Shared::new(config, certificates)?,
        })
    }

    /// Creates a session, loading credentials from the configured paths.
    pub async fn from_config(config: ChannelConfig) -> UaResult<Self> {
        let certificates: Arc<dyn CertificateProvider> =
            match (&config.certificate_path, &config.private_key_path) {
                (Some(certificate), Some(key)) => Arc::new(
                    FileCertificateProvider::load(
                        certificate,
                        key,
                        config.server_certificate_path.as_deref().map(std::path::Path::new),
                    )
                    .await?,
                ),
                _ => Arc::new(MemoryCertificateProvider::new()),
            };
        Self::new(config, certificates)
    }

    /// Opens a TCP connection and runs the full handshake.
    pub async fn connect(&self) -> UaResult<()> {
        let transport = self.shared.open_tcp().await?;
        self.connect_with(transport).await
    }

    /// Runs the full handshake over an already connected transport.
    pub async fn connect_with(&self, transport: Arc<dyn Transport>) -> UaResult<()> {
        self.shared
            .connect(transport)
            .await
            .with_endpoint(&self.shared.config.endpoint)
    }

    /// Asks the server for its endpoints over an unsecured channel and
    /// returns the one matching our configuration.
    ///
    /// The endpoint's certificate becomes the server certificate, so a
    /// secured `connect` may follow.
    pub async fn discover(&self) -> UaResult<EndpointDescription> {
        let transport = self.shared.open_tcp().await?;
        self.discover_with(transport).await
    }

    /// [`discover`](Self::discover) over an already connected transport.
    pub async fn discover_with(&self, transport: Arc<dyn Transport>) -> UaResult<EndpointDescription> {
        self.shared.discover(transport).await
    }

    /// Sends an encoded service structure and returns the response.
    ///
    /// `body` is the structure without its encoding id; `type_id` is
    /// prefixed. A ServiceFault response becomes [`UaError::ServiceFault`].
    pub async fn submit(&self, type_id: u32, body: Bytes) -> UaResult<ResponseBody> {
        self.shared.ensure_open("submit")?;
        let type_node = NodeId::numeric(0, type_id);
        let mut message = BytesMut::with_capacity(type_node.length_in_bytes() + body.len());
        type_node.encode(&mut message);
        message.extend_from_slice(&body);

        let response = self
            .shared
            .exchange(MessageType::Message, message.freeze(), None)
            .await?;
        self.shared.parse_response(response)
    }

    /// Sends a typed request and decodes the typed response.
    ///
    /// The response must echo the request handle; see
    /// [`RequestHandlePolicy`].
    pub async fn call<Req, Resp>(&self, request: Req) -> UaResult<Resp>
    where
        Req: ServiceRequest,
        Resp: ServiceResponse,
    {
        self.shared.ensure_open("call")?;
        self.shared.call(&request).await
    }

    /// A request header with the session token and a fresh handle.
    pub fn request_header(&self) -> RequestHeader {
        let token = self.shared.channel_snapshot().authentication_token.clone();
        self.shared.make_request_header(token, self.shared.config.request_timeout)
    }

    /// Renews the channel security token now.
    pub async fn renew(&self) -> UaResult<()> {
        self.shared.renew_token().await
    }

    /// Closes the session and channel. Always ends in `Closed`.
    pub async fn disconnect(&self) -> UaResult<()> {
        self.shared.disconnect().await
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Negotiated limits.
    pub fn limits(&self) -> ProtocolLimits {
        self.shared.channel_snapshot().limits
    }

    /// Secure channel id, 0 when not open.
    pub fn channel_id(&self) -> u32 {
        self.shared.channel_snapshot().channel_id
    }

    /// Current security token id.
    pub fn token_id(&self) -> u32 {
        self.shared.channel_snapshot().token_id
    }

    /// Session id, null without a session.
    pub fn session_id(&self) -> NodeId {
        self.shared.channel_snapshot().session_id.clone()
    }

    /// Snapshot of the channel state.
    pub fn channel_state(&self) -> Arc<ChannelState> {
        self.shared.channel_snapshot()
    }

    /// Counters.
    pub fn stats(&self) -> &SessionStats {
        &self.shared.stats
    }

    /// The configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for SecureChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channel = self.shared.channel_snapshot();
        f.debug_struct("SecureChannelSession")
            .field("endpoint", &self.shared.config.endpoint)
            .field("state", &self.state())
            .field("channel_id", &channel.channel_id)
            .field("token_id", &channel.token_id)
            .finish()
    }
}

// =============================================================================
// Shared
// =============================================================================

struct Shared {
    self_ref: Weak<Shared>,
    config: ChannelConfig,
    crypto: CryptoProvider,
    certificates: Arc<dyn CertificateProvider>,
    state: RwLock<SessionState>,
    channel: RwLock<Arc<ChannelState>>,
    sequencer: TransactionSequencer,
    send: Mutex<SendContext>,
    pending: Mutex<HashMap<u32, Completion>>,
    pipeline: Mutex<ResponsePipeline>,
    handshake: tokio::sync::Mutex<()>,
    connection: Mutex<Option<Connection>>,
    stats: SessionStats,
}

impl Shared {
    fn new(config: ChannelConfig, certificates: Arc<dyn CertificateProvider>) -> UaResult<Arc<Self>> {
        config.validate()?;
        let policy = config.security_policy;
        let private_key = certificates.local_private_key();
        if policy.requires_certificates()
            && (certificates.local_certificate().is_none() || private_key.is_none())
        {
            return Err(SecurityError::missing_credential(
                "client certificate and private key",
                policy.uri(),
            )
            .into());
        }

        let channel = ChannelState::new(
            policy,
            config.security_mode,
            config.limits,
            certificates.local_certificate(),
            certificates.remote_certificate(),
        );
        let limits = config.limits;
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            crypto: CryptoProvider::new(policy, private_key),
            certificates,
            state: RwLock::new(SessionState::Disconnected),
            channel: RwLock::new(Arc::new(channel)),
            sequencer: TransactionSequencer::new(config.max_transaction_id),
            send: Mutex::new(SendContext::new()),
            pending: Mutex::new(HashMap::new()),
            pipeline: Mutex::new(ResponsePipeline::new(
                limits.max_message_size as usize,
                limits.max_chunk_count as usize,
            )),
            handshake: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
            stats: SessionStats::default(),
            config,
        }))
    }

    // =========================================================================
    // State
    // =========================================================================

    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, new_state: SessionState) {
        let old_state = std::mem::replace(&mut *self.state.write(), new_state);
        if old_state != new_state {
            trace!(
                old_state = %old_state,
                new_state = %new_state,
                endpoint = %self.config.endpoint,
                "Session state changed"
            );
        }
    }

    fn channel_snapshot(&self) -> Arc<ChannelState> {
        self.channel.read().clone()
    }

    fn publish(&self, update: impl FnOnce(&ChannelState) -> ChannelState) {
        let mut channel = self.channel.write();
        *channel = Arc::new(update(&channel));
    }

    fn ensure_open(&self, operation: &'static str) -> UaResult<()> {
        let state = self.state();
        if state.is_channel_open() {
            return Ok(());
        }
        if state.can_connect() {
            return Err(UaError::not_connected());
        }
        Err(SessionError::invalid_state(operation, state).into())
    }

    fn secured(&self) -> bool {
        self.crypto.policy().requires_certificates()
    }

    // =========================================================================
    // Connect
    // =========================================================================

    async fn open_tcp(&self) -> UaResult<Arc<dyn Transport>> {
        let (host, port) = self.config.host_and_port()?;
        let transport = TcpTransport::connect(&host, port, self.config.negotiation_timeout).await?;
        Ok(Arc::new(transport))
    }

    async fn connect(&self, transport: Arc<dyn Transport>) -> UaResult<()> {
        let _handshake = self.handshake.lock().await;
        let state = self.state();
        if !state.can_connect() {
            return Err(SessionError::invalid_state("connect", state).into());
        }
        if self.secured() && self.certificates.remote_certificate().is_none() {
            return Err(SecurityError::missing_credential(
                "server certificate",
                self.crypto.policy().uri(),
            )
            .into());
        }

        info!(
            endpoint = %self.config.endpoint,
            policy = self.crypto.policy().name(),
            mode = self.config.security_mode.name(),
            "Connecting"
        );

        let established = async {
            self.open_channel(transport).await?;
            self.set_state(SessionState::SessionCreating);
            let policy_id = self.create_session().await?;
            self.activate_session(policy_id).await?;
            // a disconnect may have torn the channel down under us
            if self.state() == SessionState::Closed {
                return Err(UaError::from(ConnectionError::closed(Some(
                    "session closed during handshake".to_string(),
                ))));
            }
            Ok::<(), UaError>(())
        }
        .await;

        if let Err(e) = established {
            e.log("connect");
            self.teardown(&format!("connect failed: {}", e));
            return Err(e);
        }

        self.set_state(SessionState::SessionActive);
        let keepalive = KeepAliveLoop::spawn(self.self_ref.clone(), self.config.keepalive_failure_limit);
        if let Some(connection) = self.connection.lock().as_mut() {
            connection.keepalive = Some(keepalive);
        }

        let channel = self.channel_snapshot();
        info!(
            endpoint = %self.config.endpoint,
            channel_id = channel.channel_id,
            token_id = channel.token_id,
            session_id = %channel.session_id,
            "Session active"
        );
        Ok(())
    }

    /// Hello, reader and writer tasks, OpenSecureChannel(Issue).
    async fn open_channel(&self, transport: Arc<dyn Transport>) -> UaResult<()> {
        self.reset();

        self.set_state(SessionState::HelloSent);
        let limits = self.hello(transport.as_ref()).await?;
        self.publish(|_| {
            ChannelState::new(
                self.crypto.policy(),
                self.config.security_mode,
                limits,
                self.certificates.local_certificate(),
                self.certificates.remote_certificate(),
            )
        });
        self.pipeline
            .lock()
            .set_limits(limits.max_message_size as usize, limits.max_chunk_count as usize);
        self.start_io(transport);

        self.set_state(SessionState::ChannelOpening);
        self.open_secure_channel(SecurityTokenRequestType::Issue).await?;
        self.set_state(SessionState::ChannelOpen);
        Ok(())
    }

    fn reset(&self) {
        self.sequencer.reset();
        *self.send.lock() = SendContext::new();
        self.pipeline.lock().reset();
        self.pending.lock().clear();
    }

    async fn hello(&self, transport: &dyn Transport) -> UaResult<ProtocolLimits> {
        let frame = Hello::new(self.config.endpoint.clone(), self.config.limits).encode_frame();
        let reply = transport
            .send_and_expect_response(frame, self.config.negotiation_timeout)
            .await?;

        match HelloReply::decode_frame(reply)? {
            HelloReply::Acknowledge(ack) => {
                let limits = self.config.limits.merge(&ack.limits);
                debug!(
                    receive_buffer_size = limits.receive_buffer_size,
                    send_buffer_size = limits.send_buffer_size,
                    max_message_size = limits.max_message_size,
                    max_chunk_count = limits.max_chunk_count,
                    "Acknowledge received"
                );
                Ok(limits)
            }
            HelloReply::Error(error) => Err(error.into_error()),
        }
    }

    fn start_io(&self, transport: Arc<dyn Transport>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.send.lock().writer = Some(sender);

        let reader = tokio::spawn(read_loop(self.self_ref.clone(), transport.clone()));
        let writer = tokio::spawn(write_loop(self.self_ref.clone(), transport.clone(), receiver));
        let previous = self.connection.lock().replace(Connection {
            transport,
            reader,
            writer,
            keepalive: None,
        });
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    // =========================================================================
    // OpenSecureChannel
    // =========================================================================

    async fn open_secure_channel(&self, request_type: SecurityTokenRequestType) -> UaResult<()> {
        let timeout = self.config.negotiation_timeout;
        let local_nonce = self.crypto.create_nonce();
        let request = OpenSecureChannelRequest {
            request_header: self.make_request_header(NodeId::null(), timeout),
            client_protocol_version: PROTOCOL_VERSION,
            request_type: request_type.value(),
            security_mode: self.config.security_mode.value(),
            client_nonce: Some(local_nonce.clone()),
            requested_lifetime: u32::try_from(self.config.channel_lifetime.as_millis()).unwrap_or(u32::MAX),
        };

        let response = self
            .exchange(
                MessageType::OpenSecureChannel,
                encode_message(&request),
                Some("OpenSecureChannel"),
            )
            .await?;
        let response: OpenSecureChannelResponse = self.parse_response(response)?.decode()?;
        self.check_response_header(request.request_header.request_handle, &response.response_header)?;

        let remote_nonce = response.server_nonce.unwrap_or_default();
        let keys = if self.secured() {
            let expected = self.crypto.policy().nonce_length();
            if remote_nonce.len() != expected {
                return Err(CodecError::invalid_value(
                    "ServerNonce",
                    format!("expected {} bytes, received {}", expected, remote_nonce.len()),
                )
                .into());
            }
            Some(self.crypto.derive_channel_keys(&local_nonce, &remote_nonce)?)
        } else {
            None
        };

        let token = response.security_token;
        self.publish(|channel| channel.with_token(&token, local_nonce, remote_nonce, keys));

        match request_type {
            SecurityTokenRequestType::Issue => {
                self.stats.record_channel_opened();
                info!(
                    channel_id = token.channel_id,
                    token_id = token.token_id,
                    lifetime_ms = token.revised_lifetime,
                    "Secure channel opened"
                );
            }
            SecurityTokenRequestType::Renew => {
                self.stats.record_token_renewed();
                info!(
                    channel_id = token.channel_id,
                    token_id = token.token_id,
                    lifetime_ms = token.revised_lifetime,
                    "Security token renewed"
                );
            }
        }
        Ok(())
    }

    async fn renew_token(&self) -> UaResult<()> {
        let _handshake = self.handshake.lock().await;
        let state = self.state();
        if !state.is_channel_open() {
            return Err(SessionError::invalid_state("renew", state).into());
        }
        self.open_secure_channel(SecurityTokenRequestType::Renew).await
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Returns the policy id of the user token policy to authenticate with.
    async fn create_session(&self) -> UaResult<Option<String>> {
        let channel = self.channel_snapshot();
        let client_nonce = CryptoProvider::create_session_nonce();
        let client_certificate = channel
            .local_certificate
            .as_ref()
            .filter(|_| self.secured())
            .map(|certificate| certificate.der().clone());

        let request = CreateSessionRequest {
            request_header: self.make_request_header(NodeId::null(), self.config.request_timeout),
            client_description: ApplicationDescription {
                application_uri: Some(self.config.effective_application_uri()),
                product_uri: Some(self.config.effective_product_uri()),
                application_name: LocalizedText::english(self.config.application_name.clone()),
                application_type: 1,
                ..Default::default()
            },
            server_uri: None,
            endpoint_url: Some(self.config.endpoint.clone()),
            session_name: Some(self.config.effective_session_name()),
            client_nonce: Some(client_nonce.clone()),
            client_certificate: client_certificate.clone(),
            requested_session_timeout: self.config.session_timeout.as_millis() as f64,
            max_response_message_size: channel.limits.max_message_size,
        };
        let response: CreateSessionResponse = self.call(&request).await?;

        let server_certificate = match response.server_certificate.as_ref() {
            Some(der) if !der.is_empty() => Some(Certificate::from_der(der.clone())?),
            _ => None,
        };

        if self.secured() {
            let certificate = server_certificate
                .as_ref()
                .or(channel.remote_certificate.as_ref())
                .ok_or_else(|| {
                    SecurityError::missing_credential("server certificate", self.crypto.policy().uri())
                })?;
            self.crypto.verify_server_signature(
                certificate,
                client_certificate.as_deref().unwrap_or_default(),
                &client_nonce,
                &response.server_signature,
            )?;
        }
        if let Some(certificate) = &server_certificate {
            self.certificates.set_remote_certificate(certificate.clone());
        }

        let (_, token_policy) = select_endpoint(
            &response.server_endpoints,
            &self.config.endpoint,
            self.crypto.policy(),
            self.config.security_mode,
            &self.config.identity,
        )?;
        let policy_id = token_policy.policy_id.clone();

        self.publish(|channel| {
            channel.with_session(
                response.session_id.clone(),
                response.authentication_token.clone(),
                response.server_nonce.clone().unwrap_or_default(),
                server_certificate.clone(),
            )
        });
        debug!(
            session_id = %response.session_id,
            revised_timeout_ms = response.revised_session_timeout,
            "Session created"
        );
        Ok(policy_id)
    }

    async fn activate_session(&self, policy_id: Option<String>) -> UaResult<()> {
        let channel = self.channel_snapshot();
        let client_signature = match &channel.remote_certificate {
            Some(certificate) => self
                .crypto
                .client_signature(certificate.der(), &channel.session_nonce)?,
            None => SignatureData::default(),
        };

        let user_identity_token = match &self.config.identity {
            UserIdentity::Anonymous => identity_token(&AnonymousIdentityToken { policy_id }),
            UserIdentity::UserName { username, password } => {
                let certificate = channel.remote_certificate.as_ref().ok_or_else(|| {
                    SecurityError::missing_credential("server certificate", "UserName identity")
                })?;
                let (password, algorithm) = self.crypto.encrypt_identity_password(
                    password,
                    &channel.session_nonce,
                    certificate,
                )?;
                identity_token(&UserNameIdentityToken {
                    policy_id,
                    user_name: Some(username.clone()),
                    password: Some(password),
                    encryption_algorithm: Some(algorithm.to_string()),
                })
            }
        };

        let request = ActivateSessionRequest {
            request_header: self.make_request_header(
                channel.authentication_token.clone(),
                self.config.request_timeout,
            ),
            client_signature,
            user_identity_token,
            ..Default::default()
        };
        let response: ActivateSessionResponse = self
            .call(&request)
            .await
            .map_err(|e| match e {
                UaError::Connection(_) | UaError::Timeout(_) | UaError::ServiceFault { .. } | UaError::Session(_) => e,
                other => SessionError::activation_failed(other.to_string()).into(),
            })?;

        if let Some(nonce) = response.server_nonce {
            self.publish(|channel| channel.with_session_nonce(nonce));
        }
        debug!(identity = %self.config.identity, "Session activated");
        Ok(())
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    async fn discover(&self, transport: Arc<dyn Transport>) -> UaResult<EndpointDescription> {
        let mut config = self.config.clone();
        config.security_policy = SecurityPolicy::None;
        config.security_mode = MessageSecurityMode::None;
        config.keepalive_failure_limit = None;
        let probe = Shared::new(config, Arc::new(MemoryCertificateProvider::new()))?;

        let endpoints = async {
            let _handshake = probe.handshake.lock().await;
            probe.open_channel(transport).await?;
            let request = GetEndpointsRequest {
                request_header: probe.make_request_header(NodeId::null(), probe.config.request_timeout),
                endpoint_url: Some(probe.config.endpoint.clone()),
                ..Default::default()
            };
            let response: GetEndpointsResponse = probe.call(&request).await?;
            Ok::<_, UaError>(response.endpoints)
        }
        .await;
        if let Err(e) = probe.disconnect().await {
            e.log("discovery close");
        }
        let endpoints = endpoints?;

        let (endpoint, _) = select_endpoint(
            &endpoints,
            &self.config.endpoint,
            self.config.security_policy,
            self.config.security_mode,
            &self.config.identity,
        )?;
        if let Some(der) = endpoint.server_certificate.as_ref().filter(|der| !der.is_empty()) {
            let certificate = Certificate::from_der(der.clone())?;
            self.certificates.set_remote_certificate(certificate.clone());
            self.publish(|channel| ChannelState {
                remote_certificate: Some(certificate),
                ..channel.clone()
            });
        }
        info!(
            endpoint = endpoint.endpoint_url.as_deref().unwrap_or_default(),
            security_level = endpoint.security_level,
            "Discovered endpoint"
        );
        Ok(endpoint.clone())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    fn make_request_header(&self, authentication_token: NodeId, timeout: Duration) -> RequestHeader {
        let handle = self.send.lock().next_request_handle();
        let timeout_hint = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        RequestHeader::new(authentication_token, handle, timeout_hint)
    }

    async fn call<Req, Resp>(&self, request: &Req) -> UaResult<Resp>
    where
        Req: ServiceRequest,
        Resp: ServiceResponse,
    {
        let response = self
            .exchange(MessageType::Message, encode_message(request), None)
            .await?;
        let response: Resp = self.parse_response(response)?.decode()?;
        self.check_response_header(request.request_header().request_handle, response.response_header())?;
        Ok(response)
    }

    fn parse_response(&self, message: Bytes) -> UaResult<ResponseBody> {
        match ResponseBody::parse(message) {
            Err(e @ UaError::ServiceFault { .. }) => {
                self.stats.record_service_fault();
                e.log("service call");
                Err(e)
            }
            other => other,
        }
    }

    fn check_response_header(&self, expected: u32, header: &ResponseHeader) -> UaResult<()> {
        if header.is_bad() {
            self.stats.record_service_fault();
            return Err(UaError::service_fault(header.service_result));
        }
        let received = header.request_handle;
        if received != expected {
            match self.config.request_handle_policy {
                RequestHandlePolicy::Warn => {
                    warn!(expected, received, "Response request handle does not match the request")
                }
                RequestHandlePolicy::Reject => {
                    return Err(SessionError::RequestHandleMismatch { expected, received }.into())
                }
            }
        }
        Ok(())
    }

    /// Dispatches a message and waits for its response.
    ///
    /// `negotiation` names the handshake step for negotiation timeouts;
    /// service calls use the request timeout.
    async fn exchange(
        &self,
        message_type: MessageType,
        body: Bytes,
        negotiation: Option<&'static str>,
    ) -> UaResult<Bytes> {
        let timeout = if negotiation.is_some() {
            self.config.negotiation_timeout
        } else {
            self.config.request_timeout
        };

        let (completion, receiver) = oneshot::channel();
        let request_id = self.dispatch(message_type, body, Some(completion))?;

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result.with_request(request_id),
            Ok(Err(_)) => Err(ConnectionError::closed(Some("request abandoned".to_string())).into()),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                self.pipeline.lock().discard(request_id);
                self.stats.record_timeout();
                let error = match negotiation {
                    Some(step) => TimeoutError::negotiation(step, timeout).into(),
                    None => UaError::request_timeout(request_id, timeout),
                };
                error.log("awaiting response");
                Err(error)
            }
        }
    }

    /// Allocates a request id and queues the message behind every lower id.
    fn dispatch(
        &self,
        message_type: MessageType,
        body: Bytes,
        completion: Option<Completion>,
    ) -> UaResult<u32> {
        let shared = self.self_ref.upgrade().ok_or_else(UaError::not_connected)?;
        let request_id = self.sequencer.next_transaction_id();
        if let Some(completion) = completion {
            self.pending.lock().insert(request_id, completion);
            self.pipeline.lock().register(request_id);
        }

        let submitted = self.sequencer.submit(request_id, move || {
            if let Err(e) = shared.encode_and_queue(message_type, request_id, &body) {
                e.log("encoding request");
                shared.complete(request_id, Err(e));
            }
        });

        if let Err(e) = submitted {
            self.pending.lock().remove(&request_id);
            self.pipeline.lock().discard(request_id);
            return Err(e.into());
        }
        self.stats.record_request();
        Ok(request_id)
    }

    fn encode_and_queue(&self, message_type: MessageType, request_id: u32, body: &[u8]) -> UaResult<()> {
        let channel = self.channel_snapshot();
        let policy = self.crypto.policy();
        let codec = ChunkCodec::new(&self.crypto);
        let limits = EncodeLimits {
            max_message_size: channel.limits.max_message_size as usize,
            max_chunk_count: channel.limits.max_chunk_count as usize,
        };

        let mut send = self.send.lock();
        let writer = send.writer.clone().ok_or_else(UaError::not_connected)?;
        let mut next_sequence = || send.next_sequence_number();

        let chunks = if message_type.is_asymmetric() {
            let remote = channel.remote_certificate.as_ref();
            let secured = policy.requires_certificates();
            let header = AsymmetricSecurityHeader {
                security_policy_uri: policy.uri().to_string(),
                sender_certificate: channel
                    .local_certificate
                    .as_ref()
                    .filter(|_| secured)
                    .map(|certificate| certificate.der().clone()),
                receiver_certificate_thumbprint: remote
                    .filter(|_| secured)
                    .map(|certificate| Bytes::copy_from_slice(certificate.thumbprint())),
            };
            let send_buffer = channel.limits.send_buffer_size as usize;
            let (profile, keys) = if secured {
                let remote = remote
                    .ok_or_else(|| SecurityError::missing_credential("server certificate", policy.uri()))?;
                (
                    ChunkProfile::asymmetric(
                        policy,
                        header.length_in_bytes(),
                        self.crypto.local_key_size(),
                        remote.key_size(),
                        send_buffer,
                    ),
                    ChunkKeys::Asymmetric {
                        remote_key: remote.public_key(),
                    },
                )
            } else {
                (
                    ChunkProfile::asymmetric(policy, header.length_in_bytes(), 0, 0, send_buffer),
                    ChunkKeys::Unsecured,
                )
            };
            codec.encode(
                message_type,
                channel.channel_id,
                &SecurityHeader::Asymmetric(header),
                request_id,
                body,
                &profile,
                keys,
                limits,
                &mut next_sequence,
            )?
        } else {
            let keys = channel
                .send_keys()
                .map_or(ChunkKeys::Unsecured, ChunkKeys::Symmetric);
            codec.encode(
                message_type,
                channel.channel_id,
                &SecurityHeader::Symmetric(SymmetricSecurityHeader {
                    token_id: channel.token_id,
                }),
                request_id,
                body,
                &channel.send_profile,
                keys,
                limits,
                &mut next_sequence,
            )?
        };

        for chunk in chunks {
            writer
                .send(chunk)
                .map_err(|_| ConnectionError::closed(Some("writer stopped".to_string())))?;
        }
        trace!(request_id, message_type = %message_type, token_id = channel.token_id, "Request queued");
        Ok(())
    }

    fn complete(&self, request_id: u32, result: UaResult<Bytes>) {
        let completion = self.pending.lock().remove(&request_id);
        match completion {
            Some(completion) => {
                if result.is_ok() {
                    self.stats.record_response();
                }
                let _ = completion.send(result);
            }
            None => debug!(request_id, "Dropping response for unknown or expired request"),
        }
    }

    // =========================================================================
    // Receive
    // =========================================================================

    /// Processes one received frame. An error is fatal to the channel.
    fn handle_frame(&self, frame: Bytes) -> UaResult<()> {
        let message_type = frame.get(..3).and_then(MessageType::from_bytes);
        match message_type {
            Some(MessageType::Error) => {
                let mut body = frame;
                MessageHeader::decode(&mut body)?;
                return Err(ErrorMessage::decode(&mut body)?.into_error());
            }
            Some(message_type) if message_type.is_secure() => {}
            other => {
                return Err(ConnectionError::unexpected_message(
                    "OPN, MSG or CLO",
                    other.map_or_else(|| "unknown".to_string(), |t| t.to_string()),
                )
                .into())
            }
        }

        let channel = self.channel_snapshot();
        let outcome = self.pipeline.lock().process(frame, &self.crypto, &channel);
        match outcome {
            Ok(PipelineEvent::Pending { .. }) => Ok(()),
            Ok(PipelineEvent::Complete {
                request_id,
                token_id,
                body,
                ..
            }) => {
                if token_id == Some(channel.token_id) && channel.previous.is_some() {
                    let mut current = self.channel.write();
                    if current.token_id == channel.token_id && current.previous.is_some() {
                        *current = Arc::new(current.without_previous());
                        debug!(token_id = channel.token_id, "Server switched to the renewed token");
                    }
                }
                self.complete(request_id, Ok(body));
                Ok(())
            }
            Ok(PipelineEvent::Aborted {
                request_id,
                status_code,
                reason,
            }) => {
                debug!(
                    request_id,
                    status_code = format_args!("0x{:08X}", status_code),
                    status = status_code_name(status_code).unwrap_or("Unknown"),
                    reason = reason.as_deref().unwrap_or_default(),
                    "Server aborted a partial response, awaiting a resend"
                );
                Ok(())
            }
            Err(failure) => {
                let reason = format!("{} at {}", failure.error, failure.stage);
                let owner = failure
                    .request_id
                    .filter(|request_id| self.pending.lock().contains_key(request_id));
                match (owner, failure.error) {
                    (Some(request_id), error) => self.complete(request_id, Err(error)),
                    (None, UaError::Security(error)) => self.fail_pending(&error),
                    (None, error) => error.log("decoding chunk"),
                }
                Err(ConnectionError::closed(Some(reason)).into())
            }
        }
    }

    /// Hands a security failure that belongs to no known request to every
    /// pending request.
    fn fail_pending(&self, error: &SecurityError) {
        UaError::Security(error.clone()).log("decoding chunk");
        let pending: Vec<Completion> = self.pending.lock().drain().map(|(_, c)| c).collect();
        for completion in pending {
            let _ = completion.send(Err(UaError::Security(error.clone())));
        }
    }

    fn connection_lost(&self, reason: &str) {
        match self.state() {
            SessionState::Closing | SessionState::Closed | SessionState::Disconnected => {
                debug!(reason, "Transport ended")
            }
            _ => {
                warn!(endpoint = %self.config.endpoint, reason, "Connection lost");
                self.teardown(reason);
            }
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Forces the channel closed and fails every pending request.
    fn teardown(&self, reason: &str) {
        self.set_state(SessionState::Closed);
        self.send.lock().writer = None;

        let pending: Vec<Completion> = self.pending.lock().drain().map(|(_, c)| c).collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), reason, "Failing pending requests");
        }
        for completion in pending {
            let _ = completion.send(Err(ConnectionError::closed(Some(reason.to_string())).into()));
        }
        self.pipeline.lock().reset();

        if let Some(connection) = self.connection.lock().take() {
            connection.abort();
            let transport = connection.transport;
            tokio::spawn(async move {
                let _ = transport.close().await;
            });
        }
    }

    async fn disconnect(&self) -> UaResult<()> {
        if let Some(keepalive) = self.connection.lock().as_ref().and_then(|c| c.keepalive.as_ref()) {
            keepalive.stop();
        }

        let close_timeout = self.config.close_timeout;
        let Ok(_handshake) = tokio::time::timeout(close_timeout, self.handshake.lock()).await else {
            // A connect or renewal is stuck waiting on the server. Failing its
            // pending exchange releases the lock; the channel is not usable
            // for a close exchange anyway.
            UaError::from(TimeoutError::close(close_timeout)).log("disconnect");
            self.teardown("session closed during handshake");
            info!(endpoint = %self.config.endpoint, "Disconnected");
            return Ok(());
        };
        let state = self.state();
        if state.can_connect() {
            return Ok(());
        }
        self.set_state(SessionState::Closing);

        let mut connection = self.connection.lock().take();
        let closed =
            tokio::time::timeout(close_timeout, self.close_exchange(state, connection.as_mut())).await;
        if closed.is_err() {
            let error = UaError::from(TimeoutError::close(close_timeout));
            error.log("disconnect");
        }

        self.teardown("session closed");
        if let Some(connection) = connection {
            connection.abort();
            if let Err(e) = connection.transport.close().await {
                debug!(error = %e, "Transport close failed");
            }
        }
        info!(endpoint = %self.config.endpoint, "Disconnected");
        Ok(())
    }

    /// CloseSession, CLO, then wait for the server to hang up.
    async fn close_exchange(&self, state: SessionState, connection: Option<&mut Connection>) {
        let channel = self.channel_snapshot();

        if state.is_active() && !channel.authentication_token.is_null() {
            let request = CloseSessionRequest {
                request_header: self.make_request_header(
                    channel.authentication_token.clone(),
                    self.config.close_timeout,
                ),
                delete_subscriptions: true,
            };
            match self.call::<_, CloseSessionResponse>(&request).await {
                Ok(_) => debug!("Session closed"),
                Err(e) => e.log("CloseSession"),
            }
        }

        if channel.is_open() {
            let request = CloseSecureChannelRequest {
                request_header: self.make_request_header(NodeId::null(), self.config.close_timeout),
            };
            if let Err(e) = self.dispatch(MessageType::CloseSecureChannel, encode_message(&request), None) {
                e.log("CloseSecureChannel");
            }
        }

        self.send.lock().writer = None;
        if let Some(connection) = connection {
            let _ = (&mut connection.writer).await;
            let _ = (&mut connection.reader).await;
        }
    }
}

#[async_trait]
impl Renewable for Shared {
    async fn renew(&self) -> UaResult<()> {
        let result = self.renew_token().await;
        if result.is_err() {
            self.stats.record_renewal_failure();
        }
        result
    }

    fn token_lifetime(&self) -> Duration {
        Duration::from_millis(u64::from(self.channel_snapshot().token_lifetime_ms))
    }

    async fn abandon(&self) {
        if let Err(e) = self.disconnect().await {
            e.log("abandoning channel");
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.abort();
        }
    }
}

// =============================================================================
// I/O tasks
// =============================================================================

async fn read_loop(shared: Weak<Shared>, transport: Arc<dyn Transport>) {
    loop {
        let received = transport.receive().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match received {
            Ok(Some(frame)) => {
                if let Err(e) = shared.handle_frame(frame) {
                    e.log("secure channel");
                    shared.teardown(&e.to_string());
                    break;
                }
            }
            Ok(None) => {
                shared.connection_lost("server closed the connection");
                break;
            }
            Err(e) => {
                shared.connection_lost(&e.to_string());
                break;
            }
        }
    }
    trace!("Reader task stopped");
}

async fn write_loop(
    shared: Weak<Shared>,
    transport: Arc<dyn Transport>,
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = receiver.recv().await {
        if let Err(e) = transport.send(frame).await {
            if let Some(shared) = shared.upgrade() {
                shared.connection_lost(&e.to_string());
            }
            break;
        }
    }
    trace!("Writer task stopped");
}
