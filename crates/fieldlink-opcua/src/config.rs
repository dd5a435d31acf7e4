// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Secure channel configuration.
//!
//! - **MessageSecurityMode / SecurityPolicy**: the closed set of modes and
//!   policies the channel can run under
//! - **UserIdentity**: how the session authenticates
//! - **ChannelConfig**: endpoint, limits, timeouts and policies with a builder
//!
//! # Examples
//!
//! ```
//! use fieldlink_opcua::config::{ChannelConfig, MessageSecurityMode, SecurityPolicy};
//!
//! let config = ChannelConfig::builder()
//!     .endpoint("opc.tcp://plc-01:4840")
//!     .security_mode(MessageSecurityMode::SignAndEncrypt)
//!     .security_policy(SecurityPolicy::Basic256Sha256)
//!     .username("operator", "secret")
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.host_and_port().unwrap(), ("plc-01".to_string(), 4840));
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, SecurityError, UaError, UaResult};
use crate::protocol::hello::ProtocolLimits;

/// Default OPC UA TCP port.
pub const DEFAULT_PORT: u16 = 4840;

/// Smallest buffer size a peer may announce.
pub const MIN_BUFFER_SIZE: u32 = 8192;

// =============================================================================
// MessageSecurityMode
// =============================================================================

/// OPC UA message security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageSecurityMode {
    /// Messages are neither signed nor encrypted.
    #[default]
    None,

    /// Messages are signed but not encrypted.
    Sign,

    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

impl MessageSecurityMode {
    /// Returns the wire value.
    pub const fn value(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Sign => 2,
            Self::SignAndEncrypt => 3,
        }
    }

    /// Creates from the wire value.
    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Sign),
            3 => Some(Self::SignAndEncrypt),
            _ => Option::None,
        }
    }

    /// Returns `true` if this mode signs messages.
    #[inline]
    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Sign | Self::SignAndEncrypt)
    }

    /// Returns `true` if this mode encrypts messages.
    #[inline]
    pub const fn is_encrypted(&self) -> bool {
        matches!(self, Self::SignAndEncrypt)
    }

    /// Returns the display name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Sign => "Sign",
            Self::SignAndEncrypt => "SignAndEncrypt",
        }
    }
}

impl fmt::Display for MessageSecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for MessageSecurityMode {
    type Err = UaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "sign" => Ok(Self::Sign),
            "signandencrypt" | "signencrypt" => Ok(Self::SignAndEncrypt),
            _ => Err(UaError::configuration(ConfigurationError::invalid_security(
                format!("unknown security mode '{}'", s),
            ))),
        }
    }
}

// =============================================================================
// SecurityPolicy
// =============================================================================

/// OPC UA security policy.
///
/// Only the policies built on RSA and AES-CBC are modeled. Cryptographic
/// parameters live in [`crate::security::policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    /// No security.
    #[default]
    None,

    /// Basic128Rsa15 (legacy).
    Basic128Rsa15,

    /// Basic256Sha256.
    Basic256Sha256,
}

impl SecurityPolicy {
    /// Returns the policy URI.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            Self::Basic128Rsa15 => "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15",
            Self::Basic256Sha256 => "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
        }
    }

    /// Returns the short name.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Basic128Rsa15 => "Basic128Rsa15",
            Self::Basic256Sha256 => "Basic256Sha256",
        }
    }

    /// Resolves a policy from its URI.
    pub fn from_uri(uri: &str) -> Result<Self, SecurityError> {
        [Self::None, Self::Basic128Rsa15, Self::Basic256Sha256]
            .into_iter()
            .find(|policy| policy.uri() == uri)
            .ok_or_else(|| SecurityError::UnsupportedPolicy {
                uri: uri.to_string(),
            })
    }

    /// Returns `true` if this policy needs certificates on both sides.
    #[inline]
    pub const fn requires_certificates(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SecurityPolicy {
    type Err = UaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('#') {
            return Self::from_uri(s).map_err(UaError::from);
        }
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "none" => Ok(Self::None),
            "basic128rsa15" => Ok(Self::Basic128Rsa15),
            "basic256sha256" => Ok(Self::Basic256Sha256),
            _ => Err(UaError::configuration(ConfigurationError::invalid_security(
                format!("unknown security policy '{}'", s),
            ))),
        }
    }
}

// =============================================================================
// UserIdentity
// =============================================================================

/// Identity presented in ActivateSession.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserIdentity {
    /// Anonymous login.
    #[default]
    Anonymous,

    /// Username and password; the password is encrypted with the server key.
    UserName {
        /// The username.
        username: String,
        /// The password.
        password: String,
    },
}

impl UserIdentity {
    /// Returns `true` if this is anonymous authentication.
    #[inline]
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// Returns the type name.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Anonymous => "Anonymous",
            Self::UserName { .. } => "UserName",
        }
    }
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::UserName { username, .. } => f
                .debug_struct("UserName")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::UserName { username, .. } => write!(f, "UserName({})", username),
        }
    }
}

// =============================================================================
// RequestHandlePolicy
// =============================================================================

/// What to do when an ActivateSession response does not echo the request handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestHandlePolicy {
    /// Log a warning and continue.
    #[default]
    Warn,

    /// Fail the activation.
    Reject,
}

// =============================================================================
// ChannelConfig
// =============================================================================

/// Secure channel and session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Server endpoint URL (e.g., "opc.tcp://localhost:4840").
    pub endpoint: String,

    /// Message security mode.
    #[serde(default)]
    pub security_mode: MessageSecurityMode,

    /// Security policy.
    #[serde(default)]
    pub security_policy: SecurityPolicy,

    /// User identity.
    #[serde(default)]
    pub identity: UserIdentity,

    /// Application name sent in CreateSession.
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Application URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_uri: Option<String>,

    /// Product URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_uri: Option<String>,

    /// Session name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,

    /// Limits proposed in Hello.
    #[serde(default)]
    pub limits: ProtocolLimits,

    /// Timeout for Hello and OpenSecureChannel.
    #[serde(default = "default_negotiation_timeout")]
    #[serde(with = "humantime_serde")]
    pub negotiation_timeout: Duration,

    /// Timeout for service requests.
    #[serde(default = "default_request_timeout")]
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Requested security token lifetime.
    #[serde(default = "default_channel_lifetime")]
    #[serde(with = "humantime_serde")]
    pub channel_lifetime: Duration,

    /// Requested session timeout.
    #[serde(default = "default_session_timeout")]
    #[serde(with = "humantime_serde")]
    pub session_timeout: Duration,

    /// Upper bound on the close exchange.
    #[serde(default = "default_close_timeout")]
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,

    /// Largest transaction id before wrapping back to 1.
    #[serde(default = "default_max_transaction_id")]
    pub max_transaction_id: u32,

    /// ActivateSession request handle mismatch policy.
    #[serde(default)]
    pub request_handle_policy: RequestHandlePolicy,

    /// Consecutive renewal failures before the keepalive loop disconnects.
    ///
    /// `None` retries forever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_failure_limit: Option<u32>,

    /// Path to the client certificate (PEM or DER).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_path: Option<String>,

    /// Path to the client private key (PEM or DER).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,

    /// Path to the server certificate, if known ahead of time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_certificate_path: Option<String>,
}

fn default_application_name() -> String {
    "fieldlink OPC UA client".to_string()
}

fn default_negotiation_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_channel_lifetime() -> Duration {
    Duration::from_millis(3_600_000)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_transaction_id() -> u32 {
    u32::MAX
}

impl ChannelConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ChannelConfigBuilder {
        ChannelConfigBuilder::default()
    }

    /// Creates a configuration with just the endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Validates this configuration.
    pub fn validate(&self) -> UaResult<()> {
        if self.endpoint.is_empty() {
            return Err(UaError::configuration(ConfigurationError::missing_field(
                "endpoint",
            )));
        }

        self.host_and_port()?;

        if self.security_mode != MessageSecurityMode::None
            && self.security_policy == SecurityPolicy::None
        {
            return Err(UaError::configuration(ConfigurationError::invalid_security(
                "Security mode requires a security policy other than None",
            )));
        }

        if self.security_mode == MessageSecurityMode::None
            && self.security_policy != SecurityPolicy::None
        {
            return Err(UaError::configuration(ConfigurationError::invalid_security(
                "Security policy requires a security mode other than None",
            )));
        }

        for (name, duration) in [
            ("negotiation_timeout", self.negotiation_timeout),
            ("request_timeout", self.request_timeout),
            ("channel_lifetime", self.channel_lifetime),
            ("session_timeout", self.session_timeout),
            ("close_timeout", self.close_timeout),
        ] {
            if duration.is_zero() {
                return Err(UaError::configuration(ConfigurationError::invalid_timeout(
                    duration,
                    format!("{} must be greater than 0", name),
                )));
            }
        }

        if self.channel_lifetime.as_millis() > u128::from(u32::MAX) {
            return Err(UaError::configuration(ConfigurationError::invalid_timeout(
                self.channel_lifetime,
                "channel_lifetime must fit in 32 bits of milliseconds",
            )));
        }

        self.limits.validate()?;

        if self.max_transaction_id == 0 {
            return Err(UaError::configuration(ConfigurationError::invalid_limit(
                "max_transaction_id",
                0,
                "must be at least 1",
            )));
        }

        Ok(())
    }

    /// Splits the endpoint into host and port.
    pub fn host_and_port(&self) -> UaResult<(String, u16)> {
        let invalid = |reason: &str| {
            UaError::configuration(ConfigurationError::invalid_endpoint(&self.endpoint, reason))
        };

        let rest = self
            .endpoint
            .strip_prefix("opc.tcp://")
            .ok_or_else(|| invalid("Endpoint must start with opc.tcp://"))?;
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(invalid("Endpoint has no host"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("Unterminated IPv6 address"))?;
            (host, tail.strip_prefix(':'))
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| invalid("Port is not a number"))?,
            None => DEFAULT_PORT,
        };
        Ok((host.to_string(), port))
    }

    /// Returns the effective application URI.
    pub fn effective_application_uri(&self) -> String {
        self.application_uri.clone().unwrap_or_else(|| {
            format!(
                "urn:fieldlink:opcua:{}",
                self.application_name.replace(' ', "")
            )
        })
    }

    /// Returns the effective product URI.
    pub fn effective_product_uri(&self) -> String {
        self.product_uri
            .clone()
            .unwrap_or_else(|| "urn:fieldlink:opcua".to_string())
    }

    /// Returns the effective session name.
    pub fn effective_session_name(&self) -> String {
        self.session_name.clone().unwrap_or_else(|| {
            format!("UaSession:{}:{}", self.application_name, uuid::Uuid::new_v4().simple())
        })
    }

    /// Returns `true` if this configuration uses security.
    #[inline]
    pub fn uses_security(&self) -> bool {
        self.security_mode != MessageSecurityMode::None
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            security_mode: MessageSecurityMode::default(),
            security_policy: SecurityPolicy::default(),
            identity: UserIdentity::default(),
            application_name: default_application_name(),
            application_uri: None,
            product_uri: None,
            session_name: None,
            limits: ProtocolLimits::default(),
            negotiation_timeout: default_negotiation_timeout(),
            request_timeout: default_request_timeout(),
            channel_lifetime: default_channel_lifetime(),
            session_timeout: default_session_timeout(),
            close_timeout: default_close_timeout(),
            max_transaction_id: default_max_transaction_id(),
            request_handle_policy: RequestHandlePolicy::default(),
            keepalive_failure_limit: None,
            certificate_path: None,
            private_key_path: None,
            server_certificate_path: None,
        }
    }
}

// =============================================================================
// ChannelConfigBuilder
// =============================================================================

/// Builder for [`ChannelConfig`].
#[derive(Debug, Default)]
pub struct ChannelConfigBuilder {
    config: ChannelConfig,
    endpoint_set: bool,
}

impl ChannelConfigBuilder {
    /// Sets the endpoint URL.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self.endpoint_set = true;
        self
    }

    /// Sets the security mode.
    pub fn security_mode(mut self, mode: MessageSecurityMode) -> Self {
        self.config.security_mode = mode;
        self
    }

    /// Sets the security policy.
    pub fn security_policy(mut self, policy: SecurityPolicy) -> Self {
        self.config.security_policy = policy;
        self
    }

    /// Sets username/password authentication.
    pub fn username(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.identity = UserIdentity::UserName {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    /// Sets the user identity.
    pub fn identity(mut self, identity: UserIdentity) -> Self {
        self.config.identity = identity;
        self
    }

    /// Sets the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self
    }

    /// Sets the application URI.
    pub fn application_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.application_uri = Some(uri.into());
        self
    }

    /// Sets the product URI.
    pub fn product_uri(mut self, uri: impl Into<String>) -> Self {
        self.config.product_uri = Some(uri.into());
        self
    }

    /// Sets the session name.
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.config.session_name = Some(name.into());
        self
    }

    /// Sets the limits proposed in Hello.
    pub fn limits(mut self, limits: ProtocolLimits) -> Self {
        self.config.limits = limits;
        self
    }

    /// Sets the negotiation timeout.
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Sets the requested token lifetime.
    pub fn channel_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.channel_lifetime = lifetime;
        self
    }

    /// Sets the requested session timeout.
    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Sets the close timeout.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Sets the largest transaction id.
    pub fn max_transaction_id(mut self, max: u32) -> Self {
        self.config.max_transaction_id = max;
        self
    }

    /// Sets the request handle mismatch policy.
    pub fn request_handle_policy(mut self, policy: RequestHandlePolicy) -> Self {
        self.config.request_handle_policy = policy;
        self
    }

    /// Sets the keepalive failure limit.
    pub fn keepalive_failure_limit(mut self, limit: u32) -> Self {
        self.config.keepalive_failure_limit = Some(limit);
        self
    }

    /// Sets the client certificate and private key paths.
    pub fn certificate(
        mut self,
        certificate_path: impl Into<String>,
        private_key_path: impl Into<String>,
    ) -> Self {
        self.config.certificate_path = Some(certificate_path.into());
        self.config.private_key_path = Some(private_key_path.into());
        self
    }

    /// Sets the server certificate path.
    pub fn server_certificate(mut self, path: impl Into<String>) -> Self {
        self.config.server_certificate_path = Some(path.into());
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> UaResult<ChannelConfig> {
        if !self.endpoint_set {
            return Err(UaError::configuration(ConfigurationError::missing_field(
                "endpoint",
            )));
        }
        self.config.validate()?;
        Ok(self.config)
    }
}

// =============================================================================
// Serde helpers
// =============================================================================

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*duration)
            .to_string()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
