// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! The service subset needed to open a channel and run a session.
//!
//! A service message on the wire is the `NodeId` of its binary encoding
//! followed by the encoded structure.

use bytes::{Bytes, BytesMut};

use crate::config::{MessageSecurityMode, SecurityPolicy};
use crate::error::{CodecError, UaError, UaResult};
use crate::protocol::encoding::{
    ua_now, BinaryDecodable, BinaryEncodable, DiagnosticInfo, ExtensionObject, LocalizedText,
    NodeId,
};

/// Binary encoding ids in namespace 0.
pub mod type_ids {
    /// ServiceFault
    pub const SERVICE_FAULT: u32 = 397;
    /// AnonymousIdentityToken
    pub const ANONYMOUS_IDENTITY_TOKEN: u32 = 321;
    /// UserNameIdentityToken
    pub const USER_NAME_IDENTITY_TOKEN: u32 = 324;
    /// GetEndpointsRequest
    pub const GET_ENDPOINTS_REQUEST: u32 = 428;
    /// GetEndpointsResponse
    pub const GET_ENDPOINTS_RESPONSE: u32 = 431;
    /// OpenSecureChannelRequest
    pub const OPEN_SECURE_CHANNEL_REQUEST: u32 = 446;
    /// OpenSecureChannelResponse
    pub const OPEN_SECURE_CHANNEL_RESPONSE: u32 = 449;
    /// CloseSecureChannelRequest
    pub const CLOSE_SECURE_CHANNEL_REQUEST: u32 = 452;
    /// CloseSecureChannelResponse
    pub const CLOSE_SECURE_CHANNEL_RESPONSE: u32 = 455;
    /// CreateSessionRequest
    pub const CREATE_SESSION_REQUEST: u32 = 461;
    /// CreateSessionResponse
    pub const CREATE_SESSION_RESPONSE: u32 = 464;
    /// ActivateSessionRequest
    pub const ACTIVATE_SESSION_REQUEST: u32 = 467;
    /// ActivateSessionResponse
    pub const ACTIVATE_SESSION_RESPONSE: u32 = 470;
    /// CloseSessionRequest
    pub const CLOSE_SESSION_REQUEST: u32 = 473;
    /// CloseSessionResponse
    pub const CLOSE_SESSION_RESPONSE: u32 = 476;
}

/// Asymmetric encryption URI for encrypted user passwords.
pub const RSA_OAEP_URI: &str = "http://www.w3.org/2001/04/xmlenc#rsa-oaep";

/// Request type of OpenSecureChannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityTokenRequestType {
    /// Open a new channel.
    Issue,
    /// Renew the token of an existing channel.
    Renew,
}

impl SecurityTokenRequestType {
    /// Wire value.
    pub const fn value(&self) -> u32 {
        match self {
            Self::Issue => 0,
            Self::Renew => 1,
        }
    }
}

/// User token type advertised in a [`UserTokenPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTokenType {
    /// No credentials.
    Anonymous,
    /// Username and password.
    UserName,
    /// X.509 certificate.
    Certificate,
    /// Token issued by an external authority.
    IssuedToken,
}

impl UserTokenType {
    /// Parses the wire value.
    pub fn from_value(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Anonymous),
            1 => Some(Self::UserName),
            2 => Some(Self::Certificate),
            3 => Some(Self::IssuedToken),
            _ => None,
        }
    }

    /// Wire value.
    pub const fn value(&self) -> u32 {
        match self {
            Self::Anonymous => 0,
            Self::UserName => 1,
            Self::Certificate => 2,
            Self::IssuedToken => 3,
        }
    }
}

// =============================================================================
// Service traits
// =============================================================================

/// A structure with a namespace-0 binary encoding id.
pub trait ServiceMessage {
    /// Binary encoding id.
    const TYPE_ID: u32;
}

/// A request structure.
pub trait ServiceRequest: ServiceMessage + BinaryEncodable + Send {
    /// The request header.
    fn request_header(&self) -> &RequestHeader;
}

/// A response structure.
pub trait ServiceResponse: ServiceMessage + BinaryDecodable + Send {
    /// The response header.
    fn response_header(&self) -> &ResponseHeader;
}

/// Encodes a message body: encoding id followed by the structure.
pub fn encode_message<T: ServiceMessage + BinaryEncodable>(message: &T) -> Bytes {
    let type_id = NodeId::numeric(0, T::TYPE_ID);
    let mut buf = BytesMut::with_capacity(type_id.length_in_bytes() + message.length_in_bytes());
    type_id.encode(&mut buf);
    message.encode(&mut buf);
    buf.freeze()
}

/// A decoded message body whose structure has not been parsed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseBody {
    /// Binary encoding id.
    pub type_id: u32,
    /// Encoded structure after the type id.
    pub body: Bytes,
}

impl ResponseBody {
    /// Splits a reassembled message into type id and body.
    ///
    /// A `ServiceFault` becomes [`UaError::ServiceFault`].
    pub fn parse(message: Bytes) -> UaResult<Self> {
        let mut buf = message;
        let node_id = NodeId::decode(&mut buf)?;
        let type_id = node_id.as_ns0_numeric().ok_or_else(|| {
            CodecError::invalid_value("TypeId", format!("unexpected encoding id {}", node_id))
        })?;
        if type_id == type_ids::SERVICE_FAULT {
            let fault = ServiceFault::decode(&mut buf)?;
            return Err(UaError::service_fault(fault.response_header.service_result));
        }
        Ok(Self { type_id, body: buf })
    }

    /// Decodes the body as `T`, checking the encoding id.
    pub fn decode<T: ServiceMessage + BinaryDecodable>(self) -> UaResult<T> {
        if self.type_id != T::TYPE_ID {
            return Err(CodecError::UnexpectedType {
                expected: T::TYPE_ID,
                actual: self.type_id,
            }
            .into());
        }
        let mut body = self.body;
        Ok(T::decode(&mut body)?)
    }
}

// =============================================================================
// Structures
// =============================================================================

macro_rules! ua_structure {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Default)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl BinaryEncodable for $name {
            fn length_in_bytes(&self) -> usize {
                0 $( + self.$field.length_in_bytes() )*
            }

            #[allow(unused_variables)]
            fn encode(&self, buf: &mut BytesMut) {
                $( self.$field.encode(buf); )*
            }
        }

        impl BinaryDecodable for $name {
            #[allow(unused_variables)]
            fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
                Ok(Self {
                    $( $field: <$ty as BinaryDecodable>::decode(buf)?, )*
                })
            }
        }
    };
}

macro_rules! service_message {
    ($name:ident, $id:expr) => {
        impl ServiceMessage for $name {
            const TYPE_ID: u32 = $id;
        }
    };
    ($name:ident, $id:expr, request) => {
        service_message!($name, $id);

        impl ServiceRequest for $name {
            fn request_header(&self) -> &RequestHeader {
                &self.request_header
            }
        }
    };
    ($name:ident, $id:expr, response) => {
        service_message!($name, $id);

        impl ServiceResponse for $name {
            fn response_header(&self) -> &ResponseHeader {
                &self.response_header
            }
        }
    };
}

ua_structure! {
    /// Common request header.
    pub struct RequestHeader {
        /// Session authentication token, null before CreateSession.
        pub authentication_token: NodeId,
        /// Time the request was sent.
        pub timestamp: i64,
        /// Client assigned handle echoed in the response.
        pub request_handle: u32,
        /// Diagnostics mask.
        pub return_diagnostics: u32,
        /// Audit log entry id.
        pub audit_entry_id: Option<String>,
        /// Timeout hint in milliseconds.
        pub timeout_hint: u32,
        /// Reserved.
        pub additional_header: ExtensionObject,
    }
}

impl RequestHeader {
    /// Creates a header stamped with the current time.
    pub fn new(authentication_token: NodeId, request_handle: u32, timeout_hint: u32) -> Self {
        Self {
            authentication_token,
            timestamp: ua_now(),
            request_handle,
            timeout_hint,
            ..Default::default()
        }
    }
}

ua_structure! {
    /// Common response header.
    pub struct ResponseHeader {
        /// Time the response was sent.
        pub timestamp: i64,
        /// Echo of the request handle.
        pub request_handle: u32,
        /// Overall result.
        pub service_result: u32,
        /// Diagnostics for the service result.
        pub service_diagnostics: DiagnosticInfo,
        /// Strings referenced by diagnostics.
        pub string_table: Vec<Option<String>>,
        /// Reserved.
        pub additional_header: ExtensionObject,
    }
}

impl ResponseHeader {
    /// Creates a good response header for `request_handle`.
    pub fn good(request_handle: u32) -> Self {
        Self {
            timestamp: ua_now(),
            request_handle,
            ..Default::default()
        }
    }

    /// Returns `true` when the service result is bad.
    pub fn is_bad(&self) -> bool {
        self.service_result & 0x8000_0000 != 0
    }
}

ua_structure! {
    /// Security token of an open channel.
    pub struct ChannelSecurityToken {
        /// Secure channel id.
        pub channel_id: u32,
        /// Token id.
        pub token_id: u32,
        /// Creation time.
        pub created_at: i64,
        /// Lifetime in milliseconds as revised by the server.
        pub revised_lifetime: u32,
    }
}

ua_structure! {
    /// OpenSecureChannel request.
    pub struct OpenSecureChannelRequest {
        /// Header.
        pub request_header: RequestHeader,
        /// Protocol version.
        pub client_protocol_version: u32,
        /// Issue or renew.
        pub request_type: u32,
        /// Requested security mode.
        pub security_mode: u32,
        /// Client nonce.
        pub client_nonce: Option<Bytes>,
        /// Requested token lifetime in milliseconds.
        pub requested_lifetime: u32,
    }
}
service_message!(OpenSecureChannelRequest, type_ids::OPEN_SECURE_CHANNEL_REQUEST, request);

ua_structure! {
    /// OpenSecureChannel response.
    pub struct OpenSecureChannelResponse {
        /// Header.
        pub response_header: ResponseHeader,
        /// Protocol version.
        pub server_protocol_version: u32,
        /// New security token.
        pub security_token: ChannelSecurityToken,
        /// Server nonce.
        pub server_nonce: Option<Bytes>,
    }
}
service_message!(OpenSecureChannelResponse, type_ids::OPEN_SECURE_CHANNEL_RESPONSE, response);

ua_structure! {
    /// CloseSecureChannel request. No response is sent.
    pub struct CloseSecureChannelRequest {
        /// Header.
        pub request_header: RequestHeader,
    }
}
service_message!(CloseSecureChannelRequest, type_ids::CLOSE_SECURE_CHANNEL_REQUEST, request);

ua_structure! {
    /// Description of a client or server application.
    pub struct ApplicationDescription {
        /// Application URI.
        pub application_uri: Option<String>,
        /// Product URI.
        pub product_uri: Option<String>,
        /// Display name.
        pub application_name: LocalizedText,
        /// 0 server, 1 client, 2 both, 3 discovery server.
        pub application_type: u32,
        /// Gateway server URI.
        pub gateway_server_uri: Option<String>,
        /// Discovery profile URI.
        pub discovery_profile_uri: Option<String>,
        /// Discovery URLs.
        pub discovery_urls: Vec<Option<String>>,
    }
}

ua_structure! {
    /// A user token the server accepts on an endpoint.
    pub struct UserTokenPolicy {
        /// Policy id to put in the identity token.
        pub policy_id: Option<String>,
        /// See [`UserTokenType`].
        pub token_type: u32,
        /// Issued token type.
        pub issued_token_type: Option<String>,
        /// Issuer endpoint.
        pub issuer_endpoint_url: Option<String>,
        /// Policy used to secure the token, if different from the channel.
        pub security_policy_uri: Option<String>,
    }
}

impl UserTokenPolicy {
    /// Parsed token type.
    pub fn user_token_type(&self) -> Option<UserTokenType> {
        UserTokenType::from_value(self.token_type)
    }
}

ua_structure! {
    /// A server endpoint.
    pub struct EndpointDescription {
        /// Endpoint URL.
        pub endpoint_url: Option<String>,
        /// Server description.
        pub server: ApplicationDescription,
        /// DER server certificate.
        pub server_certificate: Option<Bytes>,
        /// Security mode wire value.
        pub security_mode: u32,
        /// Security policy URI.
        pub security_policy_uri: Option<String>,
        /// Accepted user tokens.
        pub user_identity_tokens: Vec<UserTokenPolicy>,
        /// Transport profile URI.
        pub transport_profile_uri: Option<String>,
        /// Relative security level.
        pub security_level: u8,
    }
}

impl EndpointDescription {
    /// Parsed security mode.
    pub fn message_security_mode(&self) -> Option<MessageSecurityMode> {
        MessageSecurityMode::from_value(self.security_mode)
    }

    /// Parsed security policy.
    pub fn security_policy(&self) -> Option<SecurityPolicy> {
        self.security_policy_uri
            .as_deref()
            .and_then(|uri| SecurityPolicy::from_uri(uri).ok())
    }
}

ua_structure! {
    /// GetEndpoints request.
    pub struct GetEndpointsRequest {
        /// Header.
        pub request_header: RequestHeader,
        /// URL the client used.
        pub endpoint_url: Option<String>,
        /// Preferred locales.
        pub locale_ids: Vec<Option<String>>,
        /// Transport profile filter.
        pub profile_uris: Vec<Option<String>>,
    }
}
service_message!(GetEndpointsRequest, type_ids::GET_ENDPOINTS_REQUEST, request);

ua_structure! {
    /// GetEndpoints response.
    pub struct GetEndpointsResponse {
        /// Header.
        pub response_header: ResponseHeader,
        /// Endpoints.
        pub endpoints: Vec<EndpointDescription>,
    }
}
service_message!(GetEndpointsResponse, type_ids::GET_ENDPOINTS_RESPONSE, response);

ua_structure! {
    /// Algorithm URI and signature bytes.
    pub struct SignatureData {
        /// Signature algorithm URI.
        pub algorithm: Option<String>,
        /// Signature.
        pub signature: Option<Bytes>,
    }
}

ua_structure! {
    /// Software certificate and its signature.
    pub struct SignedSoftwareCertificate {
        /// Certificate.
        pub certificate_data: Option<Bytes>,
        /// Signature.
        pub signature: Option<Bytes>,
    }
}

ua_structure! {
    /// CreateSession request.
    pub struct CreateSessionRequest {
        /// Header.
        pub request_header: RequestHeader,
        /// Client application.
        pub client_description: ApplicationDescription,
        /// Server URI.
        pub server_uri: Option<String>,
        /// Endpoint URL.
        pub endpoint_url: Option<String>,
        /// Human readable session name.
        pub session_name: Option<String>,
        /// 32-byte client nonce.
        pub client_nonce: Option<Bytes>,
        /// DER client certificate.
        pub client_certificate: Option<Bytes>,
        /// Requested session timeout in milliseconds.
        pub requested_session_timeout: f64,
        /// Largest response the client accepts.
        pub max_response_message_size: u32,
    }
}
service_message!(CreateSessionRequest, type_ids::CREATE_SESSION_REQUEST, request);

ua_structure! {
    /// CreateSession response.
    pub struct CreateSessionResponse {
        /// Header.
        pub response_header: ResponseHeader,
        /// Session id.
        pub session_id: NodeId,
        /// Token to put in every subsequent request header.
        pub authentication_token: NodeId,
        /// Session timeout in milliseconds as revised by the server.
        pub revised_session_timeout: f64,
        /// Server nonce for ActivateSession.
        pub server_nonce: Option<Bytes>,
        /// DER server certificate.
        pub server_certificate: Option<Bytes>,
        /// Server endpoints.
        pub server_endpoints: Vec<EndpointDescription>,
        /// Server software certificates.
        pub server_software_certificates: Vec<SignedSoftwareCertificate>,
        /// Signature over client certificate and client nonce.
        pub server_signature: SignatureData,
        /// Largest request the server accepts.
        pub max_request_message_size: u32,
    }
}
service_message!(CreateSessionResponse, type_ids::CREATE_SESSION_RESPONSE, response);

ua_structure! {
    /// ActivateSession request.
    pub struct ActivateSessionRequest {
        /// Header.
        pub request_header: RequestHeader,
        /// Signature over server certificate and server nonce.
        pub client_signature: SignatureData,
        /// Client software certificates.
        pub client_software_certificates: Vec<SignedSoftwareCertificate>,
        /// Preferred locales.
        pub locale_ids: Vec<Option<String>>,
        /// Identity token.
        pub user_identity_token: ExtensionObject,
        /// Signature for certificate identity tokens.
        pub user_token_signature: SignatureData,
    }
}
service_message!(ActivateSessionRequest, type_ids::ACTIVATE_SESSION_REQUEST, request);

ua_structure! {
    /// ActivateSession response.
    pub struct ActivateSessionResponse {
        /// Header.
        pub response_header: ResponseHeader,
        /// Next server nonce.
        pub server_nonce: Option<Bytes>,
        /// Software certificate results.
        pub results: Vec<u32>,
        /// Diagnostics for `results`.
        pub diagnostic_infos: Vec<DiagnosticInfo>,
    }
}
service_message!(ActivateSessionResponse, type_ids::ACTIVATE_SESSION_RESPONSE, response);

ua_structure! {
    /// CloseSession request.
    pub struct CloseSessionRequest {
        /// Header.
        pub request_header: RequestHeader,
        /// Delete subscriptions owned by the session.
        pub delete_subscriptions: bool,
    }
}
service_message!(CloseSessionRequest, type_ids::CLOSE_SESSION_REQUEST, request);

ua_structure! {
    /// CloseSession response.
    pub struct CloseSessionResponse {
        /// Header.
        pub response_header: ResponseHeader,
    }
}
service_message!(CloseSessionResponse, type_ids::CLOSE_SESSION_RESPONSE, response);

ua_structure! {
    /// Returned instead of a response when a service fails.
    pub struct ServiceFault {
        /// Header carrying the failure status.
        pub response_header: ResponseHeader,
    }
}
service_message!(ServiceFault, type_ids::SERVICE_FAULT, response);

ua_structure! {
    /// Anonymous identity.
    pub struct AnonymousIdentityToken {
        /// Policy id from the endpoint.
        pub policy_id: Option<String>,
    }
}
service_message!(AnonymousIdentityToken, type_ids::ANONYMOUS_IDENTITY_TOKEN);

ua_structure! {
    /// Username identity with an encrypted password.
    pub struct UserNameIdentityToken {
        /// Policy id from the endpoint.
        pub policy_id: Option<String>,
        /// Username.
        pub user_name: Option<String>,
        /// Password, encrypted unless `encryption_algorithm` is null.
        pub password: Option<Bytes>,
        /// Encryption algorithm URI.
        pub encryption_algorithm: Option<String>,
    }
}
service_message!(UserNameIdentityToken, type_ids::USER_NAME_IDENTITY_TOKEN);

/// Wraps an identity token in an [`ExtensionObject`].
pub fn identity_token<T: ServiceMessage + BinaryEncodable>(token: &T) -> ExtensionObject {
    ExtensionObject::from_encodable(T::TYPE_ID, token)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_prefix_is_encoding_id() {
        let request = CloseSessionRequest {
            request_header: RequestHeader::new(NodeId::null(), 9, 1000),
            delete_subscriptions: true,
        };
        let bytes = encode_message(&request);
        // four-byte node id encoding for 473
        assert_eq!(&bytes[..4], &[0x01, 0x00, 0xD9, 0x01]);

        let parsed = ResponseBody::parse(bytes).unwrap();
        assert_eq!(parsed.type_id, type_ids::CLOSE_SESSION_REQUEST);
        let decoded: CloseSessionRequest = parsed.decode().unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_service_fault_maps_to_error() {
        let fault = ServiceFault {
            response_header: ResponseHeader {
                service_result: 0x8025_0000,
                ..ResponseHeader::good(4)
            },
        };
        let err = ResponseBody::parse(encode_message(&fault)).unwrap_err();
        match err {
            UaError::ServiceFault {
                status_code,
                status_name,
            } => {
                assert_eq!(status_code, 0x8025_0000);
                assert_eq!(status_name, "BadSessionIdInvalid");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_type() {
        let response = CloseSessionResponse {
            response_header: ResponseHeader::good(1),
        };
        let parsed = ResponseBody::parse(encode_message(&response)).unwrap();
        let err = parsed.decode::<ActivateSessionResponse>().unwrap_err();
        assert!(matches!(
            err,
            UaError::Codec(CodecError::UnexpectedType { expected: 470, actual: 476 })
        ));
    }

    #[test]
    fn test_create_session_response_decodes() {
        let response = CreateSessionResponse {
            response_header: ResponseHeader::good(2),
            session_id: NodeId::numeric(1, 1000),
            authentication_token: NodeId::opaque(0, Bytes::from_static(b"auth")),
            revised_session_timeout: 60_000.0,
            server_nonce: Some(Bytes::from(vec![7u8; 32])),
            server_endpoints: vec![EndpointDescription {
                endpoint_url: Some("opc.tcp://localhost:4840".into()),
                security_mode: 1,
                security_policy_uri: Some(SecurityPolicy::None.uri().into()),
                user_identity_tokens: vec![UserTokenPolicy {
                    policy_id: Some("anonymous".into()),
                    token_type: 0,
                    ..Default::default()
                }],
                ..Default::default()
            }],
            max_request_message_size: 65_536,
            ..Default::default()
        };
        let decoded: CreateSessionResponse = ResponseBody::parse(encode_message(&response))
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(decoded, response);
        assert_eq!(
            decoded.server_endpoints[0].message_security_mode(),
            Some(MessageSecurityMode::None)
        );
        assert_eq!(
            decoded.server_endpoints[0].user_identity_tokens[0].user_token_type(),
            Some(UserTokenType::Anonymous)
        );
    }

    #[test]
    fn test_identity_token_extension_object() {
        let token = UserNameIdentityToken {
            policy_id: Some("username".into()),
            user_name: Some("operator".into()),
            password: Some(Bytes::from_static(b"secret")),
            encryption_algorithm: None,
        };
        let ext = identity_token(&token);
        assert_eq!(ext.type_id, NodeId::numeric(0, 324));
        let decoded: UserNameIdentityToken = ext.decode_body().unwrap().unwrap();
        assert_eq!(decoded, token);
    }
}
