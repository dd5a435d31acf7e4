// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Choosing a server endpoint and user token policy.

use crate::config::{MessageSecurityMode, SecurityPolicy, UserIdentity};
use crate::error::SessionError;
use crate::protocol::services::{EndpointDescription, UserTokenPolicy, UserTokenType};

/// An endpoint together with the token policy the identity will use.
pub type SelectedEndpoint<'a> = (&'a EndpointDescription, &'a UserTokenPolicy);

/// Picks the endpoint to authenticate against.
///
/// An endpoint qualifies when its URL matches `endpoint_url` and its policy
/// or mode matches ours; the identity must fit one of its token policies.
/// Among qualifying endpoints the lowest security level wins.
pub fn select_endpoint<'a>(
    endpoints: &'a [EndpointDescription],
    endpoint_url: &str,
    policy: SecurityPolicy,
    mode: MessageSecurityMode,
    identity: &UserIdentity,
) -> Result<SelectedEndpoint<'a>, SessionError> {
    let mode = if policy == SecurityPolicy::None {
        MessageSecurityMode::None
    } else {
        mode
    };

    endpoints
        .iter()
        .filter(|endpoint| {
            endpoint
                .endpoint_url
                .as_deref()
                .is_some_and(|url| url_matches(url, endpoint_url))
        })
        .filter(|endpoint| {
            endpoint.security_policy_uri.as_deref() == Some(policy.uri())
                || endpoint.message_security_mode() == Some(mode)
        })
        .flat_map(|endpoint| {
            endpoint
                .user_identity_tokens
                .iter()
                .filter(|token| token_matches(token, identity))
                .map(move |token| (endpoint, token))
        })
        .min_by_key(|(endpoint, _)| endpoint.security_level)
        .ok_or_else(|| SessionError::NoCompatibleEndpoint {
            endpoint: endpoint_url.to_string(),
            policy: policy.name().to_string(),
            mode: mode.name().to_string(),
        })
}

fn token_matches(token: &UserTokenPolicy, identity: &UserIdentity) -> bool {
    matches!(
        (token.user_token_type(), identity),
        (Some(UserTokenType::Anonymous), UserIdentity::Anonymous)
            | (Some(UserTokenType::UserName), UserIdentity::UserName { .. })
    )
}

/// Servers often advertise a hostname where the client dialled an address,
/// so besides a plain prefix match, equal port and path are accepted.
fn url_matches(offered: &str, configured: &str) -> bool {
    let configured = configured.trim_end_matches('/');
    if offered.starts_with(configured) {
        return true;
    }
    match (split_url(offered), split_url(configured)) {
        (Some((_, offered_port, offered_path)), Some((_, port, path))) => {
            offered_port == port && offered_path.trim_end_matches('/') == path.trim_end_matches('/')
        }
        _ => false,
    }
}

fn split_url(url: &str) -> Option<(&str, &str, &str)> {
    let rest = url.strip_prefix("opc.tcp://")?;
    let (authority, path) = match rest.find('/') {
        Some(index) => rest.split_at(index),
        None => (rest, ""),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => (host, port),
        _ => (authority, "4840"),
    };
    Some((host, port, path))
}
