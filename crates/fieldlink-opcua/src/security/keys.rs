// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Symmetric key derivation.
//!
//! Keys come from the P_SHA1 / P_SHA256 pseudo random function of RFC 2246:
//!
//! ```text
//! A(0) = seed
//! A(i) = HMAC(secret, A(i-1))
//! P    = HMAC(secret, A(1) ‖ seed) ‖ HMAC(secret, A(2) ‖ seed) ‖ ...
//! ```

use std::fmt;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use crate::config::SecurityPolicy;
use crate::error::SecurityError;
use crate::security::policy::HashAlgorithm;

/// Expands `secret` and `seed` into `length` bytes.
pub fn p_hash(
    hash: HashAlgorithm,
    secret: &[u8],
    seed: &[u8],
    length: usize,
) -> Result<Vec<u8>, SecurityError> {
    match hash {
        HashAlgorithm::Sha1 => expand::<Hmac<Sha1>>(secret, seed, length),
        HashAlgorithm::Sha256 => expand::<Hmac<Sha256>>(secret, seed, length),
    }
}

fn expand<M: Mac + hmac::digest::KeyInit>(
    secret: &[u8],
    seed: &[u8],
    length: usize,
) -> Result<Vec<u8>, SecurityError> {
    let new_mac = || {
        <M as hmac::digest::KeyInit>::new_from_slice(secret)
            .map_err(|e| SecurityError::signing_failed(format!("invalid PRF secret: {}", e)))
    };

    let mut output = Vec::with_capacity(length);
    let mut a = seed.to_vec();
    while output.len() < length {
        let mut mac = new_mac()?;
        mac.update(&a);
        a = mac.finalize().into_bytes().to_vec();

        let mut mac = new_mac()?;
        mac.update(&a);
        mac.update(seed);
        output.extend_from_slice(&mac.finalize().into_bytes());
    }
    output.truncate(length);
    Ok(output)
}

/// Signing key, encryption key and IV for one direction.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKeys {
    /// HMAC key.
    pub signing_key: Vec<u8>,
    /// AES key.
    pub encryption_key: Vec<u8>,
    /// AES-CBC initialization vector.
    pub iv: Vec<u8>,
}

impl SymmetricKeys {
    /// Derives one direction's keys for `policy`.
    pub fn derive(
        policy: SecurityPolicy,
        secret: &[u8],
        seed: &[u8],
    ) -> Result<Self, SecurityError> {
        let hash = policy.hash_algorithm().ok_or_else(|| {
            SecurityError::missing_credential("key derivation algorithm", policy.uri())
        })?;
        let signing_len = policy.symmetric_signing_key_length();
        let encryption_len = policy.symmetric_encryption_key_length();

        let material = p_hash(hash, secret, seed, policy.derived_key_material_length())?;
        let (signing_key, rest) = material.split_at(signing_len);
        let (encryption_key, iv) = rest.split_at(encryption_len);

        Ok(Self {
            signing_key: signing_key.to_vec(),
            encryption_key: encryption_key.to_vec(),
            iv: iv.to_vec(),
        })
    }
}

impl fmt::Debug for SymmetricKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKeys")
            .field("signing_key", &format_args!("<{} bytes>", self.signing_key.len()))
            .field("encryption_key", &format_args!("<{} bytes>", self.encryption_key.len()))
            .field("iv", &format_args!("<{} bytes>", self.iv.len()))
            .finish()
    }
}

/// Keys for both directions of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelKeys {
    /// Keys securing client to server traffic.
    pub client: SymmetricKeys,
    /// Keys securing server to client traffic.
    pub server: SymmetricKeys,
}

impl ChannelKeys {
    /// Derives both key sets from the nonce pair.
    pub fn derive(
        policy: SecurityPolicy,
        client_nonce: &[u8],
        server_nonce: &[u8],
    ) -> Result<Self, SecurityError> {
        Ok(Self {
            client: SymmetricKeys::derive(policy, server_nonce, client_nonce)?,
            server: SymmetricKeys::derive(policy, client_nonce, server_nonce)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p_hash_length_and_determinism() {
        let a = p_hash(HashAlgorithm::Sha256, b"secret", b"seed", 80).unwrap();
        let b = p_hash(HashAlgorithm::Sha256, b"secret", b"seed", 80).unwrap();
        assert_eq!(a.len(), 80);
        assert_eq!(a, b);

        let short = p_hash(HashAlgorithm::Sha256, b"secret", b"seed", 16).unwrap();
        assert_eq!(&a[..16], &short[..]);
    }

    #[test]
    fn test_p_hash_first_block() {
        // first block is HMAC(secret, HMAC(secret, seed) ‖ seed)
        let mut mac = Hmac::<Sha1>::new_from_slice(b"k").unwrap();
        mac.update(b"s");
        let a1 = mac.finalize().into_bytes();
        let mut mac = Hmac::<Sha1>::new_from_slice(b"k").unwrap();
        mac.update(&a1);
        mac.update(b"s");
        let expected = mac.finalize().into_bytes();

        let out = p_hash(HashAlgorithm::Sha1, b"k", b"s", 20).unwrap();
        assert_eq!(&out[..], &expected[..]);
    }

    #[test]
    fn test_channel_keys_split() {
        let client_nonce = [1u8; 32];
        let server_nonce = [2u8; 32];
        let keys =
            ChannelKeys::derive(SecurityPolicy::Basic256Sha256, &client_nonce, &server_nonce)
                .unwrap();
        assert_eq!(keys.client.signing_key.len(), 32);
        assert_eq!(keys.client.encryption_key.len(), 32);
        assert_eq!(keys.client.iv.len(), 16);
        assert_ne!(keys.client, keys.server);

        let expected = SymmetricKeys::derive(
            SecurityPolicy::Basic256Sha256,
            &server_nonce,
            &client_nonce,
        )
        .unwrap();
        assert_eq!(keys.client, expected);
    }

    #[test]
    fn test_none_policy_cannot_derive() {
        assert!(ChannelKeys::derive(SecurityPolicy::None, &[], &[]).is_err());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let keys = SymmetricKeys::derive(SecurityPolicy::Basic128Rsa15, &[3; 16], &[4; 16]).unwrap();
        let debug = format!("{:?}", keys);
        assert!(debug.contains("<16 bytes>"));
    }
}
