// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Cryptographic parameters of each [`SecurityPolicy`].

use crate::config::SecurityPolicy;

/// Digest used for signatures and key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1, 20-byte output.
    Sha1,
    /// SHA-256, 32-byte output.
    Sha256,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub const fn output_size(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }
}

/// RSA encryption padding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsymmetricPadding {
    /// PKCS#1 v1.5.
    Pkcs1v15,
    /// OAEP with SHA-1.
    OaepSha1,
}

impl AsymmetricPadding {
    /// Bytes of each RSA block consumed by padding.
    pub const fn overhead(&self) -> usize {
        match self {
            Self::Pkcs1v15 => 11,
            // 2 * sha1 + 2
            Self::OaepSha1 => 42,
        }
    }

    /// Algorithm URI.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::Pkcs1v15 => "http://www.w3.org/2001/04/xmlenc#rsa-1_5",
            Self::OaepSha1 => "http://www.w3.org/2001/04/xmlenc#rsa-oaep",
        }
    }
}

/// AES block size.
pub const AES_BLOCK_SIZE: usize = 16;

impl SecurityPolicy {
    /// Digest for asymmetric signatures and HMAC.
    ///
    /// `None` for the unsecured policy.
    pub const fn hash_algorithm(&self) -> Option<HashAlgorithm> {
        match self {
            Self::None => None,
            Self::Basic128Rsa15 => Some(HashAlgorithm::Sha1),
            Self::Basic256Sha256 => Some(HashAlgorithm::Sha256),
        }
    }

    /// RSA encryption padding.
    pub const fn asymmetric_padding(&self) -> Option<AsymmetricPadding> {
        match self {
            Self::None => None,
            Self::Basic128Rsa15 => Some(AsymmetricPadding::Pkcs1v15),
            Self::Basic256Sha256 => Some(AsymmetricPadding::OaepSha1),
        }
    }

    /// URI of the asymmetric signature algorithm.
    pub const fn asymmetric_signature_uri(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Basic128Rsa15 => Some("http://www.w3.org/2000/09/xmldsig#rsa-sha1"),
            Self::Basic256Sha256 => Some("http://www.w3.org/2001/04/xmldsig-more#rsa-sha256"),
        }
    }

    /// HMAC output length.
    pub const fn symmetric_signature_size(&self) -> usize {
        match self.hash_algorithm() {
            Some(hash) => hash.output_size(),
            None => 0,
        }
    }

    /// Length of the derived HMAC key.
    pub const fn symmetric_signing_key_length(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Basic128Rsa15 => 16,
            Self::Basic256Sha256 => 32,
        }
    }

    /// Length of the derived AES key.
    pub const fn symmetric_encryption_key_length(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Basic128Rsa15 => 16,
            Self::Basic256Sha256 => 32,
        }
    }

    /// AES block size, or 1 when unsecured.
    pub const fn symmetric_block_size(&self) -> usize {
        match self {
            Self::None => 1,
            _ => AES_BLOCK_SIZE,
        }
    }

    /// Length of channel nonces.
    pub const fn nonce_length(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Basic128Rsa15 => 16,
            Self::Basic256Sha256 => 32,
        }
    }

    /// Total bytes pulled from the PRF for one side's keys.
    pub const fn derived_key_material_length(&self) -> usize {
        self.symmetric_signing_key_length()
            + self.symmetric_encryption_key_length()
            + self.symmetric_block_size()
    }
}
