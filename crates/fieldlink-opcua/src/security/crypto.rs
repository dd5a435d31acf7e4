// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Policy-bound cryptographic operations.
//!
//! A [`CryptoProvider`] is built once per channel from the configured
//! [`SecurityPolicy`] and our private key. Every failure is a
//! [`SecurityError`]; nothing silently degrades to an unsecured path.

use aes::{Aes128, Aes256};
use bytes::{BufMut, Bytes, BytesMut};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::{Oaep, Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::config::SecurityPolicy;
use crate::error::SecurityError;
use crate::protocol::services::{SignatureData, RSA_OAEP_URI};
use crate::security::certificate::{Certificate, PrivateKey};
use crate::security::keys::{ChannelKeys, SymmetricKeys};
use crate::security::policy::{AsymmetricPadding, HashAlgorithm, AES_BLOCK_SIZE};

/// Length of the nonce sent in CreateSession.
pub const SESSION_NONCE_LENGTH: usize = 32;

/// Sign, verify, encrypt and decrypt under one security policy.
#[derive(Debug, Clone)]
pub struct CryptoProvider {
    policy: SecurityPolicy,
    private_key: Option<PrivateKey>,
}

impl CryptoProvider {
    /// Creates a provider. Secured policies need `private_key` for signing
    /// and decryption.
    pub fn new(policy: SecurityPolicy, private_key: Option<PrivateKey>) -> Self {
        Self {
            policy,
            private_key,
        }
    }

    /// The policy this provider implements.
    pub fn policy(&self) -> SecurityPolicy {
        self.policy
    }

    /// Modulus length of our private key in bytes, 0 without a key.
    pub fn local_key_size(&self) -> usize {
        self.private_key.as_ref().map_or(0, PrivateKey::key_size)
    }

    fn hash(&self) -> Result<HashAlgorithm, SecurityError> {
        self.policy
            .hash_algorithm()
            .ok_or_else(|| SecurityError::missing_credential("signature algorithm", self.policy.uri()))
    }

    fn key(&self) -> Result<&PrivateKey, SecurityError> {
        self.private_key
            .as_ref()
            .ok_or_else(|| SecurityError::missing_credential("private key", self.policy.uri()))
    }

    fn padding(&self) -> Result<AsymmetricPadding, SecurityError> {
        self.policy
            .asymmetric_padding()
            .ok_or_else(|| SecurityError::missing_credential("encryption algorithm", self.policy.uri()))
    }

    // =========================================================================
    // Asymmetric
    // =========================================================================

    /// RSA PKCS#1 v1.5 signature with the policy digest.
    pub fn asymmetric_sign(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let key = self.key()?;
        let result = match self.hash()? {
            HashAlgorithm::Sha1 => key
                .rsa()
                .sign(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data)),
            HashAlgorithm::Sha256 => key
                .rsa()
                .sign(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data)),
        };
        result.map_err(|e| SecurityError::signing_failed(e.to_string()))
    }

    /// Verifies an RSA PKCS#1 v1.5 signature.
    pub fn asymmetric_verify(
        &self,
        key: &RsaPublicKey,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SecurityError> {
        let result = match self.hash()? {
            HashAlgorithm::Sha1 => {
                key.verify(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(data), signature)
            }
            HashAlgorithm::Sha256 => {
                key.verify(Pkcs1v15Sign::new::<Sha256>(), &Sha256::digest(data), signature)
            }
        };
        result.map_err(|_| SecurityError::signature_failed("asymmetric signature mismatch"))
    }

    /// Plaintext bytes that fit in one RSA block of `key_size` bytes.
    pub fn asymmetric_plain_block_size(&self, key_size: usize) -> usize {
        self.policy
            .asymmetric_padding()
            .map_or(1, |padding| key_size.saturating_sub(padding.overhead()))
    }

    /// Encrypts `data` block by block with `key`.
    pub fn asymmetric_encrypt(
        &self,
        key: &RsaPublicKey,
        data: &[u8],
    ) -> Result<Vec<u8>, SecurityError> {
        rsa_encrypt(self.padding()?, key, data)
    }

    /// Decrypts `data` block by block with our private key.
    pub fn asymmetric_decrypt(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let key = self.key()?;
        let padding = self.padding()?;
        let block = key.key_size();
        if data.len() % block != 0 {
            return Err(SecurityError::decryption_failed(format!(
                "{} bytes is not a multiple of the {}-byte key",
                data.len(),
                block
            )));
        }

        let mut plain = Vec::with_capacity(data.len());
        for chunk in data.chunks(block) {
            let decrypted = match padding {
                AsymmetricPadding::Pkcs1v15 => key.rsa().decrypt(Pkcs1v15Encrypt, chunk),
                AsymmetricPadding::OaepSha1 => key.rsa().decrypt(Oaep::new::<Sha1>(), chunk),
            }
            .map_err(|e| SecurityError::decryption_failed(e.to_string()))?;
            plain.extend_from_slice(&decrypted);
        }
        Ok(plain)
    }

    // =========================================================================
    // Symmetric
    // =========================================================================

    /// HMAC over `data`.
    pub fn symmetric_sign(&self, keys: &SymmetricKeys, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        match self.hash()? {
            HashAlgorithm::Sha1 => hmac_sign::<Hmac<Sha1>>(&keys.signing_key, data),
            HashAlgorithm::Sha256 => hmac_sign::<Hmac<Sha256>>(&keys.signing_key, data),
        }
    }

    /// Verifies an HMAC in constant time.
    pub fn symmetric_verify(
        &self,
        keys: &SymmetricKeys,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SecurityError> {
        let result = match self.hash()? {
            HashAlgorithm::Sha1 => hmac_verify::<Hmac<Sha1>>(&keys.signing_key, data, signature),
            HashAlgorithm::Sha256 => hmac_verify::<Hmac<Sha256>>(&keys.signing_key, data, signature),
        };
        result.map_err(|_| SecurityError::signature_failed("symmetric signature mismatch"))
    }

    /// AES-CBC encrypts `data` in place. The length must be block aligned.
    pub fn symmetric_encrypt(&self, keys: &SymmetricKeys, data: &mut [u8]) -> Result<(), SecurityError> {
        check_block_aligned(data.len()).map_err(SecurityError::encryption_failed)?;
        let len = data.len();
        let result = match keys.encryption_key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(&keys.encryption_key, &keys.iv)
                .map_err(|e| e.to_string())
                .and_then(|c| {
                    c.encrypt_padded_mut::<NoPadding>(data, len)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }),
            32 => cbc::Encryptor::<Aes256>::new_from_slices(&keys.encryption_key, &keys.iv)
                .map_err(|e| e.to_string())
                .and_then(|c| {
                    c.encrypt_padded_mut::<NoPadding>(data, len)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }),
            other => Err(format!("unsupported AES key length {}", other)),
        };
        result.map_err(SecurityError::encryption_failed)
    }

    /// AES-CBC decrypts `data` in place.
    pub fn symmetric_decrypt(&self, keys: &SymmetricKeys, data: &mut [u8]) -> Result<(), SecurityError> {
        check_block_aligned(data.len()).map_err(SecurityError::decryption_failed)?;
        let result = match keys.encryption_key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(&keys.encryption_key, &keys.iv)
                .map_err(|e| e.to_string())
                .and_then(|c| {
                    c.decrypt_padded_mut::<NoPadding>(data)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }),
            32 => cbc::Decryptor::<Aes256>::new_from_slices(&keys.encryption_key, &keys.iv)
                .map_err(|e| e.to_string())
                .and_then(|c| {
                    c.decrypt_padded_mut::<NoPadding>(data)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }),
            other => Err(format!("unsupported AES key length {}", other)),
        };
        result.map_err(SecurityError::decryption_failed)
    }

    /// Derives both directions' keys from the nonce pair.
    pub fn derive_channel_keys(
        &self,
        client_nonce: &[u8],
        server_nonce: &[u8],
    ) -> Result<ChannelKeys, SecurityError> {
        ChannelKeys::derive(self.policy, client_nonce, server_nonce)
    }

    // =========================================================================
    // Nonces and session signatures
    // =========================================================================

    /// A random channel nonce of the policy length.
    pub fn create_nonce(&self) -> Bytes {
        random_bytes(self.policy.nonce_length())
    }

    /// A random 32-byte session nonce.
    pub fn create_session_nonce() -> Bytes {
        random_bytes(SESSION_NONCE_LENGTH)
    }

    /// Encrypts a user password for a UserNameIdentityToken.
    ///
    /// Returns the ciphertext and the algorithm URI.
    pub fn encrypt_identity_password(
        &self,
        password: &str,
        server_nonce: &[u8],
        server_certificate: &Certificate,
    ) -> Result<(Bytes, &'static str), SecurityError> {
        let mut plain = BytesMut::with_capacity(4 + password.len() + server_nonce.len());
        plain.put_u32_le((password.len() + server_nonce.len()) as u32);
        plain.put_slice(password.as_bytes());
        plain.put_slice(server_nonce);

        let encrypted = rsa_encrypt(
            AsymmetricPadding::OaepSha1,
            server_certificate.public_key(),
            &plain,
        )?;
        Ok((Bytes::from(encrypted), RSA_OAEP_URI))
    }

    /// Signs `server_certificate ‖ server_nonce` for ActivateSession.
    ///
    /// Unsecured policies produce an empty signature.
    pub fn client_signature(
        &self,
        server_certificate: &[u8],
        server_nonce: &[u8],
    ) -> Result<SignatureData, SecurityError> {
        let Some(algorithm) = self.policy.asymmetric_signature_uri() else {
            return Ok(SignatureData::default());
        };
        let data = [server_certificate, server_nonce].concat();
        Ok(SignatureData {
            algorithm: Some(algorithm.to_string()),
            signature: Some(Bytes::from(self.asymmetric_sign(&data)?)),
        })
    }

    /// Verifies the CreateSession server signature over
    /// `client_certificate ‖ client_nonce`.
    pub fn verify_server_signature(
        &self,
        server_certificate: &Certificate,
        client_certificate: &[u8],
        client_nonce: &[u8],
        signature: &SignatureData,
    ) -> Result<(), SecurityError> {
        let Some(expected) = self.policy.asymmetric_signature_uri() else {
            return Ok(());
        };
        let algorithm = signature.algorithm.as_deref().unwrap_or_default();
        if algorithm != expected {
            return Err(SecurityError::policy_mismatch(expected, algorithm));
        }
        let data = [client_certificate, client_nonce].concat();
        let sig = signature.signature.as_deref().unwrap_or_default();
        self.asymmetric_verify(server_certificate.public_key(), &data, sig)
            .map_err(|_| SecurityError::signature_failed("CreateSession server signature"))
    }
}

fn rsa_encrypt(
    padding: AsymmetricPadding,
    key: &RsaPublicKey,
    data: &[u8],
) -> Result<Vec<u8>, SecurityError> {
    use rsa::traits::PublicKeyParts;

    let plain_block = key.size().saturating_sub(padding.overhead());
    if plain_block == 0 {
        return Err(SecurityError::encryption_failed("RSA key too small"));
    }

    let mut rng = OsRng;
    let mut out = Vec::with_capacity(data.len().div_ceil(plain_block) * key.size());
    for chunk in data.chunks(plain_block) {
        let encrypted = match padding {
            AsymmetricPadding::Pkcs1v15 => key.encrypt(&mut rng, Pkcs1v15Encrypt, chunk),
            AsymmetricPadding::OaepSha1 => key.encrypt(&mut rng, Oaep::new::<Sha1>(), chunk),
        }
        .map_err(|e| SecurityError::encryption_failed(e.to_string()))?;
        out.extend_from_slice(&encrypted);
    }
    Ok(out)
}

fn hmac_sign<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SecurityError> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .map_err(|e| SecurityError::signing_failed(e.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hmac_verify<M: Mac + hmac::digest::KeyInit>(
    key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SecurityError> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .map_err(|e| SecurityError::signing_failed(e.to_string()))?;
    mac.update(data);
    mac.verify_slice(signature)
        .map_err(|_| SecurityError::signature_failed("HMAC mismatch"))
}

fn check_block_aligned(len: usize) -> Result<(), String> {
    if len % AES_BLOCK_SIZE != 0 {
        return Err(format!("{} bytes is not a multiple of the AES block", len));
    }
    Ok(())
}

fn random_bytes(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    Bytes::from(buf)
}
