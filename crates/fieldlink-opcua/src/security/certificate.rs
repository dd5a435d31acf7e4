// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Certificates, private keys and the providers that hand them to a channel.
//!
//! Certificates are parsed with `x509-parser` only to extract the RSA public
//! key. Trust decisions are left to the caller.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::{SecurityError, UaError, UaResult};

// =============================================================================
// Certificate
// =============================================================================

/// A DER certificate and its RSA public key.
#[derive(Clone, PartialEq)]
pub struct Certificate {
    der: Bytes,
    public_key: RsaPublicKey,
    thumbprint: [u8; 20],
}

impl Certificate {
    /// Parses a DER encoded X.509 certificate.
    pub fn from_der(der: impl Into<Bytes>) -> Result<Self, SecurityError> {
        let der = der.into();
        let public_key = {
            let (_, cert) = x509_parser::parse_x509_certificate(&der)
                .map_err(|e| SecurityError::invalid_certificate(e.to_string()))?;
            RsaPublicKey::from_public_key_der(cert.public_key().raw).map_err(|e| {
                SecurityError::invalid_certificate(format!("not an RSA public key: {}", e))
            })?
        };
        Ok(Self::from_parts(der, public_key))
    }

    /// Parses a PEM `CERTIFICATE` block.
    pub fn from_pem(pem: &[u8]) -> Result<Self, SecurityError> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem)
            .map_err(|e| SecurityError::invalid_certificate(format!("bad PEM: {}", e)))?;
        Self::from_der(pem.contents)
    }

    /// Parses PEM or DER, detected by the leading bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SecurityError> {
        if bytes.starts_with(b"-----BEGIN") {
            Self::from_pem(bytes)
        } else {
            Self::from_der(Bytes::copy_from_slice(bytes))
        }
    }

    /// Pairs raw certificate bytes with a known public key.
    pub fn from_parts(der: impl Into<Bytes>, public_key: RsaPublicKey) -> Self {
        let der = der.into();
        let thumbprint = Sha1::digest(&der).into();
        Self {
            der,
            public_key,
            thumbprint,
        }
    }

    /// DER bytes as sent on the wire.
    pub fn der(&self) -> &Bytes {
        &self.der
    }

    /// RSA public key.
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// SHA-1 of the DER bytes.
    pub fn thumbprint(&self) -> &[u8; 20] {
        &self.thumbprint
    }

    /// RSA modulus length in bytes.
    pub fn key_size(&self) -> usize {
        self.public_key.size()
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("thumbprint", &hex(&self.thumbprint))
            .field("key_bits", &(self.key_size() * 8))
            .finish()
    }
}

// =============================================================================
// PrivateKey
// =============================================================================

/// An RSA private key.
#[derive(Clone)]
pub struct PrivateKey {
    inner: Arc<RsaPrivateKey>,
}

impl PrivateKey {
    /// Wraps an existing key.
    pub fn new(key: RsaPrivateKey) -> Self {
        Self {
            inner: Arc::new(key),
        }
    }

    /// Parses a PKCS#8 or PKCS#1 DER key.
    pub fn from_der(der: &[u8]) -> Result<Self, SecurityError> {
        RsaPrivateKey::from_pkcs8_der(der)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(der))
            .map(Self::new)
            .map_err(|e| SecurityError::invalid_private_key(e.to_string()))
    }

    /// Parses a PKCS#8 (`PRIVATE KEY`) or PKCS#1 (`RSA PRIVATE KEY`) PEM key.
    pub fn from_pem(pem: &str) -> Result<Self, SecurityError> {
        RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map(Self::new)
            .map_err(|e| SecurityError::invalid_private_key(e.to_string()))
    }

    /// Parses PEM or DER, detected by the leading bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SecurityError> {
        if bytes.starts_with(b"-----BEGIN") {
            let pem = std::str::from_utf8(bytes)
                .map_err(|e| SecurityError::invalid_private_key(e.to_string()))?;
            Self::from_pem(pem)
        } else {
            Self::from_der(bytes)
        }
    }

    /// The underlying RSA key.
    pub fn rsa(&self) -> &RsaPrivateKey {
        &self.inner
    }

    /// Matching public key.
    pub fn public_key(&self) -> RsaPublicKey {
        self.inner.to_public_key()
    }

    /// RSA modulus length in bytes.
    pub fn key_size(&self) -> usize {
        self.inner.size()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(<{} bits>)", self.key_size() * 8)
    }
}

// =============================================================================
// CertificateProvider
// =============================================================================

/// Supplies the certificates and key a secure channel needs.
pub trait CertificateProvider: Send + Sync {
    /// Our application instance certificate.
    fn local_certificate(&self) -> Option<Certificate>;

    /// Private key matching [`local_certificate`](Self::local_certificate).
    fn local_private_key(&self) -> Option<PrivateKey>;

    /// The server certificate, once known.
    fn remote_certificate(&self) -> Option<Certificate>;

    /// Records the server certificate learned during the handshake.
    fn set_remote_certificate(&self, certificate: Certificate);
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryCertificateProvider {
    local_certificate: Option<Certificate>,
    local_private_key: Option<PrivateKey>,
    remote_certificate: RwLock<Option<Certificate>>,
}

impl MemoryCertificateProvider {
    /// A provider without credentials, for `SecurityPolicy::None`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider with our certificate and key.
    pub fn with_credentials(certificate: Certificate, private_key: PrivateKey) -> Self {
        Self {
            local_certificate: Some(certificate),
            local_private_key: Some(private_key),
            remote_certificate: RwLock::new(None),
        }
    }

    /// Sets the server certificate up front.
    pub fn with_remote_certificate(self, certificate: Certificate) -> Self {
        *self.remote_certificate.write() = Some(certificate);
        self
    }
}

impl CertificateProvider for MemoryCertificateProvider {
    fn local_certificate(&self) -> Option<Certificate> {
        self.local_certificate.clone()
    }

    fn local_private_key(&self) -> Option<PrivateKey> {
        self.local_private_key.clone()
    }

    fn remote_certificate(&self) -> Option<Certificate> {
        self.remote_certificate.read().clone()
    }

    fn set_remote_certificate(&self, certificate: Certificate) {
        *self.remote_certificate.write() = Some(certificate);
    }
}

/// Loads certificates and key from disk once, then serves them from memory.
#[derive(Debug)]
pub struct FileCertificateProvider {
    certificate_path: PathBuf,
    inner: MemoryCertificateProvider,
}

impl FileCertificateProvider {
    /// Reads our certificate, our key and optionally the server certificate.
    pub async fn load(
        certificate_path: impl AsRef<Path>,
        private_key_path: impl AsRef<Path>,
        server_certificate_path: Option<&Path>,
    ) -> UaResult<Self> {
        let certificate_path = certificate_path.as_ref().to_path_buf();
        let certificate = Certificate::from_bytes(&read_file(&certificate_path).await?)?;
        let private_key = PrivateKey::from_bytes(&read_file(private_key_path.as_ref()).await?)?;

        if certificate.public_key() != &private_key.public_key() {
            return Err(SecurityError::invalid_private_key(
                "private key does not match the certificate",
            )
            .into());
        }

        let mut inner = MemoryCertificateProvider::with_credentials(certificate, private_key);
        if let Some(path) = server_certificate_path {
            inner = inner.with_remote_certificate(Certificate::from_bytes(&read_file(path).await?)?);
        }

        debug!(path = %certificate_path.display(), "Loaded client certificate");
        Ok(Self {
            certificate_path,
            inner,
        })
    }

    /// Path the certificate was loaded from.
    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }
}

impl CertificateProvider for FileCertificateProvider {
    fn local_certificate(&self) -> Option<Certificate> {
        self.inner.local_certificate()
    }

    fn local_private_key(&self) -> Option<PrivateKey> {
        self.inner.local_private_key()
    }

    fn remote_certificate(&self) -> Option<Certificate> {
        self.inner.remote_certificate()
    }

    fn set_remote_certificate(&self, certificate: Certificate) {
        self.inner.set_remote_certificate(certificate)
    }
}

async fn read_file(path: &Path) -> UaResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        UaError::from(SecurityError::invalid_certificate(format!(
            "cannot read {}: {}",
            path.display(),
            e
        )))
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, 1024).unwrap()
    }

    #[test]
    fn test_thumbprint_is_sha1_of_der() {
        let key = test_key();
        let cert = Certificate::from_parts(Bytes::from_static(b"not really der"), key.to_public_key());
        let expected: [u8; 20] = Sha1::digest(b"not really der").into();
        assert_eq!(cert.thumbprint(), &expected);
        assert_eq!(cert.key_size(), 128);
    }

    #[test]
    fn test_garbage_certificate_rejected() {
        let err = Certificate::from_der(Bytes::from_static(b"\x30\x03\x02\x01\x00")).unwrap_err();
        assert!(matches!(err, SecurityError::InvalidCertificate { .. }));
    }

    #[test]
    fn test_private_key_pem_and_der() {
        let key = test_key();
        let der = key.to_pkcs8_der().unwrap();
        let from_der = PrivateKey::from_bytes(der.as_bytes()).unwrap();
        assert_eq!(from_der.public_key(), key.to_public_key());

        let pem = key.to_pkcs8_pem(LineEnding::LF).unwrap();
        let from_pem = PrivateKey::from_bytes(pem.as_bytes()).unwrap();
        assert_eq!(from_pem.key_size(), 128);
    }

    #[test]
    fn test_memory_provider_remote_certificate() {
        let key = test_key();
        let provider = MemoryCertificateProvider::new();
        assert!(provider.remote_certificate().is_none());

        provider.set_remote_certificate(Certificate::from_parts(
            Bytes::from_static(b"server"),
            key.to_public_key(),
        ));
        assert_eq!(
            provider.remote_certificate().map(|c| c.der().clone()),
            Some(Bytes::from_static(b"server"))
        );
    }

    #[tokio::test]
    async fn test_file_provider_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileCertificateProvider::load(
            dir.path().join("missing.der"),
            dir.path().join("missing.pem"),
            None,
        )
        .await;
        assert!(result.is_err());
    }
}
