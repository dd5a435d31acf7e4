// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Security policies, key derivation, certificates and cryptography.
//!
//! # Architecture
//!
//! ```text
//! SecurityPolicy ──► policy parameters (digest, padding, key lengths)
//!        │
//!        ▼
//! CryptoProvider ──► asymmetric (RSA) / symmetric (HMAC + AES-CBC)
//!        │
//!        ├─── ChannelKeys (P_SHA1 / P_SHA256)
//!        │
//!        └─── CertificateProvider (trait)
//!                  ├── MemoryCertificateProvider
//!                  └── FileCertificateProvider
//! ```

pub mod certificate;
pub mod crypto;
pub mod keys;
pub mod policy;

pub use certificate::{
    Certificate, CertificateProvider, FileCertificateProvider, MemoryCertificateProvider,
    PrivateKey,
};
pub use crypto::CryptoProvider;
pub use keys::{ChannelKeys, SymmetricKeys};
pub use policy::{AsymmetricPadding, HashAlgorithm};
