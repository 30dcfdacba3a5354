//! WS-Security for SOAP customs declarations.
//!
//! Secures outgoing SOAP envelopes and decrypts encrypted responses
//! according to the WS-Security 1.0 X.509 profile with XML-Encryption.
//!
//! # Features
//!
//! - Timestamp, BinarySecurityToken and RSA signature over Body and Timestamp
//! - Body content and Signature encryption (TripleDES, AES-128, AES-256 in CBC mode)
//! - Session key transport with RSA PKCS#1 v1.5
//! - Per-element response decryption with a failure report
//! - Transport-agnostic client wrapping a single exchange
//!
//! # Example
//!
//! ```ignore
//! use soap_wsse::{KeyMaterial, SecureClient, WsSecurityConfig};
//! use std::sync::Arc;
//!
//! let config = WsSecurityConfig::default();
//! let keys = Arc::new(KeyMaterial::load(&config.keys)?);
//! let client = SecureClient::new(http_transport, keys, &config);
//! let response = client.call(&envelope).await?;
//! ```

pub mod algorithm;
pub mod builder;
pub mod c14n;
pub mod cipher;
pub mod client;
pub mod config;
pub mod decryptor;
pub mod document;
pub mod error;
pub mod keys;
pub mod trace;

pub use builder::{BuilderOptions, SecurityBuilder};
pub use client::{ClientStats, SecureClient, SecureResponse, Transport};
pub use config::{MissingKeyPolicy, WsSecurityConfig};
pub use decryptor::{DecryptOutcome, ResponseDecryptor};
pub use error::{BuildError, ClientError, DecryptError, ElementDecryptError, FailureCode};
pub use keys::KeyMaterial;
pub use trace::{NoopSink, TraceSink, TraceStage, TracingSink};
