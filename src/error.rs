//! Error types for the WS-Security layer.
//!
//! Fatal failures (`BuildError`, `DecryptError`) abort the operation.
//! Per-element decrypt failures are collected as `ElementDecryptError` values
//! and returned alongside the best-effort plaintext.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// XML could not be parsed into a document tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("XML parsing error: {0}")]
pub struct XmlError(pub String);

/// Key material could not be loaded.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid PEM: {0}")]
    Pem(String),

    #[error("Invalid certificate: {0}")]
    Certificate(String),

    #[error("Invalid private key: {0}")]
    PrivateKey(String),

    #[error("Client private key does not match the client certificate")]
    KeyMismatch,
}

/// Securing an outgoing envelope failed. Nothing may be sent.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("Invalid SOAP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Key material error: {0}")]
    Key(#[from] KeyError),

    #[error("Signature creation failed: {0}")]
    Signature(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Decrypting a response failed as a whole.
#[derive(Error, Debug)]
pub enum DecryptError {
    #[error(transparent)]
    Xml(#[from] XmlError),

    /// An EncryptedKey was present but no session key could be recovered.
    #[error("Key unwrap failed: {0}")]
    KeyUnwrap(String),

    /// EncryptedData was found with no EncryptedKey, and the configured
    /// policy rejects such responses.
    #[error("Encrypted data present but no EncryptedKey found")]
    MissingEncryptedKey,
}

/// Low-level cipher or RSA failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Key length {actual} does not fit the cipher (expected {expected})")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Invalid padding: {0}")]
    InvalidPadding(String),

    #[error("RSA operation failed: {0}")]
    Rsa(String),
}

impl CipherError {
    /// Failure code reported for this error on the decrypt path.
    pub fn code(&self) -> FailureCode {
        match self {
            Self::InvalidKeyLength { .. } => FailureCode::InvalidKeyLength,
            Self::InvalidCiphertext(_) | Self::Rsa(_) => FailureCode::InvalidCiphertext,
            Self::InvalidPadding(_) => FailureCode::InvalidPadding,
        }
    }
}

/// Failure raised by the external transport collaborator.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service answered with status {status}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Other(String),
}

/// Errors surfaced by the secure client around a single exchange.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Request was not sent: {0}")]
    Build(#[from] BuildError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Response could not be decrypted: {0}")]
    Decrypt(#[from] DecryptError),
}

/// Stable codes for decrypt-side failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    /// EncryptedKey uses a key transport other than rsa-1_5
    UnsupportedKeyTransport,
    /// EncryptedData uses an unknown or missing block cipher URI
    UnsupportedAlgorithm,
    /// CipherValue element missing
    MissingCipherValue,
    /// CipherValue is not valid base64
    InvalidBase64,
    /// Ciphertext shorter than an IV or not block aligned
    InvalidCiphertext,
    /// Session key length does not fit the cipher
    InvalidKeyLength,
    /// Block padding of the plaintext is inconsistent
    InvalidPadding,
    /// Decrypted bytes were not XML and were kept as text
    MalformedDecryptedContent,
    /// The session key for the element could not be recovered or identified
    KeyUnavailable,
}

impl FailureCode {
    /// Get the string code for this failure.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnsupportedKeyTransport => "UNSUPPORTED_KEY_TRANSPORT",
            Self::UnsupportedAlgorithm => "UNSUPPORTED_ALGORITHM",
            Self::MissingCipherValue => "MISSING_CIPHER_VALUE",
            Self::InvalidBase64 => "INVALID_BASE64",
            Self::InvalidCiphertext => "INVALID_CIPHERTEXT",
            Self::InvalidKeyLength => "INVALID_KEY_LENGTH",
            Self::InvalidPadding => "INVALID_PADDING",
            Self::MalformedDecryptedContent => "MALFORMED_DECRYPTED_CONTENT",
            Self::KeyUnavailable => "KEY_UNAVAILABLE",
        }
    }
}

/// A single element that could not be fully decrypted.
///
/// Non-fatal: the rest of the document is still processed.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("[{}] {message}", .code.as_str())]
pub struct ElementDecryptError {
    /// Failure code
    pub code: FailureCode,
    /// Human-readable message
    pub message: String,
    /// `Id` attribute of the element, when it has one
    pub element_id: Option<String>,
}

impl ElementDecryptError {
    /// Create a new failure without an element id.
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            element_id: None,
        }
    }

    /// Attach the id of the element the failure belongs to.
    pub fn for_element(mut self, element_id: Option<&str>) -> Self {
        self.element_id = element_id.map(String::from);
        self
    }
}
