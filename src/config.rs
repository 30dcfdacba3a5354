//! Configuration types for the WS-Security layer.

use crate::algorithm::{DataEncryption, SignatureAlgorithm};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsSecurityConfig {
    /// Config version
    pub version: String,

    /// PEM files holding the key material
    pub keys: KeyPathsConfig,

    /// Validity window of the outgoing Timestamp, in seconds
    pub timestamp_ttl_secs: u64,

    /// Signature algorithm for outgoing requests
    pub signature_algorithm: SignatureAlgorithm,

    /// Block cipher for outgoing EncryptedData
    pub data_encryption: DataEncryption,

    /// Encrypt the Signature element together with the Body
    pub encrypt_signature: bool,

    /// Decrypt encrypted responses
    pub decrypt_responses: bool,

    /// What to do with a response carrying EncryptedData but no EncryptedKey
    pub missing_key_policy: MissingKeyPolicy,
}

impl Default for WsSecurityConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            keys: KeyPathsConfig::default(),
            timestamp_ttl_secs: 300, // 5 minutes
            signature_algorithm: SignatureAlgorithm::RsaSha1,
            data_encryption: DataEncryption::TripleDesCbc,
            encrypt_signature: true,
            decrypt_responses: true,
            missing_key_policy: MissingKeyPolicy::PassThrough,
        }
    }
}

/// Locations of the PEM-encoded key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyPathsConfig {
    /// Client X.509 certificate, sent as BinarySecurityToken
    pub client_certificate: PathBuf,

    /// Client RSA private key (PKCS#8 or PKCS#1)
    pub client_private_key: PathBuf,

    /// Customs service certificate, used to wrap session keys
    pub server_certificate: PathBuf,
}

impl Default for KeyPathsConfig {
    fn default() -> Self {
        Self {
            client_certificate: PathBuf::from("keys/client-cert.pem"),
            client_private_key: PathBuf::from("keys/client-key.pem"),
            server_certificate: PathBuf::from("keys/server-cert.pem"),
        }
    }
}

/// Handling of EncryptedData that arrives without any EncryptedKey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MissingKeyPolicy {
    /// Return the response unchanged (log only)
    #[default]
    PassThrough,
    /// Fail the decrypt
    Reject,
}
