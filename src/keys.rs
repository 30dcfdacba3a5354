//! Key material: client certificate and private key, server certificate.
//!
//! Loaded once at startup and shared read-only between calls.

use crate::config::KeyPathsConfig;
use crate::error::KeyError;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use std::path::Path;
use tracing::debug;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, ParsedExtension, X509Certificate};

/// A parsed X.509 certificate carrying an RSA public key.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
    public_key: RsaPublicKey,
    subject_key_identifier: Vec<u8>,
    subject: String,
}

impl Certificate {
    /// Parse a PEM `CERTIFICATE` block.
    pub fn from_pem(pem: &str) -> Result<Self, KeyError> {
        let (_, pem) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| KeyError::Pem(format!("Failed to decode certificate PEM: {e}")))?;
        if pem.label != "CERTIFICATE" {
            return Err(KeyError::Pem(format!(
                "Expected a CERTIFICATE block, found {}",
                pem.label
            )));
        }
        Self::from_der(pem.contents)
    }

    /// Parse a DER-encoded certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, KeyError> {
        let (public_key, subject_key_identifier, subject) = {
            let (_, cert) = X509Certificate::from_der(&der)
                .map_err(|e| KeyError::Certificate(format!("Failed to parse certificate: {e}")))?;

            let spki = cert.public_key();
            let public_key = RsaPublicKey::from_public_key_der(spki.raw).map_err(|e| {
                KeyError::Certificate(format!("Certificate does not carry an RSA key: {e}"))
            })?;

            // Without the extension, fall back to the SHA-1 of the key bits.
            let ski = cert
                .extensions()
                .iter()
                .find_map(|ext| match ext.parsed_extension() {
                    ParsedExtension::SubjectKeyIdentifier(id) => Some(id.0.to_vec()),
                    _ => None,
                })
                .unwrap_or_else(|| Sha1::digest(&spki.subject_public_key.data).to_vec());

            (public_key, ski, cert.subject().to_string())
        };

        Ok(Self {
            der,
            public_key,
            subject_key_identifier,
            subject,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Subject key identifier used to reference this certificate from
    /// an EncryptedKey.
    pub fn subject_key_identifier(&self) -> &[u8] {
        &self.subject_key_identifier
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

/// Parse an RSA private key from PKCS#8 or PKCS#1 PEM.
pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, KeyError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| KeyError::PrivateKey(format!("Failed to parse RSA private key: {e}")))
}

/// The three immutable inputs of the security layer.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    client_certificate: Certificate,
    client_private_key: RsaPrivateKey,
    server_certificate: Certificate,
}

impl KeyMaterial {
    /// Combine parsed key material, checking the client key pair matches.
    pub fn new(
        client_certificate: Certificate,
        client_private_key: RsaPrivateKey,
        server_certificate: Certificate,
    ) -> Result<Self, KeyError> {
        if &RsaPublicKey::from(&client_private_key) != client_certificate.public_key() {
            return Err(KeyError::KeyMismatch);
        }
        Ok(Self {
            client_certificate,
            client_private_key,
            server_certificate,
        })
    }

    /// Build key material from PEM text.
    pub fn from_pem(
        client_certificate_pem: &str,
        client_private_key_pem: &str,
        server_certificate_pem: &str,
    ) -> Result<Self, KeyError> {
        Self::new(
            Certificate::from_pem(client_certificate_pem)?,
            private_key_from_pem(client_private_key_pem)?,
            Certificate::from_pem(server_certificate_pem)?,
        )
    }

    /// Load key material from the configured PEM files.
    pub fn load(paths: &KeyPathsConfig) -> Result<Self, KeyError> {
        let material = Self::from_pem(
            &read_pem(&paths.client_certificate)?,
            &read_pem(&paths.client_private_key)?,
            &read_pem(&paths.server_certificate)?,
        )?;
        debug!(
            client = %material.client_certificate.subject(),
            server = %material.server_certificate.subject(),
            "Key material loaded"
        );
        Ok(material)
    }

    pub fn client_certificate(&self) -> &Certificate {
        &self.client_certificate
    }

    pub fn client_private_key(&self) -> &RsaPrivateKey {
        &self.client_private_key
    }

    pub fn server_certificate(&self) -> &Certificate {
        &self.server_certificate
    }
}

fn read_pem(path: &Path) -> Result<String, KeyError> {
    std::fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    const CLIENT_CERT: &str = include_str!("../tests/fixtures/client-cert.pem");
    const CLIENT_KEY: &str = include_str!("../tests/fixtures/client-key.pem");
    const SERVER_CERT: &str = include_str!("../tests/fixtures/server-cert.pem");
    const STRANGER_KEY: &str = include_str!("../tests/fixtures/stranger-key.pem");

    #[test]
    fn test_certificate_from_pem() {
        let cert = Certificate::from_pem(SERVER_CERT).unwrap();
        assert!(cert.subject().contains("server.example.test"));
        assert_eq!(
            STANDARD.encode(cert.subject_key_identifier()),
            "hs53ZusowqyRhYnX8LlHjGbMrkw="
        );
    }

    #[test]
    fn test_certificate_rejects_key_pem() {
        assert!(matches!(Certificate::from_pem(CLIENT_KEY), Err(KeyError::Pem(_))));
        assert!(Certificate::from_pem("not a pem").is_err());
    }

    #[test]
    fn test_private_key_pkcs8_and_pkcs1() {
        assert!(private_key_from_pem(CLIENT_KEY).is_ok());
        assert!(private_key_from_pem(STRANGER_KEY).is_ok());
        assert!(matches!(
            private_key_from_pem("garbage"),
            Err(KeyError::PrivateKey(_))
        ));
    }

    #[test]
    fn test_key_material_from_pem() {
        let keys = KeyMaterial::from_pem(CLIENT_CERT, CLIENT_KEY, SERVER_CERT).unwrap();
        assert!(keys.client_certificate().subject().contains("client.example.test"));
        assert!(keys.server_certificate().subject().contains("server.example.test"));
    }

    #[test]
    fn test_key_material_mismatch() {
        let err = KeyMaterial::from_pem(CLIENT_CERT, STRANGER_KEY, SERVER_CERT).unwrap_err();
        assert!(matches!(err, KeyError::KeyMismatch));
    }

    #[test]
    fn test_load_missing_file() {
        let paths = KeyPathsConfig {
            client_certificate: "/nonexistent/client.pem".into(),
            client_private_key: "/nonexistent/key.pem".into(),
            server_certificate: "/nonexistent/server.pem".into(),
        };
        let err = KeyMaterial::load(&paths).unwrap_err();
        assert!(matches!(err, KeyError::Read { .. }));
    }
}
