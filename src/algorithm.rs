//! Namespace and algorithm identifiers used on the wire.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSSE_NS: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";

/// Token profile identifiers.
pub const X509_V3_TOKEN: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#X509v3";
pub const X509_SKI_TOKEN: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-x509-token-profile-1.0#X509SubjectKeyIdentifier";
pub const BASE64_BINARY: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// EncryptedData `Type` values.
pub const TYPE_CONTENT: &str = "http://www.w3.org/2001/04/xmlenc#Content";
pub const TYPE_ELEMENT: &str = "http://www.w3.org/2001/04/xmlenc#Element";

/// Canonicalization and digest URIs.
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

/// Signature URIs.
pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

/// The only key transport accepted in either direction.
pub const RSA_1_5: &str = "http://www.w3.org/2001/04/xmlenc#rsa-1_5";

/// Block encryption URIs.
pub const TRIPLEDES_CBC: &str = "http://www.w3.org/2001/04/xmlenc#tripledes-cbc";
pub const AES128_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes128-cbc";
pub const AES256_CBC: &str = "http://www.w3.org/2001/04/xmlenc#aes256-cbc";

/// RSA signature algorithm for the detached message signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// RSA PKCS#1 v1.5 with SHA-1
    #[default]
    #[serde(rename = "rsa-sha1")]
    RsaSha1,
    /// RSA PKCS#1 v1.5 with SHA-256
    #[serde(rename = "rsa-sha256")]
    RsaSha256,
}

impl SignatureAlgorithm {
    /// Returns the SignatureMethod URI.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::RsaSha1 => RSA_SHA1,
            Self::RsaSha256 => RSA_SHA256,
        }
    }

    /// Returns the DigestMethod URI used for references.
    pub const fn digest_uri(&self) -> &'static str {
        match self {
            Self::RsaSha1 => DIGEST_SHA1,
            Self::RsaSha256 => DIGEST_SHA256,
        }
    }

    /// Hash `data` with this algorithm's digest.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::RsaSha1 => Sha1::digest(data).to_vec(),
            Self::RsaSha256 => Sha256::digest(data).to_vec(),
        }
    }
}

/// Symmetric block cipher for EncryptedData, always in CBC mode with the
/// IV prepended to the ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataEncryption {
    #[default]
    #[serde(rename = "tripledes-cbc")]
    TripleDesCbc,
    #[serde(rename = "aes128-cbc")]
    Aes128Cbc,
    #[serde(rename = "aes256-cbc")]
    Aes256Cbc,
}

impl DataEncryption {
    /// Returns the EncryptionMethod URI.
    pub const fn uri(&self) -> &'static str {
        match self {
            Self::TripleDesCbc => TRIPLEDES_CBC,
            Self::Aes128Cbc => AES128_CBC,
            Self::Aes256Cbc => AES256_CBC,
        }
    }

    /// Parses a block cipher from its URI.
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri.trim() {
            TRIPLEDES_CBC => Some(Self::TripleDesCbc),
            AES128_CBC => Some(Self::Aes128Cbc),
            AES256_CBC => Some(Self::Aes256Cbc),
            _ => None,
        }
    }

    /// Session key length in bytes.
    pub const fn key_len(&self) -> usize {
        match self {
            Self::TripleDesCbc => 24,
            Self::Aes128Cbc => 16,
            Self::Aes256Cbc => 32,
        }
    }

    /// Block size, which is also the IV length.
    pub const fn block_len(&self) -> usize {
        match self {
            Self::TripleDesCbc => 8,
            Self::Aes128Cbc | Self::Aes256Cbc => 16,
        }
    }
}
