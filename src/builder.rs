//! Security Builder: turns a plain SOAP envelope into a WS-Security one.
//!
//! The steps run in a fixed order. A Timestamp and the client certificate
//! go into the Security header first, then the Body and Timestamp are
//! signed, and finally the Body content (and by default the Signature) is
//! encrypted under a fresh session key wrapped for the server.

use crate::algorithm::{
    DataEncryption, SignatureAlgorithm, BASE64_BINARY, DSIG_NS, EXC_C14N, RSA_1_5, SOAP_11_NS,
    SOAP_12_NS, TYPE_CONTENT, TYPE_ELEMENT, WSSE_NS, WSU_NS, X509_SKI_TOKEN, X509_V3_TOKEN,
    XENC_NS,
};
use crate::c14n::canonicalize;
use crate::cipher::{encrypt, generate_session_key, sign, wrap_key};
use crate::config::WsSecurityConfig;
use crate::document::{Document, NodeId};
use crate::error::BuildError;
use crate::keys::KeyMaterial;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";
const DEFAULT_TTL_SECS: i64 = 300;

/// Options for securing outgoing envelopes.
#[derive(Debug, Clone)]
pub struct BuilderOptions {
    /// Validity window written into the Timestamp
    pub timestamp_ttl: Duration,
    pub signature_algorithm: SignatureAlgorithm,
    pub data_encryption: DataEncryption,
    /// Encrypt the Signature element as well as the Body content
    pub encrypt_signature: bool,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            timestamp_ttl: Duration::seconds(DEFAULT_TTL_SECS),
            signature_algorithm: SignatureAlgorithm::RsaSha1,
            data_encryption: DataEncryption::TripleDesCbc,
            encrypt_signature: true,
        }
    }
}

impl From<&WsSecurityConfig> for BuilderOptions {
    fn from(config: &WsSecurityConfig) -> Self {
        let ttl = i64::try_from(config.timestamp_ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::seconds(DEFAULT_TTL_SECS));
        Self {
            timestamp_ttl: ttl,
            signature_algorithm: config.signature_algorithm,
            data_encryption: config.data_encryption,
            encrypt_signature: config.encrypt_signature,
        }
    }
}

/// Envelope elements located before securing.
struct EnvelopeParts {
    envelope: NodeId,
    body: NodeId,
    soap_ns: &'static str,
    soap_prefix: String,
}

/// Signs and encrypts outgoing SOAP envelopes.
///
/// Holds only read-only key material; every call generates its own
/// session key, so one builder can be shared between concurrent calls.
#[derive(Debug, Clone)]
pub struct SecurityBuilder {
    keys: Arc<KeyMaterial>,
    options: BuilderOptions,
}

impl SecurityBuilder {
    pub fn new(keys: Arc<KeyMaterial>, options: BuilderOptions) -> Self {
        Self { keys, options }
    }

    /// Secure `envelope` with a Timestamp starting now.
    pub fn secure(&self, envelope: &str) -> Result<String, BuildError> {
        self.secure_at(envelope, Utc::now())
    }

    /// Secure `envelope` with a Timestamp starting at `now`.
    pub fn secure_at(&self, envelope: &str, now: DateTime<Utc>) -> Result<String, BuildError> {
        let mut doc = Document::parse(envelope)?;
        let parts = locate_envelope(&doc)?;

        let header = ensure_header(&mut doc, &parts);
        let security = ensure_security(&mut doc, header, &parts);

        // 1. Timestamp
        let timestamp = self.append_timestamp(&mut doc, security, now);

        // 2-3. Certificate token and the signature bound to it
        let token_id = self.append_security_token(&mut doc, security);
        let body_id = ensure_wsu_id(&mut doc, parts.body, "Body");
        let timestamp_id = ensure_wsu_id(&mut doc, timestamp, "TS");
        let signature = self.append_signature(
            &mut doc,
            security,
            &[(parts.body, body_id), (timestamp, timestamp_id)],
            &token_id,
        )?;

        // 4. Session key
        let algorithm = self.options.data_encryption;
        let session_key = generate_session_key(algorithm);
        let key_id = new_id("EK");

        // 5. Body content, then the Signature element
        let mut data_ids = Vec::with_capacity(2);
        data_ids.push(self.encrypt_body_content(&mut doc, parts.body, &session_key, &key_id)?);
        if self.options.encrypt_signature {
            data_ids.push(self.encrypt_element(&mut doc, signature, &session_key, &key_id)?);
        }

        // 6. Wrapped session key
        self.prepend_encrypted_key(&mut doc, security, &key_id, &session_key, &data_ids)?;

        debug!(
            envelope_ns = parts.soap_ns,
            algorithm = algorithm.uri(),
            signature_algorithm = self.options.signature_algorithm.uri(),
            encrypted = data_ids.len(),
            "Envelope secured"
        );

        Ok(doc.to_xml())
    }

    fn append_timestamp(&self, doc: &mut Document, security: NodeId, now: DateTime<Utc>) -> NodeId {
        let expires = now + self.options.timestamp_ttl;
        let timestamp = doc.append_element(security, "wsu:Timestamp");
        doc.set_attribute(timestamp, "wsu:Id", &new_id("TS"));
        doc.append_text_element(timestamp, "wsu:Created", &now.format(TIMESTAMP_FORMAT).to_string());
        doc.append_text_element(
            timestamp,
            "wsu:Expires",
            &expires.format(TIMESTAMP_FORMAT).to_string(),
        );
        timestamp
    }

    fn append_security_token(&self, doc: &mut Document, security: NodeId) -> String {
        let id = new_id("X509");
        let encoded = STANDARD.encode(self.keys.client_certificate().der());
        let token = doc.append_text_element(security, "wsse:BinarySecurityToken", &encoded);
        doc.set_attribute(token, "EncodingType", BASE64_BINARY);
        doc.set_attribute(token, "ValueType", X509_V3_TOKEN);
        doc.set_attribute(token, "wsu:Id", &id);
        id
    }

    fn append_signature(
        &self,
        doc: &mut Document,
        security: NodeId,
        references: &[(NodeId, String)],
        token_id: &str,
    ) -> Result<NodeId, BuildError> {
        let algorithm = self.options.signature_algorithm;

        let signature = doc.append_element(security, "ds:Signature");
        doc.set_attribute(signature, "xmlns:ds", DSIG_NS);
        doc.set_attribute(signature, "Id", &new_id("SIG"));

        let signed_info = doc.append_element(signature, "ds:SignedInfo");
        let c14n_method = doc.append_element(signed_info, "ds:CanonicalizationMethod");
        doc.set_attribute(c14n_method, "Algorithm", EXC_C14N);
        let signature_method = doc.append_element(signed_info, "ds:SignatureMethod");
        doc.set_attribute(signature_method, "Algorithm", algorithm.uri());

        for (target, id) in references {
            let digest = algorithm.digest(canonicalize(doc, *target).as_bytes());

            let reference = doc.append_element(signed_info, "ds:Reference");
            doc.set_attribute(reference, "URI", &format!("#{}", id));
            let transforms = doc.append_element(reference, "ds:Transforms");
            let transform = doc.append_element(transforms, "ds:Transform");
            doc.set_attribute(transform, "Algorithm", EXC_C14N);
            let digest_method = doc.append_element(reference, "ds:DigestMethod");
            doc.set_attribute(digest_method, "Algorithm", algorithm.digest_uri());
            doc.append_text_element(reference, "ds:DigestValue", &STANDARD.encode(digest));
        }

        let signed = canonicalize(doc, signed_info);
        let value = sign(self.keys.client_private_key(), algorithm, signed.as_bytes())
            .map_err(|e| BuildError::Signature(e.to_string()))?;
        doc.append_text_element(signature, "ds:SignatureValue", &STANDARD.encode(value));

        let key_info = doc.append_element(signature, "ds:KeyInfo");
        let token_ref = append_token_reference(doc, key_info);
        let reference = doc.append_element(token_ref, "wsse:Reference");
        doc.set_attribute(reference, "URI", &format!("#{}", token_id));
        doc.set_attribute(reference, "ValueType", X509_V3_TOKEN);

        Ok(signature)
    }

    /// Replace the children of `body` with one EncryptedData of Type Content.
    fn encrypt_body_content(
        &self,
        doc: &mut Document,
        body: NodeId,
        session_key: &[u8],
        key_id: &str,
    ) -> Result<String, BuildError> {
        let plaintext = doc.inner_xml(body);
        let (encrypted, id) = self.encrypted_data(doc, TYPE_CONTENT, &plaintext, session_key, key_id)?;
        doc.take_children(body);
        doc.append_child(body, encrypted);
        Ok(id)
    }

    /// Replace `element` with an EncryptedData of Type Element.
    fn encrypt_element(
        &self,
        doc: &mut Document,
        element: NodeId,
        session_key: &[u8],
        key_id: &str,
    ) -> Result<String, BuildError> {
        let plaintext = doc.node_to_xml(element);
        let (encrypted, id) = self.encrypted_data(doc, TYPE_ELEMENT, &plaintext, session_key, key_id)?;
        doc.replace_with(element, &[encrypted]);
        Ok(id)
    }

    fn encrypted_data(
        &self,
        doc: &mut Document,
        data_type: &str,
        plaintext: &str,
        session_key: &[u8],
        key_id: &str,
    ) -> Result<(NodeId, String), BuildError> {
        let algorithm = self.options.data_encryption;
        let ciphertext = encrypt(algorithm, session_key, plaintext.as_bytes())
            .map_err(|e| BuildError::Encryption(e.to_string()))?;

        let id = new_id("ED");
        let encrypted = doc.create_element("xenc:EncryptedData");
        doc.set_attribute(encrypted, "xmlns:xenc", XENC_NS);
        doc.set_attribute(encrypted, "Id", &id);
        doc.set_attribute(encrypted, "Type", data_type);

        let method = doc.append_element(encrypted, "xenc:EncryptionMethod");
        doc.set_attribute(method, "Algorithm", algorithm.uri());

        let key_info = doc.append_element(encrypted, "ds:KeyInfo");
        doc.set_attribute(key_info, "xmlns:ds", DSIG_NS);
        let token_ref = append_token_reference(doc, key_info);
        let reference = doc.append_element(token_ref, "wsse:Reference");
        doc.set_attribute(reference, "URI", &format!("#{}", key_id));

        let cipher_data = doc.append_element(encrypted, "xenc:CipherData");
        doc.append_text_element(cipher_data, "xenc:CipherValue", &STANDARD.encode(ciphertext));

        Ok((encrypted, id))
    }

    fn prepend_encrypted_key(
        &self,
        doc: &mut Document,
        security: NodeId,
        key_id: &str,
        session_key: &[u8],
        data_ids: &[String],
    ) -> Result<(), BuildError> {
        let server = self.keys.server_certificate();
        let wrapped = wrap_key(server.public_key(), session_key)
            .map_err(|e| BuildError::Encryption(format!("session key wrap failed: {}", e)))?;

        let encrypted_key = doc.create_element("xenc:EncryptedKey");
        doc.set_attribute(encrypted_key, "xmlns:xenc", XENC_NS);
        doc.set_attribute(encrypted_key, "Id", key_id);

        let method = doc.append_element(encrypted_key, "xenc:EncryptionMethod");
        doc.set_attribute(method, "Algorithm", RSA_1_5);

        let key_info = doc.append_element(encrypted_key, "ds:KeyInfo");
        doc.set_attribute(key_info, "xmlns:ds", DSIG_NS);
        let token_ref = append_token_reference(doc, key_info);
        let identifier = doc.append_text_element(
            token_ref,
            "wsse:KeyIdentifier",
            &STANDARD.encode(server.subject_key_identifier()),
        );
        doc.set_attribute(identifier, "EncodingType", BASE64_BINARY);
        doc.set_attribute(identifier, "ValueType", X509_SKI_TOKEN);

        let cipher_data = doc.append_element(encrypted_key, "xenc:CipherData");
        doc.append_text_element(cipher_data, "xenc:CipherValue", &STANDARD.encode(wrapped));

        let reference_list = doc.append_element(encrypted_key, "xenc:ReferenceList");
        for id in data_ids {
            let data_ref = doc.append_element(reference_list, "xenc:DataReference");
            doc.set_attribute(data_ref, "URI", &format!("#{}", id));
        }

        doc.prepend_child(security, encrypted_key);
        Ok(())
    }
}

fn locate_envelope(doc: &Document) -> Result<EnvelopeParts, BuildError> {
    let envelope = doc.root();
    let soap_ns = if doc.is_element(envelope, SOAP_11_NS, "Envelope") {
        SOAP_11_NS
    } else if doc.is_element(envelope, SOAP_12_NS, "Envelope") {
        SOAP_12_NS
    } else {
        return Err(BuildError::InvalidEnvelope(
            "root element is not a SOAP Envelope".to_string(),
        ));
    };

    let body = doc
        .find_child(envelope, soap_ns, "Body")
        .ok_or_else(|| BuildError::InvalidEnvelope("missing Body".to_string()))?;
    let soap_prefix = doc
        .element(envelope)
        .and_then(|el| el.prefix())
        .unwrap_or("")
        .to_string();

    Ok(EnvelopeParts {
        envelope,
        body,
        soap_ns,
        soap_prefix,
    })
}

fn ensure_header(doc: &mut Document, parts: &EnvelopeParts) -> NodeId {
    if let Some(header) = doc.find_child(parts.envelope, parts.soap_ns, "Header") {
        return header;
    }
    let header = doc.create_element(&qualify(&parts.soap_prefix, "Header"));
    doc.prepend_child(parts.envelope, header);
    header
}

fn ensure_security(doc: &mut Document, header: NodeId, parts: &EnvelopeParts) -> NodeId {
    let security = match doc.find_child(header, WSSE_NS, "Security") {
        Some(existing) => existing,
        None => {
            let security = doc.create_element("wsse:Security");
            doc.set_attribute(security, "xmlns:wsse", WSSE_NS);
            doc.prepend_child(header, security);

            // Attributes need a prefix even when the envelope uses a
            // default namespace.
            let prefix = if parts.soap_prefix.is_empty() {
                doc.set_attribute(security, "xmlns:soapenv", parts.soap_ns);
                "soapenv"
            } else {
                parts.soap_prefix.as_str()
            };
            doc.set_attribute(security, &format!("{}:mustUnderstand", prefix), "1");
            security
        }
    };
    doc.ensure_namespace(security, "wsse", WSSE_NS);
    doc.ensure_namespace(security, "wsu", WSU_NS);
    security
}

/// Return the element's `Id`, adding a `wsu:Id` when it has none.
fn ensure_wsu_id(doc: &mut Document, id: NodeId, prefix: &str) -> String {
    if let Some(existing) = doc.attribute_by_local_name(id, "Id") {
        return existing.to_string();
    }
    let value = new_id(prefix);
    doc.ensure_namespace(id, "wsu", WSU_NS);
    doc.set_attribute(id, "wsu:Id", &value);
    value
}

/// SecurityTokenReference declaring its own namespace, so the reference
/// survives being encrypted and moved out of the Security header.
fn append_token_reference(doc: &mut Document, key_info: NodeId) -> NodeId {
    let token_ref = doc.append_element(key_info, "wsse:SecurityTokenReference");
    doc.set_attribute(token_ref, "xmlns:wsse", WSSE_NS);
    token_ref
}

fn qualify(prefix: &str, local: &str) -> String {
    if prefix.is_empty() {
        local.to_string()
    } else {
        format!("{}:{}", prefix, local)
    }
}

fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}
