//! Response Decryptor: reverses XML-Encryption in a SOAP response.
//!
//! Session keys are recovered from every supported EncryptedKey, then each
//! EncryptedData (Body content and any encrypted Security header entries)
//! is decrypted and spliced back into the tree on its own. A failure on one
//! element leaves that element encrypted and is reported, but never stops
//! the others.

use crate::algorithm::{DataEncryption, DSIG_NS, RSA_1_5, TYPE_ELEMENT, WSSE_NS, XENC_NS};
use crate::cipher::{decrypt, unwrap_key};
use crate::config::MissingKeyPolicy;
use crate::document::{Document, NodeId};
use crate::error::{DecryptError, ElementDecryptError, FailureCode};
use crate::keys::KeyMaterial;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rsa::RsaPrivateKey;
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Result of decrypting one response.
#[derive(Debug, Clone)]
pub struct DecryptOutcome {
    /// The envelope with every decryptable element replaced by plaintext
    pub envelope: String,
    /// Number of EncryptedData elements replaced
    pub decrypted: usize,
    /// Elements left encrypted
    pub failures: Vec<ElementDecryptError>,
    /// Elements whose plaintext was not XML and was inserted as text
    pub recovered: Vec<ElementDecryptError>,
}

impl DecryptOutcome {
    fn unchanged(envelope: &str) -> Self {
        Self {
            envelope: envelope.to_string(),
            decrypted: 0,
            failures: Vec::new(),
            recovered: Vec::new(),
        }
    }

    /// True when no element was left encrypted.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Whether raw text carries XML-Encryption markers.
pub fn has_encryption_markers(raw: &str) -> bool {
    raw.contains("EncryptedData") || raw.contains("EncryptedKey")
}

/// One EncryptedKey of the response, whether or not it could be unwrapped.
struct SessionKey {
    node: NodeId,
    id: Option<String>,
    key: Result<Zeroizing<Vec<u8>>, ElementDecryptError>,
    /// Ids listed in the key's ReferenceList, without the leading '#'
    references: Vec<String>,
}

impl SessionKey {
    fn unwrapped(&self) -> Option<&[u8]> {
        self.key.as_ref().ok().map(|key| key.as_slice())
    }
}

enum Spliced {
    Xml,
    Text(ElementDecryptError),
}

/// Decrypts encrypted SOAP responses with the client private key.
#[derive(Debug, Clone)]
pub struct ResponseDecryptor {
    private_key: RsaPrivateKey,
    missing_key_policy: MissingKeyPolicy,
}

impl ResponseDecryptor {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self {
            private_key,
            missing_key_policy: MissingKeyPolicy::default(),
        }
    }

    /// Decryptor for responses addressed to the client in `keys`.
    pub fn from_key_material(keys: &KeyMaterial) -> Self {
        Self::new(keys.client_private_key().clone())
    }

    pub fn with_missing_key_policy(mut self, policy: MissingKeyPolicy) -> Self {
        self.missing_key_policy = policy;
        self
    }

    /// Decrypt every EncryptedData in `envelope`.
    ///
    /// Input without encryption markers is returned unchanged. Fails as a
    /// whole only when no session key can be recovered, or when EncryptedData
    /// arrives without a key and the policy is [`MissingKeyPolicy::Reject`].
    pub fn decrypt(&self, envelope: &str) -> Result<DecryptOutcome, DecryptError> {
        if !has_encryption_markers(envelope) {
            return Ok(DecryptOutcome::unchanged(envelope));
        }

        let mut doc = Document::parse(envelope)?;
        let root = doc.root();
        let encrypted_keys = doc.find_descendants(root, XENC_NS, "EncryptedKey");
        let encrypted_data = doc.find_descendants(root, XENC_NS, "EncryptedData");

        if encrypted_keys.is_empty() {
            if encrypted_data.is_empty() {
                return Ok(DecryptOutcome::unchanged(envelope));
            }
            return match self.missing_key_policy {
                MissingKeyPolicy::PassThrough => {
                    warn!(
                        encrypted_data = encrypted_data.len(),
                        "EncryptedData without EncryptedKey, returning response unchanged"
                    );
                    Ok(DecryptOutcome::unchanged(envelope))
                }
                MissingKeyPolicy::Reject => Err(DecryptError::MissingEncryptedKey),
            };
        }

        let session_keys = self.unwrap_session_keys(&doc, &encrypted_keys)?;

        let mut outcome = DecryptOutcome::unchanged("");
        for &data in &encrypted_data {
            let element_id = doc.attribute(data, "Id").map(String::from);
            let result = select_key(&doc, data, element_id.as_deref(), &session_keys)
                .and_then(|key| decrypt_element(&mut doc, data, key));

            match result {
                Ok(spliced) => {
                    outcome.decrypted += 1;
                    if let Spliced::Text(recovered) = spliced {
                        let recovered = recovered.for_element(element_id.as_deref());
                        warn!(
                            element_id = ?recovered.element_id,
                            code = recovered.code.as_str(),
                            "Decrypted content is not XML, inserted as text"
                        );
                        outcome.recovered.push(recovered);
                    }
                }
                Err(failure) => {
                    let failure = failure.for_element(element_id.as_deref());
                    warn!(
                        element_id = ?failure.element_id,
                        code = failure.code.as_str(),
                        error = %failure.message,
                        "EncryptedData left encrypted"
                    );
                    outcome.failures.push(failure);
                }
            }
        }

        // Keys are only dropped once nothing refers to them any more.
        if outcome.failures.is_empty() {
            for &key in &encrypted_keys {
                doc.detach(key);
            }
        }

        debug!(
            decrypted = outcome.decrypted,
            failures = outcome.failures.len(),
            recovered = outcome.recovered.len(),
            "Response decrypted"
        );

        outcome.envelope = doc.to_xml();
        Ok(outcome)
    }

    /// Unwrap every EncryptedKey. Failed keys are kept so the elements they
    /// own can be reported instead of decrypted with some other key.
    fn unwrap_session_keys(
        &self,
        doc: &Document,
        encrypted_keys: &[NodeId],
    ) -> Result<Vec<SessionKey>, DecryptError> {
        let mut keys = Vec::with_capacity(encrypted_keys.len());

        for &encrypted_key in encrypted_keys {
            let id = doc.attribute(encrypted_key, "Id").map(String::from);
            let key = self.unwrap_one(doc, encrypted_key);
            if let Err(failure) = &key {
                warn!(
                    key_id = ?id,
                    code = failure.code.as_str(),
                    error = %failure.message,
                    "Skipping EncryptedKey"
                );
            }
            let references: Vec<String> = doc
                .find_child(encrypted_key, XENC_NS, "ReferenceList")
                .map(|list| {
                    doc.find_descendants(list, XENC_NS, "DataReference")
                        .into_iter()
                        .filter_map(|r| doc.attribute(r, "URI"))
                        .map(|uri| uri.trim_start_matches('#').to_string())
                        .collect()
                })
                .unwrap_or_default();
            keys.push(SessionKey {
                node: encrypted_key,
                id,
                key,
                references,
            });
        }

        if keys.iter().all(|k| k.key.is_err()) {
            let reasons: Vec<String> = keys
                .iter()
                .filter_map(|k| k.key.as_ref().err())
                .map(|failure| failure.to_string())
                .collect();
            return Err(DecryptError::KeyUnwrap(reasons.join("; ")));
        }
        Ok(keys)
    }

    fn unwrap_one(
        &self,
        doc: &Document,
        encrypted_key: NodeId,
    ) -> Result<Zeroizing<Vec<u8>>, ElementDecryptError> {
        let algorithm = doc
            .find_child(encrypted_key, XENC_NS, "EncryptionMethod")
            .and_then(|m| doc.attribute(m, "Algorithm"))
            .unwrap_or("");
        if algorithm.trim() != RSA_1_5 {
            return Err(ElementDecryptError::new(
                FailureCode::UnsupportedKeyTransport,
                format!("unsupported key transport '{}'", algorithm),
            ));
        }

        let wrapped = cipher_value(doc, encrypted_key)?;
        unwrap_key(&self.private_key, &wrapped)
            .map_err(|e| ElementDecryptError::new(FailureCode::InvalidCiphertext, e.to_string()))
    }
}

/// Find the session key that owns an EncryptedData.
///
/// An EncryptedKey inside the element's own KeyInfo wins, then the key whose
/// ReferenceList names the element, then the key its KeyInfo points at. An
/// element nothing refers to only falls back to the sole unwrapped key.
fn select_key<'a>(
    doc: &Document,
    data: NodeId,
    element_id: Option<&str>,
    keys: &'a [SessionKey],
) -> Result<&'a [u8], ElementDecryptError> {
    let key_info = doc.find_child(data, DSIG_NS, "KeyInfo");

    let embedded = key_info
        .and_then(|info| doc.find_child(info, XENC_NS, "EncryptedKey"))
        .and_then(|node| keys.iter().find(|k| k.node == node));
    let listed = || {
        let id = element_id?;
        keys.iter().find(|k| k.references.iter().any(|r| r == id))
    };
    let pointed = || {
        let reference = doc
            .find_descendants(key_info?, WSSE_NS, "Reference")
            .into_iter()
            .filter_map(|r| doc.attribute(r, "URI"))
            .map(|uri| uri.trim_start_matches('#'))
            .next()?;
        keys.iter().find(|k| k.id.as_deref() == Some(reference))
    };

    if let Some(owner) = embedded.or_else(listed).or_else(pointed) {
        return owner.key.as_ref().map(|key| key.as_slice()).map_err(|failure| {
            ElementDecryptError::new(
                FailureCode::KeyUnavailable,
                format!(
                    "session key from EncryptedKey '{}' was not recovered: {}",
                    owner.id.as_deref().unwrap_or(""),
                    failure
                ),
            )
        });
    }

    let mut unwrapped = keys.iter().filter_map(SessionKey::unwrapped);
    match (unwrapped.next(), unwrapped.next()) {
        (Some(key), None) => Ok(key),
        _ => Err(ElementDecryptError::new(
            FailureCode::KeyUnavailable,
            "no EncryptedKey refers to this element",
        )),
    }
}

fn decrypt_element(
    doc: &mut Document,
    data: NodeId,
    key: &[u8],
) -> Result<Spliced, ElementDecryptError> {
    let algorithm_uri = doc
        .find_child(data, XENC_NS, "EncryptionMethod")
        .and_then(|m| doc.attribute(m, "Algorithm"))
        .unwrap_or("")
        .to_string();
    let algorithm = DataEncryption::from_uri(&algorithm_uri).ok_or_else(|| {
        ElementDecryptError::new(
            FailureCode::UnsupportedAlgorithm,
            format!("unsupported EncryptionMethod '{}'", algorithm_uri),
        )
    })?;

    let ciphertext = cipher_value(doc, data)?;
    let plaintext = decrypt(algorithm, key, &ciphertext)
        .map_err(|e| ElementDecryptError::new(e.code(), e.to_string()))?;

    let whole_element = doc.attribute(data, "Type") == Some(TYPE_ELEMENT);
    let text = match String::from_utf8(plaintext) {
        Ok(text) => text,
        Err(e) => {
            let lossy = String::from_utf8_lossy(e.as_bytes()).into_owned();
            return Ok(splice_text(doc, data, &lossy, "decrypted bytes are not UTF-8"));
        }
    };

    match doc.parse_fragment(&text) {
        Ok(nodes) if !whole_element || single_element(doc, &nodes) => {
            doc.replace_with(data, &nodes);
            Ok(Spliced::Xml)
        }
        Ok(_) => Ok(splice_text(doc, data, &text, "decrypted Element is not a single element")),
        Err(e) => Ok(splice_text(doc, data, &text, &e.to_string())),
    }
}

fn splice_text(doc: &mut Document, data: NodeId, text: &str, reason: &str) -> Spliced {
    let node = doc.create_text(text);
    doc.replace_with(data, &[node]);
    Spliced::Text(ElementDecryptError::new(
        FailureCode::MalformedDecryptedContent,
        reason,
    ))
}

fn single_element(doc: &Document, nodes: &[NodeId]) -> bool {
    let elements = nodes.iter().filter(|&&n| doc.element(n).is_some()).count();
    let stray_text = nodes.iter().any(|&n| {
        doc.element(n).is_none() && !doc.node_to_xml(n).trim().is_empty()
    });
    elements == 1 && !stray_text
}

/// Base64-decoded `CipherData/CipherValue` of an EncryptedKey or EncryptedData.
fn cipher_value(doc: &Document, id: NodeId) -> Result<Vec<u8>, ElementDecryptError> {
    let value = doc
        .find_child(id, XENC_NS, "CipherData")
        .and_then(|data| doc.find_child(data, XENC_NS, "CipherValue"))
        .ok_or_else(|| {
            ElementDecryptError::new(FailureCode::MissingCipherValue, "no CipherData/CipherValue")
        })?;
    let encoded: String = doc
        .text_content(value)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    STANDARD
        .decode(encoded)
        .map_err(|e| ElementDecryptError::new(FailureCode::InvalidBase64, e.to_string()))
}
