//! Integration tests for the soap-wsse crate.
//!
//! These tests exercise the public API surface end-to-end: securing a
//! request, decrypting it the way the customs service does, and running a
//! full exchange against an in-memory service.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use pretty_assertions::assert_eq;
use rsa::Pkcs1v15Sign;
use sha1::{Digest, Sha1};
use soap_wsse::algorithm::{
    DataEncryption, DSIG_NS, SOAP_11_NS, TYPE_CONTENT, WSSE_NS, WSU_NS, XENC_NS,
};
use soap_wsse::c14n::canonicalize;
use soap_wsse::document::{Document, NodeId};
use soap_wsse::error::TransportError;
use soap_wsse::keys::{private_key_from_pem, Certificate};
use soap_wsse::{
    BuilderOptions, ClientError, DecryptError, FailureCode, KeyMaterial, MissingKeyPolicy,
    ResponseDecryptor, SecureClient, SecurityBuilder, TraceSink, TraceStage, Transport,
    WsSecurityConfig,
};
use std::sync::{Arc, Mutex};

const CLIENT_CERT: &str = include_str!("fixtures/client-cert.pem");
const CLIENT_KEY: &str = include_str!("fixtures/client-key.pem");
const SERVER_CERT: &str = include_str!("fixtures/server-cert.pem");
const SERVER_KEY: &str = include_str!("fixtures/server-key.pem");
const STRANGER_KEY: &str = include_str!("fixtures/stranger-key.pem");

const DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:cus="urn:customs:manifest:v2">
  <soapenv:Header/>
  <soapenv:Body>
    <cus:SubmitBillOfLading>
      <cus:Number>MSKU-2024-118833</cus:Number>
      <cus:Consignee>Harbour &amp; Rail Logistics</cus:Consignee>
      <cus:Containers>
        <cus:Container seal="A1234">MSKU1234565</cus:Container>
      </cus:Containers>
    </cus:SubmitBillOfLading>
  </soapenv:Body>
</soapenv:Envelope>"#;

// ============================================================================
// Helpers
// ============================================================================

fn client_keys() -> Arc<KeyMaterial> {
    Arc::new(KeyMaterial::from_pem(CLIENT_CERT, CLIENT_KEY, SERVER_CERT).unwrap())
}

/// Key material as seen from the customs service: it signs with its own
/// key and encrypts for the client.
fn service_keys() -> Arc<KeyMaterial> {
    Arc::new(KeyMaterial::from_pem(SERVER_CERT, SERVER_KEY, CLIENT_CERT).unwrap())
}

fn service_decryptor() -> ResponseDecryptor {
    ResponseDecryptor::new(private_key_from_pem(SERVER_KEY).unwrap())
}

fn body_text(envelope: &str) -> String {
    let doc = Document::parse(envelope).unwrap();
    let body = doc.find_child(doc.root(), SOAP_11_NS, "Body").unwrap();
    doc.inner_xml(body)
}

/// In-memory customs service: decrypts the request with its private key
/// and answers with an encrypted acknowledgement.
struct CustomsService {
    builder: SecurityBuilder,
    decryptor: ResponseDecryptor,
    received: Mutex<Vec<String>>,
}

impl CustomsService {
    fn new() -> Self {
        Self {
            builder: SecurityBuilder::new(service_keys(), BuilderOptions::default()),
            decryptor: service_decryptor(),
            received: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Transport for CustomsService {
    async fn exchange(&self, request: String) -> Result<String, TransportError> {
        let outcome = self
            .decryptor
            .decrypt(&request)
            .map_err(|e| TransportError::Status {
                status: 500,
                body: e.to_string(),
            })?;
        let doc = Document::parse(&outcome.envelope).map_err(|e| TransportError::Other(e.to_string()))?;
        let numbers = doc.find_descendants(doc.root(), "urn:customs:manifest:v2", "Number");
        let number = numbers.first().map(|&n| doc.text_content(n)).unwrap_or_default();
        self.received.lock().unwrap().push(outcome.envelope);

        let ack = format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"><soapenv:Body><cus:Ack xmlns:cus="urn:customs:manifest:v2"><cus:Number>{}</cus:Number><cus:Status>ACCEPTED</cus:Status></cus:Ack></soapenv:Body></soapenv:Envelope>"#,
            number
        );
        self.builder
            .secure(&ack)
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

#[derive(Default)]
struct MemorySink(Mutex<Vec<(TraceStage, String)>>);

impl TraceSink for MemorySink {
    fn record(&self, stage: TraceStage, payload: &str) {
        self.0.lock().unwrap().push((stage, payload.to_string()));
    }
}

// ============================================================================
// Round trip
// ============================================================================

#[test]
fn test_round_trip_recovers_body() {
    for data_encryption in [
        DataEncryption::TripleDesCbc,
        DataEncryption::Aes128Cbc,
        DataEncryption::Aes256Cbc,
    ] {
        let options = BuilderOptions {
            data_encryption,
            ..Default::default()
        };
        let secured = SecurityBuilder::new(client_keys(), options)
            .secure(DECLARATION)
            .unwrap();
        assert!(!secured.contains("MSKU-2024-118833"));

        let outcome = service_decryptor().decrypt(&secured).unwrap();
        assert!(outcome.is_complete());
        assert_eq!(body_text(&outcome.envelope), body_text(DECLARATION));
    }
}

#[test]
fn test_decrypted_request_keeps_security_header() {
    let secured = SecurityBuilder::new(client_keys(), BuilderOptions::default())
        .secure(DECLARATION)
        .unwrap();
    let outcome = service_decryptor().decrypt(&secured).unwrap();

    let doc = Document::parse(&outcome.envelope).unwrap();
    assert_eq!(doc.find_descendants(doc.root(), WSU_NS, "Timestamp").len(), 1);
    assert_eq!(
        doc.find_descendants(doc.root(), DSIG_NS, "Signature").len(),
        1
    );
    assert!(doc.find_descendants(doc.root(), XENC_NS, "EncryptedData").is_empty());
}

/// Check the SignedInfo Reference for `node` against a fresh digest.
fn assert_reference_digest(doc: &Document, signed_info: NodeId, node: NodeId) {
    let id = doc.attribute(node, "wsu:Id").unwrap();
    let reference = doc
        .find_descendants(signed_info, DSIG_NS, "Reference")
        .into_iter()
        .find(|&r| doc.attribute(r, "URI") == Some(format!("#{}", id).as_str()))
        .unwrap();
    let digest_value = doc.find_child(reference, DSIG_NS, "DigestValue").unwrap();
    assert_eq!(
        doc.text_content(digest_value),
        STANDARD.encode(Sha1::digest(canonicalize(doc, node).as_bytes()))
    );
}

#[test]
fn test_signature_verifies_after_decrypt() {
    let crlf = DECLARATION.replace('\n', "\r\n");
    for envelope in [DECLARATION, crlf.as_str()] {
        let secured = SecurityBuilder::new(client_keys(), BuilderOptions::default())
            .secure(envelope)
            .unwrap();
        let outcome = service_decryptor().decrypt(&secured).unwrap();
        assert!(outcome.is_complete());

        let doc = Document::parse(&outcome.envelope).unwrap();
        let signed_info = doc.find_descendants(doc.root(), DSIG_NS, "SignedInfo")[0];
        assert_eq!(
            doc.find_descendants(signed_info, DSIG_NS, "Reference").len(),
            2
        );

        let body = doc.find_child(doc.root(), SOAP_11_NS, "Body").unwrap();
        assert_reference_digest(&doc, signed_info, body);
        let timestamp = doc.find_descendants(doc.root(), WSU_NS, "Timestamp")[0];
        assert_reference_digest(&doc, signed_info, timestamp);

        // The SignatureValue checks out against the embedded token.
        let token = doc.find_descendants(doc.root(), WSSE_NS, "BinarySecurityToken")[0];
        let der: String = doc
            .text_content(token)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let certificate = Certificate::from_der(STANDARD.decode(der).unwrap()).unwrap();
        let value = doc.find_descendants(doc.root(), DSIG_NS, "SignatureValue")[0];
        let signature = STANDARD.decode(doc.text_content(value).trim()).unwrap();
        certificate
            .public_key()
            .verify(
                Pkcs1v15Sign::new::<Sha1>(),
                &Sha1::digest(canonicalize(&doc, signed_info).as_bytes()),
                &signature,
            )
            .unwrap();
    }
}

#[test]
fn test_decrypt_is_noop_on_plain_envelope() {
    let outcome = service_decryptor().decrypt(DECLARATION).unwrap();
    assert_eq!(outcome.envelope, DECLARATION);
    assert_eq!(outcome.decrypted, 0);
}

#[test]
fn test_wrong_private_key_is_fatal() {
    let secured = SecurityBuilder::new(client_keys(), BuilderOptions::default())
        .secure(DECLARATION)
        .unwrap();

    // The session key is wrapped for the service, not for the client.
    let client_side = ResponseDecryptor::from_key_material(&client_keys());
    assert!(matches!(client_side.decrypt(&secured), Err(DecryptError::KeyUnwrap(_))));

    let stranger = ResponseDecryptor::new(private_key_from_pem(STRANGER_KEY).unwrap());
    assert!(matches!(stranger.decrypt(&secured), Err(DecryptError::KeyUnwrap(_))));
}

#[test]
fn test_unknown_algorithm_does_not_cascade() {
    let secured = SecurityBuilder::new(client_keys(), BuilderOptions::default())
        .secure(DECLARATION)
        .unwrap();
    let mut doc = Document::parse(&secured).unwrap();
    let body_data = doc
        .find_descendants(doc.root(), XENC_NS, "EncryptedData")
        .into_iter()
        .find(|&d| doc.attribute(d, "Type") == Some(TYPE_CONTENT))
        .unwrap();
    let method = doc.find_child(body_data, XENC_NS, "EncryptionMethod").unwrap();
    doc.set_attribute(method, "Algorithm", "http://www.w3.org/2009/xmlenc11#aes128-gcm");

    let outcome = service_decryptor().decrypt(&doc.to_xml()).unwrap();
    assert!(!outcome.is_complete());
    assert_eq!(outcome.decrypted, 1);
    assert_eq!(outcome.failures[0].code, FailureCode::UnsupportedAlgorithm);

    // Body stays encrypted, the Signature in the header is back.
    assert!(!outcome.envelope.contains("MSKU-2024-118833"));
    assert!(outcome.envelope.contains("SignatureValue"));
}

#[test]
fn test_tampered_body_still_decrypts() {
    // Swap in the encrypted Body of a different declaration while keeping
    // the original signature: decryption does not verify signatures.
    let builder = SecurityBuilder::new(
        client_keys(),
        BuilderOptions {
            encrypt_signature: false,
            ..Default::default()
        },
    );
    let forged_declaration = DECLARATION.replace("MSKU-2024-118833", "MSKU-2024-999999");
    let original = builder.secure(DECLARATION).unwrap();
    let forged = builder.secure(&forged_declaration).unwrap();

    let encryption_parts = |xml: &str| {
        let doc = Document::parse(xml).unwrap();
        let key = doc.find_descendants(doc.root(), XENC_NS, "EncryptedKey")[0];
        let data = doc.find_descendants(doc.root(), XENC_NS, "EncryptedData")[0];
        (doc.node_to_xml(key), doc.node_to_xml(data))
    };
    let (original_key, original_data) = encryption_parts(&original);
    let (forged_key, forged_data) = encryption_parts(&forged);
    let tampered = original
        .replace(&original_key, &forged_key)
        .replace(&original_data, &forged_data);
    assert!(tampered.contains("SignatureValue"));

    let outcome = service_decryptor().decrypt(&tampered).unwrap();
    assert!(outcome.is_complete());
    assert_eq!(body_text(&outcome.envelope), body_text(&forged_declaration));
}

#[test]
fn test_missing_key_policy_reject() {
    let xml = format!(
        r#"<s:Envelope xmlns:s="{}"><s:Body><xenc:EncryptedData xmlns:xenc="{}"/></s:Body></s:Envelope>"#,
        SOAP_11_NS, XENC_NS
    );
    let passthrough = service_decryptor().decrypt(&xml).unwrap();
    assert_eq!(passthrough.envelope, xml);

    let reject = service_decryptor().with_missing_key_policy(MissingKeyPolicy::Reject);
    assert!(matches!(reject.decrypt(&xml), Err(DecryptError::MissingEncryptedKey)));
}

// ============================================================================
// Secure client
// ============================================================================

#[tokio::test]
async fn test_full_exchange_with_customs_service() {
    let sink = Arc::new(MemorySink::default());
    let client = SecureClient::new(CustomsService::new(), client_keys(), &WsSecurityConfig::default())
        .with_trace_sink(sink.clone());

    let response = client.call(DECLARATION).await.unwrap();
    assert!(response.is_complete());
    assert!(response.envelope.contains("<cus:Status>ACCEPTED</cus:Status>"));
    assert!(response.envelope.contains("<cus:Number>MSKU-2024-118833</cus:Number>"));

    let received = client.transport().received.lock().unwrap().clone();
    assert_eq!(body_text(&received[0]), body_text(DECLARATION));

    let stats = client.stats();
    assert_eq!(stats.requests_secured, 1);
    assert_eq!(stats.responses_decrypted, 1);
    assert_eq!(stats.responses_with_failures, 0);

    let stages: Vec<TraceStage> = sink.0.lock().unwrap().iter().map(|(s, _)| *s).collect();
    assert_eq!(
        stages,
        vec![
            TraceStage::OutgoingPlain,
            TraceStage::OutgoingSecured,
            TraceStage::IncomingRaw,
            TraceStage::IncomingDecrypted,
        ]
    );
    let records = sink.0.lock().unwrap();
    assert_eq!(records[0].1, DECLARATION);
    assert!(records[1].1.contains("EncryptedKey"));
    assert!(records[2].1.contains("EncryptedData"));
    assert_eq!(records[3].1, response.envelope);
}

#[tokio::test]
async fn test_client_passes_through_non_envelope() {
    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn exchange(&self, request: String) -> Result<String, TransportError> {
            Ok(request)
        }
    }

    let client = SecureClient::new(Echo, client_keys(), &WsSecurityConfig::default());
    let payload = "<Envelope><Body>no prefix, no marker</Body></Envelope>";
    let response = client.call(payload).await.unwrap();
    assert_eq!(response.envelope, payload);
    assert_eq!(client.stats().requests_passed_through, 1);
    assert_eq!(client.stats().requests_secured, 0);
}

#[tokio::test]
async fn test_service_error_surfaces_as_transport_error() {
    struct Unavailable;

    #[async_trait]
    impl Transport for Unavailable {
        async fn exchange(&self, _request: String) -> Result<String, TransportError> {
            Err(TransportError::Status {
                status: 503,
                body: "maintenance".to_string(),
            })
        }
    }

    let client = SecureClient::new(Unavailable, client_keys(), &WsSecurityConfig::default());
    let err = client.call(DECLARATION).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::Status { status: 503, .. })
    ));
}
