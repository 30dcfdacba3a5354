//! Secure Transport Client.
//!
//! Wraps one request/response exchange: secures outgoing SOAP envelopes,
//! hands the bytes to a [`Transport`], and decrypts encrypted responses.
//! The transport itself (HTTP, retries, timeouts) lives outside this crate.

use crate::builder::{BuilderOptions, SecurityBuilder};
use crate::config::WsSecurityConfig;
use crate::decryptor::{has_encryption_markers, DecryptOutcome, ResponseDecryptor};
use crate::error::{BuildError, ClientError, DecryptError, TransportError};
use crate::keys::KeyMaterial;
use crate::trace::{NoopSink, TraceSink, TraceStage};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Carries a serialized request to the customs service and returns the
/// raw response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, request: String) -> Result<String, TransportError>;
}

/// Response handed back to the caller.
#[derive(Debug, Clone)]
pub struct SecureResponse {
    /// Response envelope, decrypted when it was encrypted
    pub envelope: String,
    /// Decrypt report, present when the decryptor ran
    pub decryption: Option<DecryptOutcome>,
}

impl SecureResponse {
    /// False when some response elements are still encrypted.
    pub fn is_complete(&self) -> bool {
        self.decryption.as_ref().map_or(true, DecryptOutcome::is_complete)
    }
}

/// Counters since the client was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub requests_secured: u64,
    pub requests_passed_through: u64,
    pub responses_decrypted: u64,
    pub responses_with_failures: u64,
}

/// SOAP client applying WS-Security around a [`Transport`].
pub struct SecureClient<T: Transport> {
    transport: T,
    builder: SecurityBuilder,
    decryptor: Option<ResponseDecryptor>,
    trace_sink: Arc<dyn TraceSink>,
    requests_secured: AtomicU64,
    requests_passed_through: AtomicU64,
    responses_decrypted: AtomicU64,
    responses_with_failures: AtomicU64,
}

impl<T: Transport> SecureClient<T> {
    /// Create a client; the decryptor is only set up when
    /// `decrypt_responses` is enabled.
    pub fn new(transport: T, keys: Arc<KeyMaterial>, config: &WsSecurityConfig) -> Self {
        let decryptor = config.decrypt_responses.then(|| {
            ResponseDecryptor::from_key_material(&keys)
                .with_missing_key_policy(config.missing_key_policy)
        });
        let builder = SecurityBuilder::new(keys, BuilderOptions::from(config));

        info!(
            decrypt_responses = decryptor.is_some(),
            signature_algorithm = config.signature_algorithm.uri(),
            data_encryption = config.data_encryption.uri(),
            "Secure SOAP client initialized"
        );

        Self {
            transport,
            builder,
            decryptor,
            trace_sink: Arc::new(NoopSink),
            requests_secured: AtomicU64::new(0),
            requests_passed_through: AtomicU64::new(0),
            responses_decrypted: AtomicU64::new(0),
            responses_with_failures: AtomicU64::new(0),
        }
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = sink;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Secure `payload` when it is an unsecured SOAP envelope, otherwise
    /// return it untouched.
    pub fn prepare_request(&self, payload: &str) -> Result<String, BuildError> {
        self.trace_sink.record(TraceStage::OutgoingPlain, payload);

        let request = if should_secure(payload) {
            let secured = self.builder.secure(payload)?;
            self.requests_secured.fetch_add(1, Ordering::Relaxed);
            debug!(
                plain_bytes = payload.len(),
                secured_bytes = secured.len(),
                "Request secured"
            );
            secured
        } else {
            self.requests_passed_through.fetch_add(1, Ordering::Relaxed);
            debug!(bytes = payload.len(), "Request passed through unsecured");
            payload.to_string()
        };

        self.trace_sink.record(TraceStage::OutgoingSecured, &request);
        Ok(request)
    }

    /// Decrypt `raw` when it carries encryption markers and a decryptor
    /// is configured.
    pub fn process_response(&self, raw: &str) -> Result<SecureResponse, DecryptError> {
        self.trace_sink.record(TraceStage::IncomingRaw, raw);

        let decryptor = match &self.decryptor {
            Some(decryptor) if has_encryption_markers(raw) => decryptor,
            _ => {
                return Ok(SecureResponse {
                    envelope: raw.to_string(),
                    decryption: None,
                })
            }
        };

        let outcome = decryptor.decrypt(raw)?;
        if outcome.decrypted > 0 {
            self.responses_decrypted.fetch_add(1, Ordering::Relaxed);
        }
        if !outcome.is_complete() {
            self.responses_with_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                failures = outcome.failures.len(),
                decrypted = outcome.decrypted,
                "Response only partially decrypted"
            );
        }

        self.trace_sink
            .record(TraceStage::IncomingDecrypted, &outcome.envelope);
        Ok(SecureResponse {
            envelope: outcome.envelope.clone(),
            decryption: Some(outcome),
        })
    }

    /// Secure, exchange, decrypt.
    pub async fn call(&self, payload: &str) -> Result<SecureResponse, ClientError> {
        let request = self.prepare_request(payload)?;
        let raw = self.transport.exchange(request).await?;
        Ok(self.process_response(&raw)?)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            requests_secured: self.requests_secured.load(Ordering::Relaxed),
            requests_passed_through: self.requests_passed_through.load(Ordering::Relaxed),
            responses_decrypted: self.responses_decrypted.load(Ordering::Relaxed),
            responses_with_failures: self.responses_with_failures.load(Ordering::Relaxed),
        }
    }
}

/// Unsecured SOAP envelopes get secured; anything else, including a retry
/// of an already-secured request, goes out as is.
fn should_secure(payload: &str) -> bool {
    looks_like_soap_envelope(payload) && !has_prefixed_start_tag(payload, "EncryptedKey")
}

/// Whether raw text contains a namespace-prefixed `Envelope` start tag
/// such as `<soapenv:Envelope`.
pub fn looks_like_soap_envelope(raw: &str) -> bool {
    has_prefixed_start_tag(raw, "Envelope")
}

/// Whether raw text contains a `<prefix:local` start tag. The name must end
/// right after `local`, so `<p:EnvelopeX` does not count.
fn has_prefixed_start_tag(raw: &str, local: &str) -> bool {
    let marker = format!(":{}", local);
    raw.match_indices(marker.as_str()).any(|(index, marker)| {
        let closes_name = raw[index + marker.len()..]
            .chars()
            .next()
            .map_or(false, |c| c == '>' || c == '/' || c.is_whitespace());
        let prefix_ok = raw[..index].rfind('<').map_or(false, |start| {
            let prefix = &raw[start + 1..index];
            !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
        });
        closes_name && prefix_ok
    })
}
