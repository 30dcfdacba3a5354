//! Raw payload capture around a secured exchange.
//!
//! The client hands each stage of an exchange to a [`TraceSink`]. What the
//! sink does with it (nothing, log it, keep it for a diagnostics store) is
//! up to the caller.

use std::fmt;
use tracing::trace;

/// Point in the exchange a payload was captured at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceStage {
    /// Request as handed to the client
    OutgoingPlain,
    /// Request after securing, as sent
    OutgoingSecured,
    /// Response as received
    IncomingRaw,
    /// Response after decryption
    IncomingDecrypted,
}

impl TraceStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OutgoingPlain => "outgoing_plain",
            Self::OutgoingSecured => "outgoing_secured",
            Self::IncomingRaw => "incoming_raw",
            Self::IncomingDecrypted => "incoming_decrypted",
        }
    }
}

impl fmt::Display for TraceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observer for raw payloads.
pub trait TraceSink: Send + Sync {
    fn record(&self, stage: TraceStage, payload: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TraceSink for NoopSink {
    fn record(&self, _stage: TraceStage, _payload: &str) {}
}

/// Forwards payloads to `tracing` at TRACE level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn record(&self, stage: TraceStage, payload: &str) {
        trace!(stage = %stage, bytes = payload.len(), payload = %payload, "SOAP payload");
    }
}
