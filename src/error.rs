//! Error taxonomy for the ingestion pipeline.
//!
//! Propagation policy:
//! - Per-event parse failures (`MalformedSourceEvent`) are adapter-local:
//!   the offending event is skipped, the batch continues.
//! - Fetch failures that exhaust their retry budget surface as the terminal
//!   outcome, not as each intermediate attempt.
//! - Cache failures are fully absorbed inside the cache layer and never
//!   reach this taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Network-level failure that survived the standard retry budget.
    #[error("network failure after {attempts} attempts: {message}")]
    TransientNetwork { attempts: u32, message: String },

    /// Upstream kept answering 429 past the rate-limit retry budget.
    #[error("rate limited by upstream after {attempts} attempts")]
    RateLimited { attempts: u32 },

    /// Non-429 4xx, surfaced verbatim without retrying.
    #[error("request rejected with status {status}: {body}")]
    ClientRejected { status: u16, body: String },

    /// Upstream kept failing with 5xx past the standard retry budget.
    #[error("upstream unavailable, last status {status}: {body}")]
    UpstreamUnavailable { status: u16, body: String },

    /// The caller cancelled the request. Distinct from exhausted retries.
    #[error("request cancelled")]
    Cancelled,

    /// A single native event could not be parsed. Adapters log and skip;
    /// this only escapes when a whole response body is unreadable.
    #[error("malformed source event from {source_id}: {reason}")]
    MalformedSourceEvent {
        source_id: &'static str,
        reason: String,
    },
}

impl IngestError {
    pub fn malformed(source: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedSourceEvent {
            source_id: source,
            reason: reason.into(),
        }
    }
}
