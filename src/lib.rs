//! chainledger - multi-source crypto transaction ingestion pipeline.
//!
//! Ingests activity from heterogeneous ledger sources (blockchains and
//! exchange APIs), normalizes each source's native events into one
//! canonical transaction model, merges and deduplicates across sources,
//! flags statistically suspicious entries for human review, and caches
//! finished results so repeated queries avoid rate-limited round trips.
//!
//! Layering, leaf first: `fetch` (retrying executor) and `ratelimit`
//! (per-source gate) feed `sources` (adapters), whose canonical output
//! flows through `pipeline` (merge, anomaly flagging, orchestration) into
//! `cache` over an injected `store`.

pub mod cache;
pub mod error;
pub mod fetch;
pub mod models;
pub mod pipeline;
pub mod ratelimit;
pub mod sources;
pub mod store;

pub use error::IngestError;
pub use fetch::{CancelToken, FetchClient, FetchOptions, RetryPolicy};
pub use models::{
    CanonicalTransaction, ClassificationTag, DerivativesPayload, DerivativesTransaction,
    ExportPayload, PositionTag, ReviewReason, TransactionKind,
};
pub use pipeline::ExportPipeline;
pub use sources::{
    DerivativesAdapter, PriceLookup, SourceAdapter, SubjectIdentity, TimeRange,
};
