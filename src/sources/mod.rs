//! Source adapters.
//!
//! One adapter per upstream source, each translating that source's native
//! event format into canonical transactions. Raw payload shapes are private
//! to their adapter; downstream stages only see the canonical model.

pub mod cosmoshub;
pub mod hyperliquid;
pub mod kraken;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::IngestError;
use crate::fetch::FetchOptions;
use crate::models::{CanonicalTransaction, DerivativesTransaction};

/// The account or address whose activity is being ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectIdentity {
    /// Address, account name, or API-key label depending on the source.
    pub subject_id: String,
    /// Optional API credential for authenticated sources.
    pub api_key: Option<String>,
}

impl SubjectIdentity {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// Inclusive date bounds on the requested activity. Absent bounds mean
/// unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl TimeRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        let date = timestamp.date_naive();
        if let Some(start) = self.start {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if date > end {
                return false;
            }
        }
        true
    }
}

/// Historical price collaborator: date to unit price in the reference
/// currency, or absent. The pipeline never fetches prices itself.
pub trait PriceLookup: Send + Sync {
    fn price_on(&self, currency: &str, date: NaiveDate) -> Option<f64>;
}

/// Fixed in-memory price table.
#[derive(Default)]
pub struct StaticPriceTable {
    prices: std::collections::HashMap<(String, NaiveDate), f64>,
}

impl StaticPriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, currency: &str, date: NaiveDate, price: f64) {
        self.prices.insert((currency.to_uppercase(), date), price);
    }
}

impl PriceLookup for StaticPriceTable {
    fn price_on(&self, currency: &str, date: NaiveDate) -> Option<f64> {
        self.prices.get(&(currency.to_uppercase(), date)).copied()
    }
}

/// Lookup that knows no prices. For sources and tests where valuation is
/// deliberately absent.
pub struct NoPrices;

impl PriceLookup for NoPrices {
    fn price_on(&self, _currency: &str, _date: NaiveDate) -> Option<f64> {
        None
    }
}

/// Contract for spot-activity sources.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable identifier used in cache keys and log lines.
    fn source_id(&self) -> &'static str;

    /// Fetch and normalize all activity for one subject in one range.
    ///
    /// Internally rate-limited and fetch-layer-backed. Per-event parse
    /// failures are skipped with a warning; the batch continues.
    async fn fetch_activity(
        &self,
        identity: &SubjectIdentity,
        range: &TimeRange,
        price: &dyn PriceLookup,
        options: &FetchOptions,
    ) -> Result<Vec<CanonicalTransaction>, IngestError>;
}

/// Contract for margin/perpetual-position sources.
#[async_trait]
pub trait DerivativesAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_activity(
        &self,
        identity: &SubjectIdentity,
        range: &TimeRange,
        options: &FetchOptions,
    ) -> Result<Vec<DerivativesTransaction>, IngestError>;
}
