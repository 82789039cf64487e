//! Kraken adapter over the exchange ledger REST API.
//!
//! The ledger endpoint returns flat rows; rows sharing a `refid` belong to
//! one native transaction and are grouped before normalization. A trade
//! shows up as a debit row plus a credit row and collapses into a single
//! canonical Trade entry with both sides populated. Row fees are summed
//! onto the first emitted entry of the origin.
//!
//! Kraken asset naming: crypto assets carry an X prefix (XXBT = Bitcoin,
//! XETH = Ethereum), fiat currencies a Z prefix (ZEUR, ZUSD).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::IngestError;
use crate::fetch::{FetchClient, FetchOptions, FetchRequest};
use crate::models::{CanonicalTransaction, TransactionKind};
use crate::ratelimit::SourceRateLimiter;
use crate::sources::{PriceLookup, SourceAdapter, SubjectIdentity, TimeRange};

const SOURCE_ID: &str = "kraken";
const DEFAULT_BASE_URL: &str = "https://api.kraken.com/0";
const PAGE_SIZE: usize = 50;
const REQUESTS_PER_SECOND: u32 = 1;

pub struct KrakenAdapter {
    fetch: FetchClient,
    limiter: SourceRateLimiter,
    base_url: String,
}

impl KrakenAdapter {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::with_client(
            FetchClient::new()?,
            DEFAULT_BASE_URL.to_string(),
        ))
    }

    pub fn with_client(fetch: FetchClient, base_url: String) -> Self {
        Self {
            fetch,
            limiter: SourceRateLimiter::new(REQUESTS_PER_SECOND),
            base_url,
        }
    }

    async fn fetch_ledger_rows(
        &self,
        identity: &SubjectIdentity,
        range: &TimeRange,
        options: &FetchOptions,
    ) -> Result<Vec<LedgerRow>, IngestError> {
        let mut rows: Vec<LedgerRow> = Vec::new();
        let mut offset = 0usize;

        loop {
            self.limiter.acquire().await;

            let mut url = format!("{}/private/Ledgers?ofs={}", self.base_url, offset);
            if let Some(start) = range.start {
                if let Some(ts) = start.and_hms_opt(0, 0, 0) {
                    url.push_str(&format!("&start={}", ts.and_utc().timestamp()));
                }
            }
            if let Some(end) = range.end {
                if let Some(ts) = end.and_hms_opt(23, 59, 59) {
                    url.push_str(&format!("&end={}", ts.and_utc().timestamp()));
                }
            }

            let mut request = FetchRequest::get(&url);
            if let Some(ref key) = identity.api_key {
                request = request.header("API-Key", key);
            }

            let response = self
                .fetch
                .execute(&request, options)
                .await
                .map_err(IngestError::from)?
                .into_result()?;

            let data: KrakenResponse<LedgerResult> = response
                .json()
                .map_err(|e| IngestError::malformed(SOURCE_ID, e.to_string()))?;

            if !data.error.is_empty() {
                return Err(IngestError::malformed(SOURCE_ID, data.error.join(", ")));
            }
            let result = data
                .result
                .ok_or_else(|| IngestError::malformed(SOURCE_ID, "no result in response"))?;

            let page_len = result.ledger.len();
            log::debug!("Fetched {} ledger rows at offset {}", page_len, offset);

            rows.extend(result.ledger.into_values());

            offset += page_len;
            if page_len < PAGE_SIZE || offset >= result.count {
                return Ok(rows);
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for KrakenAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    async fn fetch_activity(
        &self,
        identity: &SubjectIdentity,
        range: &TimeRange,
        price: &dyn PriceLookup,
        options: &FetchOptions,
    ) -> Result<Vec<CanonicalTransaction>, IngestError> {
        let rows = self.fetch_ledger_rows(identity, range, options).await?;
        let out = normalize_rows(rows, price);

        log::info!("Normalized {} entries from {}", out.len(), SOURCE_ID);
        Ok(out
            .into_iter()
            .filter(|e| range.contains(e.timestamp))
            .collect())
    }
}

/// Group rows by refid and normalize each group.
fn normalize_rows(rows: Vec<LedgerRow>, price: &dyn PriceLookup) -> Vec<CanonicalTransaction> {
    let mut groups: Vec<(String, Vec<LedgerRow>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in rows {
        match index.get(&row.refid).copied() {
            Some(i) => groups[i].1.push(row),
            None => {
                index.insert(row.refid.clone(), groups.len());
                groups.push((row.refid.clone(), vec![row]));
            }
        }
    }

    let mut out = Vec::new();
    for (refid, mut group) in groups {
        group.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));
        match normalize_group(&refid, &group, price) {
            Ok(entries) => out.extend(entries),
            Err(reason) => {
                // One bad native transaction never aborts the batch.
                log::warn!("Skipping ledger group {}: {}", refid, reason);
            }
        }
    }
    out
}

fn normalize_group(
    refid: &str,
    group: &[LedgerRow],
    price: &dyn PriceLookup,
) -> Result<Vec<CanonicalTransaction>, String> {
    let first = group.first().ok_or("empty group")?;
    let timestamp = parse_time(first.time).ok_or("unparseable time")?;
    let date = timestamp.date_naive();

    let total_fee: f64 = group
        .iter()
        .filter_map(|r| r.fee.parse::<f64>().ok())
        .sum();
    let fee_currency = group
        .iter()
        .find(|r| r.fee.parse::<f64>().map(|f| f > 0.0).unwrap_or(false))
        .map(|r| normalize_asset(&r.asset));

    let mut entries: Vec<CanonicalTransaction> = Vec::new();

    if group.iter().all(|r| r.kind == "trade") && group.len() == 2 {
        // Debit + credit pair collapses to one Trade entry.
        let amounts: Vec<f64> = group
            .iter()
            .map(|r| r.amount.parse::<f64>().map_err(|e| e.to_string()))
            .collect::<Result<_, _>>()?;
        let (debit, credit) = if amounts[0] < 0.0 {
            (0usize, 1usize)
        } else {
            (1usize, 0usize)
        };
        if amounts[debit] >= 0.0 || amounts[credit] <= 0.0 {
            return Err("trade pair is not one debit and one credit".to_string());
        }

        let sent_currency = normalize_asset(&group[debit].asset);
        let received_currency = normalize_asset(&group[credit].asset);
        entries.push(
            CanonicalTransaction::new(
                format!("{}-0", refid),
                TransactionKind::Trade,
                timestamp,
                refid.to_string(),
                format!("Trade {} for {}", sent_currency, received_currency),
            )
            .with_sent(amounts[debit].abs(), &sent_currency)
            .with_received(amounts[credit], &received_currency)
            .with_fiat_price(price.price_on(&received_currency, date)),
        );
    } else {
        for row in group {
            let amount: f64 = row.amount.parse().map_err(|e: std::num::ParseFloatError| {
                e.to_string()
            })?;
            let row_ts = parse_time(row.time).ok_or("unparseable time")?;
            let currency = normalize_asset(&row.asset);

            let kind = match row.kind.as_str() {
                "deposit" => TransactionKind::TransferReceived,
                "withdrawal" => TransactionKind::TransferSent,
                "staking" | "earn" => TransactionKind::Reward,
                "transfer" => TransactionKind::InternalMove,
                // Unknown row kinds fall back to the amount sign.
                _ if amount > 0.0 => TransactionKind::TransferReceived,
                _ if amount < 0.0 => TransactionKind::TransferSent,
                _ => {
                    log::debug!(
                        "Skipping zero-amount '{}' row in group {}",
                        row.kind,
                        refid
                    );
                    continue;
                }
            };

            let mut tx = CanonicalTransaction::new(
                format!("{}-{}", refid, entries.len()),
                kind,
                row_ts,
                refid.to_string(),
                format!("Ledger {} entry", row.kind),
            )
            .with_fiat_price(price.price_on(&currency, row_ts.date_naive()));

            // The row's sign decides the side, not its kind: a transfer
            // pair has one debit row and one credit row of the same kind.
            tx = if amount < 0.0 {
                tx.with_sent(amount.abs(), &currency)
            } else {
                tx.with_received(amount.abs(), &currency)
            };
            entries.push(tx);
        }
    }

    // Fee single-owner rule: the whole group's fee lands on the first entry.
    if total_fee > 0.0 {
        if let (Some(entry), Some(currency)) = (entries.first_mut(), fee_currency) {
            entry.fee_amount = total_fee;
            entry.fee_currency = Some(currency);
        }
    }

    Ok(entries)
}

fn parse_time(epoch: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(epoch.trunc() as i64, 0)
}

/// Strip Kraken's internal asset prefixes back to common symbols.
fn normalize_asset(asset: &str) -> String {
    match asset {
        "XXBT" | "XBT" => "BTC".to_string(),
        "XDG" => "DOGE".to_string(),
        other => {
            let upper = other.to_uppercase();
            // XETH -> ETH, ZEUR -> EUR; short codes like SOL pass through.
            if upper.len() >= 4 && (upper.starts_with('X') || upper.starts_with('Z')) {
                upper[1..].to_string()
            } else {
                upper
            }
        }
    }
}

/// Kraken API response wrapper.
#[derive(Debug, Deserialize)]
struct KrakenResponse<T> {
    error: Vec<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct LedgerResult {
    ledger: HashMap<String, LedgerRow>,
    #[serde(default)]
    count: usize,
}

#[derive(Debug, Deserialize)]
struct LedgerRow {
    refid: String,
    time: f64,
    #[serde(rename = "type")]
    kind: String,
    asset: String,
    amount: String,
    #[serde(default)]
    fee: String,
}
