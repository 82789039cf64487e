//! Hyperliquid adapter for perpetual-position activity.
//!
//! The info endpoint answers POST queries: `userFills` for trade fills and
//! `userFunding` for funding payments. Both normalize into
//! [`DerivativesTransaction`]; the fill's `dir` prefix decides the position
//! tag. Several fills may share one transaction hash (partial fills), so
//! ids continue a per-hash `{hash}-{index}` sequence in emission order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::IngestError;
use crate::fetch::{FetchClient, FetchOptions, FetchRequest};
use crate::models::{DerivativesTransaction, PositionTag};
use crate::ratelimit::SourceRateLimiter;
use crate::sources::{DerivativesAdapter, SubjectIdentity, TimeRange};

const SOURCE_ID: &str = "hyperliquid";
const DEFAULT_BASE_URL: &str = "https://api.hyperliquid.xyz";
const REQUESTS_PER_SECOND: u32 = 4;

pub struct HyperliquidAdapter {
    fetch: FetchClient,
    limiter: SourceRateLimiter,
    base_url: String,
}

impl HyperliquidAdapter {
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

    async fn query<T: serde::de::DeserializeOwned>(
        &self,
        body: serde_json::Value,
        options: &FetchOptions,
    ) -> Result<T, IngestError> {
        self.limiter.acquire().await;

        let request =
            FetchRequest::post_json(format!("{}/info", self.base_url), body.to_string());
        let response = self
            .fetch
            .execute(&request, options)
            .await
            .map_err(IngestError::from)?
            .into_result()?;

        response
            .json()
            .map_err(|e| IngestError::malformed(SOURCE_ID, e.to_string()))
    }
}

#[async_trait]
impl DerivativesAdapter for HyperliquidAdapter {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    async fn fetch_activity(
        &self,
        identity: &SubjectIdentity,
        range: &TimeRange,
        options: &FetchOptions,
    ) -> Result<Vec<DerivativesTransaction>, IngestError> {
        let user = identity.subject_id.trim();

        let fills: Vec<Fill> = self
            .query(
                serde_json::json!({"type": "userFills", "user": user}),
                options,
            )
            .await?;

        let start_millis = range
            .start
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|ts| ts.and_utc().timestamp_millis())
            .unwrap_or(0);
        let funding: Vec<FundingRow> = self
            .query(
                serde_json::json!({
                    "type": "userFunding",
                    "user": user,
                    "startTime": start_millis
                }),
                options,
            )
            .await?;

        let mut out = normalize_fills(fills);
        out.extend(normalize_funding(funding));

        log::info!("Normalized {} entries from {}", out.len(), SOURCE_ID);
        Ok(out
            .into_iter()
            .filter(|e| range.contains(e.timestamp))
            .collect())
    }
}

fn normalize_fills(fills: Vec<Fill>) -> Vec<DerivativesTransaction> {
    let mut per_hash: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::new();

    for fill in fills {
        let Some(timestamp) = parse_millis(fill.time) else {
            log::warn!("Skipping fill with out-of-range time {}", fill.time);
            continue;
        };
        let (Ok(amount), Ok(pnl)) = (fill.sz.parse::<f64>(), fill.closed_pnl.parse::<f64>())
        else {
            log::warn!("Skipping unparseable fill for {}", fill.coin);
            continue;
        };
        let fee = fill.fee.parse::<f64>().unwrap_or(0.0);

        let index = per_hash.entry(fill.hash.clone()).or_insert(0);
        let id = format!("{}-{}", fill.hash, index);
        *index += 1;

        out.push(DerivativesTransaction {
            id,
            timestamp,
            asset: fill.coin.clone(),
            amount: amount.abs(),
            fee,
            realized_pnl: pnl,
            payment_token: fill.fee_token.unwrap_or_else(|| "USDC".to_string()),
            position_tag: tag_from_dir(&fill.dir),
            origin_hash: fill.hash,
            notes: fill.dir,
            ambiguity_flag: false,
            ambiguity_reasons: vec![],
        });
    }
    out
}

fn normalize_funding(rows: Vec<FundingRow>) -> Vec<DerivativesTransaction> {
    let mut out = Vec::new();

    for row in rows {
        let Some(timestamp) = parse_millis(row.time) else {
            continue;
        };
        let Ok(usdc) = row.delta.usdc.parse::<f64>() else {
            log::warn!("Skipping unparseable funding row for {}", row.delta.coin);
            continue;
        };

        // Funding hashes are often empty; fall back to a synthetic origin.
        let origin = if row.hash.is_empty() {
            format!("funding-{}-{}", row.delta.coin, row.time)
        } else {
            row.hash
        };

        out.push(DerivativesTransaction {
            id: format!("{}-0", origin),
            timestamp,
            asset: row.delta.coin.clone(),
            amount: usdc.abs(),
            fee: 0.0,
            realized_pnl: usdc,
            payment_token: "USDC".to_string(),
            position_tag: PositionTag::FundingPayment,
            origin_hash: origin,
            notes: format!("Funding payment for {}", row.delta.coin),
            ambiguity_flag: false,
            ambiguity_reasons: vec![],
        });
    }
    out
}

/// `dir` values look like "Open Long", "Close Short", "Long > Short".
fn tag_from_dir(dir: &str) -> PositionTag {
    if dir.starts_with("Close") {
        PositionTag::ClosePosition
    } else {
        PositionTag::OpenPosition
    }
}

fn parse_millis(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

#[derive(Debug, Deserialize)]
struct Fill {
    coin: String,
    sz: String,
    time: i64,
    #[serde(rename = "closedPnl")]
    closed_pnl: String,
    dir: String,
    hash: String,
    #[serde(default)]
    fee: String,
    #[serde(rename = "feeToken")]
    fee_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FundingRow {
    time: i64,
    #[serde(default)]
    hash: String,
    delta: FundingDelta,
}

#[derive(Debug, Deserialize)]
struct FundingDelta {
    coin: String,
    usdc: String,
}
