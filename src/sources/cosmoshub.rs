//! Cosmos Hub adapter over the LCD REST API.
//!
//! One native transaction carries several messages; each message normalizes
//! independently, so a single txhash can expand into multiple canonical
//! entries sharing that origin hash. Message dispatch is a closed match over
//! the `@type` tag. Unrecognized kinds reconstruct value movement from the
//! `coin_spent`/`coin_received` log events when present and otherwise
//! produce no entries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::IngestError;
use crate::fetch::{FetchClient, FetchOptions, FetchRequest};
use crate::models::{CanonicalTransaction, TransactionKind};
use crate::ratelimit::SourceRateLimiter;
use crate::sources::{PriceLookup, SourceAdapter, SubjectIdentity, TimeRange};

const SOURCE_ID: &str = "cosmoshub";
const DEFAULT_BASE_URL: &str = "https://cosmos-rest.publicnode.com";
const PAGE_LIMIT: u32 = 100;
const REQUESTS_PER_SECOND: u32 = 2;

pub struct CosmosHubAdapter {
    fetch: FetchClient,
    limiter: SourceRateLimiter,
    base_url: String,
}

impl CosmosHubAdapter {
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

    /// Fetch every transaction page matching one event filter.
    async fn fetch_pages(
        &self,
        events_filter: &str,
        options: &FetchOptions,
        into: &mut BTreeMap<String, TxResponse>,
    ) -> Result<(), IngestError> {
        let mut page_key: Option<String> = None;

        loop {
            self.limiter.acquire().await;

            let mut url = format!(
                "{}/cosmos/tx/v1beta1/txs?events={}&pagination.limit={}",
                self.base_url,
                urlencoding::encode(events_filter),
                PAGE_LIMIT
            );
            if let Some(ref key) = page_key {
                url.push_str(&format!("&pagination.key={}", urlencoding::encode(key)));
            }

            let response = self
                .fetch
                .execute(&FetchRequest::get(&url), options)
                .await
                .map_err(IngestError::from)?
                .into_result()?;

            let page: TxSearchResponse = response
                .json()
                .map_err(|e| IngestError::malformed(SOURCE_ID, e.to_string()))?;

            log::debug!(
                "Fetched {} transactions for filter '{}'",
                page.tx_responses.len(),
                events_filter
            );

            for tx in page.tx_responses {
                into.entry(tx.txhash.clone()).or_insert(tx);
            }

            match page.pagination.and_then(|p| p.next_key).filter(|k| !k.is_empty()) {
                Some(next) => page_key = Some(next),
                None => return Ok(()),
            }
        }
    }

    fn normalize_tx(
        &self,
        tx: &TxResponse,
        identity: &SubjectIdentity,
        price: &dyn PriceLookup,
    ) -> Vec<CanonicalTransaction> {
        let timestamp = match DateTime::parse_from_rfc3339(&tx.timestamp) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => {
                log::warn!(
                    "Skipping transaction {} with unparseable timestamp: {}",
                    tx.txhash,
                    e
                );
                return vec![];
            }
        };

        let mut entries: Vec<CanonicalTransaction> = Vec::new();

        for (msg_index, message) in tx.tx.body.messages.iter().enumerate() {
            let log_events = tx
                .logs
                .iter()
                .find(|l| l.msg_index.unwrap_or(0) as usize == msg_index)
                .map(|l| l.events.as_slice())
                .unwrap_or(&[]);

            let built = normalize_message(
                message,
                log_events,
                &identity.subject_id,
                &tx.txhash,
                entries.len(),
                timestamp,
                price,
            );
            entries.extend(built);
        }

        // Tx-level fee belongs to the first emitted entry only.
        if let Some(first) = entries.first_mut() {
            if let Some(coin) = tx.tx.auth_info.fee.amount.first() {
                if let Some((amount, currency)) = convert_coin(coin) {
                    first.fee_amount = amount;
                    first.fee_currency = Some(currency);
                }
            }
        }

        entries
    }
}

#[async_trait]
impl SourceAdapter for CosmosHubAdapter {
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
        let address = identity.subject_id.trim();

        // Sent and received activity come from separate queries; keyed by
        // txhash so a self-send appears once.
        let mut raw: BTreeMap<String, TxResponse> = BTreeMap::new();
        self.fetch_pages(
            &format!("message.sender='{}'", address),
            options,
            &mut raw,
        )
        .await?;
        self.fetch_pages(
            &format!("transfer.recipient='{}'", address),
            options,
            &mut raw,
        )
        .await?;

        let mut txs: Vec<TxResponse> = raw.into_values().collect();
        txs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut out = Vec::new();
        for tx in &txs {
            let entries = self.normalize_tx(tx, identity, price);
            out.extend(entries.into_iter().filter(|e| range.contains(e.timestamp)));
        }

        log::info!(
            "Normalized {} entries from {} transactions for {}",
            out.len(),
            txs.len(),
            SOURCE_ID
        );
        Ok(out)
    }
}

/// Normalize one message. Emits 0..n entries; ids continue the per-tx
/// `{txhash}-{index}` sequence from `next_index`.
fn normalize_message(
    message: &TxMessage,
    log_events: &[LogEvent],
    subject: &str,
    txhash: &str,
    next_index: usize,
    timestamp: DateTime<Utc>,
    price: &dyn PriceLookup,
) -> Vec<CanonicalTransaction> {
    let entry_id = |offset: usize| format!("{}-{}", txhash, next_index + offset);
    let date = timestamp.date_naive();

    match message {
        TxMessage::Send {
            from_address,
            to_address,
            amount,
        } => {
            let Some((value, currency)) = amount.first().and_then(convert_coin) else {
                return vec![];
            };
            let is_sender = from_address == subject;
            let is_receiver = to_address == subject;

            let (kind, notes) = if is_sender && is_receiver {
                (TransactionKind::InternalMove, "Transfer to own address")
            } else if is_sender {
                (TransactionKind::TransferSent, "Bank send")
            } else if is_receiver {
                (TransactionKind::TransferReceived, "Bank receive")
            } else {
                return vec![];
            };

            let mut tx = CanonicalTransaction::new(
                entry_id(0),
                kind,
                timestamp,
                txhash.to_string(),
                notes.to_string(),
            )
            .with_fiat_price(price.price_on(&currency, date));
            if is_sender {
                tx = tx.with_sent(value, &currency);
            } else {
                tx = tx.with_received(value, &currency);
            }
            vec![tx]
        }
        TxMessage::Delegate { amount, .. } => {
            let Some((value, currency)) = convert_coin(amount) else {
                return vec![];
            };
            vec![CanonicalTransaction::new(
                entry_id(0),
                TransactionKind::Stake,
                timestamp,
                txhash.to_string(),
                "Delegate to validator".to_string(),
            )
            .with_sent(value, &currency)
            .with_fiat_price(price.price_on(&currency, date))]
        }
        TxMessage::Undelegate { amount, .. } => {
            let Some((value, currency)) = convert_coin(amount) else {
                return vec![];
            };
            vec![CanonicalTransaction::new(
                entry_id(0),
                TransactionKind::Unstake,
                timestamp,
                txhash.to_string(),
                "Undelegate from validator".to_string(),
            )
            .with_received(value, &currency)
            .with_fiat_price(price.price_on(&currency, date))]
        }
        TxMessage::WithdrawReward { .. } => {
            // Reward amounts only exist in the emitted log events.
            let received = sum_events(log_events, "coin_received", "receiver", subject);
            received
                .into_iter()
                .enumerate()
                .map(|(i, (value, currency))| {
                    CanonicalTransaction::new(
                        entry_id(i),
                        TransactionKind::Reward,
                        timestamp,
                        txhash.to_string(),
                        "Claim staking rewards".to_string(),
                    )
                    .with_received(value, &currency)
                    .with_fiat_price(price.price_on(&currency, date))
                })
                .collect()
        }
        TxMessage::Unknown => {
            // Fall back to low-level credit/debit signals; without them the
            // message produces no entries rather than a guessed one.
            let spent = sum_events(log_events, "coin_spent", "spender", subject);
            let received = sum_events(log_events, "coin_received", "receiver", subject);

            match (spent.first(), received.first()) {
                (Some((sv, sc)), Some((rv, rc))) => {
                    vec![CanonicalTransaction::new(
                        entry_id(0),
                        TransactionKind::Trade,
                        timestamp,
                        txhash.to_string(),
                        "Reconstructed from coin movement events".to_string(),
                    )
                    .with_sent(*sv, sc)
                    .with_received(*rv, rc)
                    .with_fiat_price(price.price_on(rc, date))]
                }
                (Some((sv, sc)), None) => {
                    vec![CanonicalTransaction::new(
                        entry_id(0),
                        TransactionKind::TransferSent,
                        timestamp,
                        txhash.to_string(),
                        "Reconstructed from coin movement events".to_string(),
                    )
                    .with_sent(*sv, sc)
                    .with_fiat_price(price.price_on(sc, date))]
                }
                (None, Some((rv, rc))) => {
                    vec![CanonicalTransaction::new(
                        entry_id(0),
                        TransactionKind::TransferReceived,
                        timestamp,
                        txhash.to_string(),
                        "Reconstructed from coin movement events".to_string(),
                    )
                    .with_received(*rv, rc)
                    .with_fiat_price(price.price_on(rc, date))]
                }
                (None, None) => {
                    log::debug!(
                        "Unknown message kind in {} with no coin events, skipping",
                        txhash
                    );
                    vec![]
                }
            }
        }
    }
}

/// Sum coin amounts per currency from log events of one type where the
/// party attribute matches the subject.
fn sum_events(
    events: &[LogEvent],
    event_type: &str,
    party_key: &str,
    subject: &str,
) -> Vec<(f64, String)> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();

    for event in events.iter().filter(|e| e.kind == event_type) {
        let party = event.attribute(party_key);
        if party != Some(subject) {
            continue;
        }
        let Some(raw) = event.attribute("amount") else {
            continue;
        };
        // Amounts may list several coins separated by commas.
        for part in raw.split(',') {
            if let Some((value, currency)) = parse_coin_str(part) {
                *totals.entry(currency).or_insert(0.0) += value;
            }
        }
    }

    totals.into_iter().map(|(c, v)| (v, c)).collect()
}

/// Convert a structured coin to display units.
fn convert_coin(coin: &Coin) -> Option<(f64, String)> {
    let amount: f64 = coin.amount.parse().ok()?;
    Some(scale_denom(amount, &coin.denom))
}

/// Parse a concatenated coin string such as `12345uatom`.
fn parse_coin_str(raw: &str) -> Option<(f64, String)> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let amount: f64 = raw[..split].parse().ok()?;
    let denom = &raw[split..];
    if denom.is_empty() {
        return None;
    }
    Some(scale_denom(amount, denom))
}

/// Micro-denominations (`uatom`) scale down by 1e6 to the display unit.
/// Anything else (IBC hashes, factory denoms) passes through unscaled.
fn scale_denom(amount: f64, denom: &str) -> (f64, String) {
    if let Some(rest) = denom.strip_prefix('u') {
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphabetic()) {
            return (amount / 1_000_000.0, rest.to_uppercase());
        }
    }
    (amount, denom.to_string())
}

// LCD response shapes. Only the fields the adapter reads are modeled.

#[derive(Debug, Deserialize)]
struct TxSearchResponse {
    #[serde(default)]
    tx_responses: Vec<TxResponse>,
    pagination: Option<Pagination>,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    txhash: String,
    timestamp: String,
    #[serde(default)]
    logs: Vec<TxLog>,
    tx: TxBodyWrapper,
}

#[derive(Debug, Deserialize)]
struct TxLog {
    msg_index: Option<u32>,
    #[serde(default)]
    events: Vec<LogEvent>,
}

#[derive(Debug, Deserialize)]
struct LogEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    attributes: Vec<LogAttribute>,
}

impl LogEvent {
    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct LogAttribute {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct TxBodyWrapper {
    body: TxBody,
    auth_info: AuthInfo,
}

#[derive(Debug, Deserialize)]
struct TxBody {
    #[serde(default)]
    messages: Vec<TxMessage>,
}

#[derive(Debug, Deserialize)]
struct AuthInfo {
    fee: Fee,
}

#[derive(Debug, Deserialize, Default)]
struct Fee {
    #[serde(default)]
    amount: Vec<Coin>,
}

#[derive(Debug, Deserialize)]
struct Coin {
    denom: String,
    amount: String,
}

/// Closed dispatch over the native message tag. Kinds outside this set
/// deserialize as `Unknown` and go through the coin-event fallback.
#[derive(Debug, Deserialize)]
#[serde(tag = "@type")]
enum TxMessage {
    #[serde(rename = "/cosmos.bank.v1beta1.MsgSend")]
    Send {
        from_address: String,
        to_address: String,
        #[serde(default)]
        amount: Vec<Coin>,
    },
    #[serde(rename = "/cosmos.staking.v1beta1.MsgDelegate")]
    Delegate { amount: Coin },
    #[serde(rename = "/cosmos.staking.v1beta1.MsgUndelegate")]
    Undelegate { amount: Coin },
    #[serde(rename = "/cosmos.distribution.v1beta1.MsgWithdrawDelegatorReward")]
    WithdrawReward {},
    #[serde(other)]
    Unknown,
}
