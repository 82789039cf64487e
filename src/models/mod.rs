//! Canonical transaction model.
//!
//! Every source adapter normalizes its native events into these types.
//! Downstream stages (merge, anomaly detection, caching, export) only ever
//! see this model - source-specific shapes stay inside their adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of taxable economic event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    TransferSent,
    TransferReceived,
    Stake,
    Unstake,
    Reward,
    Trade,
    InternalMove,
    Loss,
}

/// Fixed output vocabulary consumed by tax export writers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationTag {
    Payment,
    Receive,
    StakingDeposit,
    UnstakingWithdraw,
    ClaimRewards,
    Trade,
    WalletTransfer,
    Lost,
}

impl ClassificationTag {
    /// Pure lookup from event kind. Identical for every source; adapters
    /// never special-case classification by source identity.
    pub fn from_kind(kind: TransactionKind) -> Self {
        match kind {
            TransactionKind::TransferSent => Self::Payment,
            TransactionKind::TransferReceived => Self::Receive,
            TransactionKind::Stake => Self::StakingDeposit,
            TransactionKind::Unstake => Self::UnstakingWithdraw,
            TransactionKind::Reward => Self::ClaimRewards,
            TransactionKind::Trade => Self::Trade,
            TransactionKind::InternalMove => Self::WalletTransfer,
            TransactionKind::Loss => Self::Lost,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Receive => "receive",
            Self::StakingDeposit => "staking_deposit",
            Self::UnstakingWithdraw => "unstaking_withdraw",
            Self::ClaimRewards => "claim_rewards",
            Self::Trade => "trade",
            Self::WalletTransfer => "wallet_transfer",
            Self::Lost => "lost",
        }
    }
}

/// Review reason attached by the anomaly detector.
///
/// Advisory only - a flagged entry is a request for human review, never a
/// correctness failure. Export writers append these to the notes column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    MissingFiatPrice,
    StatisticalOutlier,
    ZeroValueWithFee,
    SelfTransfer,
    ZeroPnlOnClose,
    PnlOutlier,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingFiatPrice => "missing fiat price",
            Self::StatisticalOutlier => "statistical outlier",
            Self::ZeroValueWithFee => "zero value with fee",
            Self::SelfTransfer => "self transfer",
            Self::ZeroPnlOnClose => "zero realized P&L on close",
            Self::PnlOutlier => "P&L outlier",
        }
    }
}

impl std::fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One taxable economic event in source-agnostic form.
///
/// Export column mapping (external writer, not part of this crate):
/// `Date, ReceivedQuantity, ReceivedCurrency, ReceivedFiatAmount,
/// SentQuantity, SentCurrency, SentFiatAmount, FeeAmount, FeeCurrency,
/// TransactionHash, Notes, Tag`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalTransaction {
    /// Unique within a merged batch. Multi-event origins use
    /// `{origin_hash}-{index}` in adapter emission order.
    pub id: String,
    pub kind: TransactionKind,
    /// Always UTC.
    pub timestamp: DateTime<Utc>,
    pub sent_amount: Option<f64>,
    pub sent_currency: Option<String>,
    pub received_amount: Option<f64>,
    pub received_currency: Option<String>,
    /// Non-negative. For a multi-event origin exactly one constituent entry
    /// (the first emitted) carries the non-zero fee; siblings report zero.
    pub fee_amount: f64,
    pub fee_currency: Option<String>,
    /// Native source transaction identifier; may be shared by several
    /// canonical entries.
    pub origin_hash: String,
    pub notes: String,
    pub classification_tag: ClassificationTag,
    /// Unit price in the reference currency on the timestamp's date.
    pub fiat_price_at_time: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ambiguity_flag: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguity_reasons: Vec<ReviewReason>,
}

impl CanonicalTransaction {
    /// Build an entry with the classification derived from its kind.
    pub fn new(
        id: String,
        kind: TransactionKind,
        timestamp: DateTime<Utc>,
        origin_hash: String,
        notes: String,
    ) -> Self {
        Self {
            id,
            kind,
            timestamp,
            sent_amount: None,
            sent_currency: None,
            received_amount: None,
            received_currency: None,
            fee_amount: 0.0,
            fee_currency: None,
            origin_hash,
            notes,
            classification_tag: ClassificationTag::from_kind(kind),
            fiat_price_at_time: None,
            ambiguity_flag: false,
            ambiguity_reasons: vec![],
        }
    }

    pub fn with_sent(mut self, amount: f64, currency: &str) -> Self {
        self.sent_amount = Some(amount);
        self.sent_currency = Some(currency.to_string());
        self
    }

    pub fn with_received(mut self, amount: f64, currency: &str) -> Self {
        self.received_amount = Some(amount);
        self.received_currency = Some(currency.to_string());
        self
    }

    pub fn with_fee(mut self, amount: f64, currency: &str) -> Self {
        self.fee_amount = amount;
        self.fee_currency = Some(currency.to_string());
        self
    }

    pub fn with_fiat_price(mut self, price: Option<f64>) -> Self {
        self.fiat_price_at_time = price;
        self
    }

    /// Total value moved, used by the anomaly detector.
    pub fn magnitude(&self) -> f64 {
        self.sent_amount.unwrap_or(0.0).abs() + self.received_amount.unwrap_or(0.0).abs()
    }

    /// Attach a review reason. Additive: amounts and currencies are never
    /// touched by flagging.
    pub fn add_review_reason(&mut self, reason: ReviewReason) {
        self.ambiguity_flag = true;
        if !self.ambiguity_reasons.contains(&reason) {
            self.ambiguity_reasons.push(reason);
        }
    }
}

/// Side of a margin/perpetual position event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionTag {
    OpenPosition,
    ClosePosition,
    FundingPayment,
}

impl PositionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenPosition => "open_position",
            Self::ClosePosition => "close_position",
            Self::FundingPayment => "funding_payment",
        }
    }
}

/// Margin/perpetual-position variant of the canonical record.
///
/// Export column mapping (external writer): `Date, Asset, Amount, Fee, P&L,
/// PaymentToken, Notes, TransactionHash, Tag` with P&L rendered as `+x`,
/// `-x`, or bare `0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DerivativesTransaction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub asset: String,
    pub amount: f64,
    pub fee: f64,
    /// Signed realized profit and loss in the payment token.
    pub realized_pnl: f64,
    pub payment_token: String,
    pub position_tag: PositionTag,
    pub origin_hash: String,
    pub notes: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ambiguity_flag: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ambiguity_reasons: Vec<ReviewReason>,
}

impl DerivativesTransaction {
    pub fn add_review_reason(&mut self, reason: ReviewReason) {
        self.ambiguity_flag = true;
        if !self.ambiguity_reasons.contains(&reason) {
            self.ambiguity_reasons.push(reason);
        }
    }
}

/// Summary attached to a finished export payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub total_entries: usize,
    pub flagged_entries: usize,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

/// Finished (merged + flagged) spot batch as stored in the result cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayload {
    pub transactions: Vec<CanonicalTransaction>,
    pub summary: ExportSummary,
}

impl ExportPayload {
    pub fn from_transactions(transactions: Vec<CanonicalTransaction>) -> Self {
        let summary = ExportSummary {
            total_entries: transactions.len(),
            flagged_entries: transactions.iter().filter(|t| t.ambiguity_flag).count(),
            earliest: transactions.iter().map(|t| t.timestamp).min(),
            latest: transactions.iter().map(|t| t.timestamp).max(),
        };
        Self { transactions, summary }
    }
}

/// Finished derivatives batch as stored in the result cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DerivativesPayload {
    pub transactions: Vec<DerivativesTransaction>,
    pub summary: ExportSummary,
}

impl DerivativesPayload {
    pub fn from_transactions(transactions: Vec<DerivativesTransaction>) -> Self {
        let summary = ExportSummary {
            total_entries: transactions.len(),
            flagged_entries: transactions.iter().filter(|t| t.ambiguity_flag).count(),
            earliest: transactions.iter().map(|t| t.timestamp).min(),
            latest: transactions.iter().map(|t| t.timestamp).max(),
        };
        Self { transactions, summary }
    }
}
