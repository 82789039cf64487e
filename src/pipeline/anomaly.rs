//! Anomaly detector.
//!
//! Annotates a merged batch with review flags for downstream human review.
//! Rules are evaluated independently; an entry may accumulate several
//! reasons. Flagging is purely additive: amounts, currencies and ordering
//! are never changed and no entry is removed.

use crate::models::{
    CanonicalTransaction, DerivativesTransaction, PositionTag, ReviewReason,
};

/// Deviation threshold for the statistical outlier rules.
pub const OUTLIER_SIGMA: f64 = 3.0;

/// Minimum number of qualifying samples before the outlier rules fire.
pub const MIN_OUTLIER_SAMPLES: usize = 5;

/// Running sums over the qualifying sample values, for leave-one-out
/// statistics. The entry under test is excluded from its own baseline; a
/// single extreme value would otherwise inflate the deviation enough to
/// mask itself.
struct SampleStats {
    count: usize,
    sum: f64,
    sum_sq: f64,
}

impl SampleStats {
    fn of(values: impl Iterator<Item = f64>) -> Self {
        let mut stats = Self {
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
        };
        for v in values {
            stats.count += 1;
            stats.sum += v;
            stats.sum_sq += v * v;
        }
        stats
    }

    /// Whether `value` deviates from the mean of the remaining samples by
    /// more than `sigma` of their standard deviations.
    fn is_outlier(&self, value: f64, sigma: f64) -> bool {
        let n = (self.count - 1) as f64;
        if n < 1.0 {
            return false;
        }
        let mean = (self.sum - value) / n;
        let variance = ((self.sum_sq - value * value) / n - mean * mean).max(0.0);
        (value - mean).abs() > sigma * variance.sqrt()
    }
}

/// Flag statistically suspicious entries in a spot batch.
pub fn flag(mut batch: Vec<CanonicalTransaction>) -> Vec<CanonicalTransaction> {
    // Missing valuation only applies when at least one entry in the batch
    // carries a positive price; an all-unpriced batch never triggers it.
    let batch_has_price = batch
        .iter()
        .any(|t| t.fiat_price_at_time.map(|p| p > 0.0).unwrap_or(false));

    let stats = SampleStats::of(batch.iter().map(|t| t.magnitude()).filter(|m| *m > 0.0));
    let outlier_rule_active = stats.count >= MIN_OUTLIER_SAMPLES;

    for tx in &mut batch {
        let magnitude = tx.magnitude();

        if batch_has_price
            && magnitude > 0.0
            && !tx.fiat_price_at_time.map(|p| p > 0.0).unwrap_or(false)
        {
            tx.add_review_reason(ReviewReason::MissingFiatPrice);
        }

        if outlier_rule_active && magnitude > 0.0 && stats.is_outlier(magnitude, OUTLIER_SIGMA) {
            tx.add_review_reason(ReviewReason::StatisticalOutlier);
        }

        if magnitude == 0.0 && tx.fee_amount > 0.0 {
            // Signature of a failed call or an approval-only event.
            tx.add_review_reason(ReviewReason::ZeroValueWithFee);
        }

        let self_transfer = match (&tx.sent_currency, &tx.received_currency) {
            (Some(sent), Some(received)) => {
                sent == received
                    && tx.sent_amount.unwrap_or(0.0) > 0.0
                    && tx.received_amount.unwrap_or(0.0) > 0.0
            }
            _ => false,
        };
        if self_transfer {
            tx.add_review_reason(ReviewReason::SelfTransfer);
        }
    }

    let flagged = batch.iter().filter(|t| t.ambiguity_flag).count();
    if flagged > 0 {
        log::info!("Anomaly detector flagged {}/{} entries", flagged, batch.len());
    }
    batch
}

/// Flag suspicious entries in a derivatives batch.
///
/// Zero realized P&L on a close is always suspicious; P&L outliers use the
/// same sample-size and sigma thresholds as the spot amount rule.
pub fn flag_derivatives(
    mut batch: Vec<DerivativesTransaction>,
) -> Vec<DerivativesTransaction> {
    let stats = SampleStats::of(batch.iter().map(|t| t.realized_pnl).filter(|p| *p != 0.0));
    let outlier_rule_active = stats.count >= MIN_OUTLIER_SAMPLES;

    for tx in &mut batch {
        if tx.position_tag == PositionTag::ClosePosition && tx.realized_pnl == 0.0 {
            tx.add_review_reason(ReviewReason::ZeroPnlOnClose);
        }

        if outlier_rule_active
            && tx.realized_pnl != 0.0
            && stats.is_outlier(tx.realized_pnl, OUTLIER_SIGMA)
        {
            tx.add_review_reason(ReviewReason::PnlOutlier);
        }
    }

    batch
}
