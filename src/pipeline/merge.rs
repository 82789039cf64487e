//! Merge & deduplication stage.
//!
//! Combines per-source batches into one ordered, unique sequence:
//! concatenate, drop duplicate ids (first-seen wins, content is not
//! compared), stable-sort ascending by timestamp.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::models::{CanonicalTransaction, DerivativesTransaction};

/// Anything mergeable: canonical and derivatives records both qualify.
pub trait LedgerRecord {
    fn record_id(&self) -> &str;
    fn record_timestamp(&self) -> DateTime<Utc>;
}

impl LedgerRecord for CanonicalTransaction {
    fn record_id(&self) -> &str {
        &self.id
    }
    fn record_timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl LedgerRecord for DerivativesTransaction {
    fn record_id(&self) -> &str {
        &self.id
    }
    fn record_timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Merge any number of batches into one deduplicated, time-ordered batch.
///
/// Guarantees: no two output entries share an id; timestamps are
/// non-decreasing; entries with equal timestamps keep their input order.
pub fn merge<T: LedgerRecord>(batches: Vec<Vec<T>>) -> Vec<T> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out: Vec<T> = Vec::new();

    for batch in batches {
        for record in batch {
            if seen.insert(record.record_id().to_string()) {
                out.push(record);
            } else {
                log::debug!("Dropping duplicate entry '{}'", record.record_id());
            }
        }
    }

    // Vec::sort_by_key is stable, preserving input order for ties.
    out.sort_by_key(|r| r.record_timestamp());
    out
}
