//! Export pipeline orchestration.
//!
//! One request runs strictly fetch -> normalize -> merge -> flag ->
//! cache-write, each stage consuming the prior stage's complete output.
//! Cancellation threads through the fetch layer only; once normalization
//! starts, the in-memory stages run to completion.
//!
//! Multi-source composition is the caller's decision: [`merge`] and the
//! flagging functions are exposed so per-source results can be combined,
//! and each `run` call fails independently when its adapter exhausts
//! retries.

pub mod anomaly;
pub mod merge;

use std::sync::Arc;

use crate::cache::{build_cache_key, ResultCache};
use crate::error::IngestError;
use crate::fetch::FetchOptions;
use crate::models::{DerivativesPayload, ExportPayload};
use crate::sources::{DerivativesAdapter, PriceLookup, SourceAdapter, SubjectIdentity, TimeRange};
use crate::store::KvStore;

pub use merge::{merge, LedgerRecord};

const SPOT_CACHE_KEY: &str = "export_cache";
const DERIVATIVES_CACHE_KEY: &str = "derivatives_export_cache";

pub struct ExportPipeline {
    spot_cache: ResultCache<ExportPayload>,
    derivatives_cache: ResultCache<DerivativesPayload>,
    price: Arc<dyn PriceLookup>,
}

impl ExportPipeline {
    pub fn new(store: Arc<dyn KvStore>, price: Arc<dyn PriceLookup>) -> Self {
        Self {
            spot_cache: ResultCache::new(store.clone(), SPOT_CACHE_KEY),
            derivatives_cache: ResultCache::new(store, DERIVATIVES_CACHE_KEY),
            price,
        }
    }

    /// Run one spot-activity request end to end.
    pub async fn run(
        &self,
        adapter: &dyn SourceAdapter,
        identity: &SubjectIdentity,
        range: &TimeRange,
        options: &FetchOptions,
    ) -> Result<ExportPayload, IngestError> {
        let key = build_cache_key(
            adapter.source_id(),
            &identity.subject_id,
            range.start,
            range.end,
        );
        if let Some(hit) = self.spot_cache.get(&key) {
            log::debug!("Cache hit for '{}'", key);
            return Ok(hit);
        }

        let batch = adapter
            .fetch_activity(identity, range, self.price.as_ref(), options)
            .await?;
        let merged = merge(vec![batch]);
        let flagged = anomaly::flag(merged);
        let payload = ExportPayload::from_transactions(flagged);

        self.spot_cache.set(&key, payload.clone());
        Ok(payload)
    }

    /// Run one derivatives request end to end.
    pub async fn run_derivatives(
        &self,
        adapter: &dyn DerivativesAdapter,
        identity: &SubjectIdentity,
        range: &TimeRange,
        options: &FetchOptions,
    ) -> Result<DerivativesPayload, IngestError> {
        let key = build_cache_key(
            adapter.source_id(),
            &identity.subject_id,
            range.start,
            range.end,
        );
        if let Some(hit) = self.derivatives_cache.get(&key) {
            log::debug!("Cache hit for '{}'", key);
            return Ok(hit);
        }

        let batch = adapter.fetch_activity(identity, range, options).await?;
        let merged = merge(vec![batch]);
        let flagged = anomaly::flag_derivatives(merged);
        let payload = DerivativesPayload::from_transactions(flagged);

        self.derivatives_cache.set(&key, payload.clone());
        Ok(payload)
    }

    /// Force the next run for this request identity to re-fetch.
    pub fn invalidate(&self, source_id: &str, identity: &SubjectIdentity, range: &TimeRange) {
        let key = build_cache_key(source_id, &identity.subject_id, range.start, range.end);
        self.spot_cache.invalidate(&key);
        self.derivatives_cache.invalidate(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CanonicalTransaction, DerivativesTransaction, PositionTag, ReviewReason, TransactionKind,
    };
    use crate::sources::NoPrices;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tx(id: &str, hour: u32) -> CanonicalTransaction {
        CanonicalTransaction::new(
            id.to_string(),
            TransactionKind::TransferReceived,
            Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            id.split('-').next().unwrap_or(id).to_string(),
            String::new(),
        )
        .with_received(1.0, "ATOM")
    }

    struct FakeAdapter {
        calls: AtomicU32,
        batch: Vec<CanonicalTransaction>,
        fail: bool,
    }

    impl FakeAdapter {
        fn returning(batch: Vec<CanonicalTransaction>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                batch,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                batch: vec![],
                fail: true,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeAdapter {
        fn source_id(&self) -> &'static str {
            "fake"
        }

        async fn fetch_activity(
            &self,
            _identity: &SubjectIdentity,
            _range: &TimeRange,
            _price: &dyn crate::sources::PriceLookup,
            _options: &FetchOptions,
        ) -> Result<Vec<CanonicalTransaction>, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(IngestError::UpstreamUnavailable {
                    status: 503,
                    body: "down".to_string(),
                });
            }
            Ok(self.batch.clone())
        }
    }

    struct FakeDerivativesAdapter {
        calls: AtomicU32,
        batch: Vec<DerivativesTransaction>,
    }

    #[async_trait]
    impl DerivativesAdapter for FakeDerivativesAdapter {
        fn source_id(&self) -> &'static str {
            "fake_derivatives"
        }

        async fn fetch_activity(
            &self,
            _identity: &SubjectIdentity,
            _range: &TimeRange,
            _options: &FetchOptions,
        ) -> Result<Vec<DerivativesTransaction>, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.batch.clone())
        }
    }

    fn pipeline() -> ExportPipeline {
        ExportPipeline::new(Arc::new(MemoryStore::new()), Arc::new(NoPrices))
    }

    #[tokio::test]
    async fn test_run_orders_dedups_and_summarizes() {
        let adapter = FakeAdapter::returning(vec![tx("b-0", 9), tx("a-0", 3), tx("b-0", 9)]);
        let payload = pipeline()
            .run(
                &adapter,
                &SubjectIdentity::new("subject"),
                &TimeRange::default(),
                &FetchOptions::default(),
            )
            .await
            .unwrap();

        let ids: Vec<&str> = payload.transactions.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a-0", "b-0"]);
        assert_eq!(payload.summary.total_entries, 2);
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let adapter = FakeAdapter::returning(vec![tx("a-0", 3)]);
        let pipeline = pipeline();
        let identity = SubjectIdentity::new("subject");
        let range = TimeRange::default();

        let first = pipeline
            .run(&adapter, &identity, &range, &FetchOptions::default())
            .await
            .unwrap();
        let second = pipeline
            .run(&adapter, &identity, &range, &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(adapter.calls(), 1, "cache hit must not re-fetch");
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let adapter = FakeAdapter::returning(vec![tx("a-0", 3)]);
        let pipeline = pipeline();
        let identity = SubjectIdentity::new("subject");
        let range = TimeRange::default();

        pipeline
            .run(&adapter, &identity, &range, &FetchOptions::default())
            .await
            .unwrap();
        pipeline.invalidate("fake", &identity, &range);
        pipeline
            .run(&adapter, &identity, &range, &FetchOptions::default())
            .await
            .unwrap();

        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_run_caches_nothing() {
        let failing = FakeAdapter::failing();
        let pipeline = pipeline();
        let identity = SubjectIdentity::new("subject");
        let range = TimeRange::default();

        let err = pipeline
            .run(&failing, &identity, &range, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestError::UpstreamUnavailable { status: 503, .. }
        ));

        // The failure was not cached as an empty result.
        pipeline
            .run(&failing, &identity, &range, &FetchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(failing.calls(), 2);
    }

    #[tokio::test]
    async fn test_distinct_subjects_do_not_share_cache_entries() {
        let adapter = FakeAdapter::returning(vec![tx("a-0", 3)]);
        let pipeline = pipeline();
        let range = TimeRange::default();

        pipeline
            .run(
                &adapter,
                &SubjectIdentity::new("alice"),
                &range,
                &FetchOptions::default(),
            )
            .await
            .unwrap();
        pipeline
            .run(
                &adapter,
                &SubjectIdentity::new("bob"),
                &range,
                &FetchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(adapter.calls(), 2);
    }

    #[tokio::test]
    async fn test_run_flags_anomalies() {
        // Zero-value entry with a fee gets flagged on the way through.
        let mut with_fee = tx("fee-0", 4);
        with_fee.received_amount = None;
        with_fee.received_currency = None;
        with_fee.fee_amount = 0.02;
        with_fee.fee_currency = Some("ATOM".to_string());

        let adapter = FakeAdapter::returning(vec![with_fee]);
        let payload = pipeline()
            .run(
                &adapter,
                &SubjectIdentity::new("subject"),
                &TimeRange::default(),
                &FetchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(payload.summary.flagged_entries, 1);
        assert!(payload.transactions[0]
            .ambiguity_reasons
            .contains(&ReviewReason::ZeroValueWithFee));
    }

    #[tokio::test]
    async fn test_derivatives_run_flags_and_caches() {
        let close = DerivativesTransaction {
            id: "0xd-0".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            asset: "ETH".to_string(),
            amount: 1.0,
            fee: 0.4,
            realized_pnl: 0.0,
            payment_token: "USDC".to_string(),
            position_tag: PositionTag::ClosePosition,
            origin_hash: "0xd".to_string(),
            notes: String::new(),
            ambiguity_flag: false,
            ambiguity_reasons: vec![],
        };
        let adapter = FakeDerivativesAdapter {
            calls: AtomicU32::new(0),
            batch: vec![close],
        };
        let pipeline = pipeline();
        let identity = SubjectIdentity::new("0xsubject");
        let range = TimeRange::default();

        let payload = pipeline
            .run_derivatives(&adapter, &identity, &range, &FetchOptions::default())
            .await
            .unwrap();
        assert!(payload.transactions[0]
            .ambiguity_reasons
            .contains(&ReviewReason::ZeroPnlOnClose));

        pipeline
            .run_derivatives(&adapter, &identity, &range, &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }
}
