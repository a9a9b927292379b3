//! Trade reconciliation engine.
//!
//! Keeps the durable fill history for a subaccount/instrument in sync with
//! venue-reported history, on a schedule, independent of the live fill stream
//! (which can drop messages during reconnects). Anomalies never halt the
//! sweep; they downgrade the subaccount's trust state so dependent
//! aggregations recompute from a known-good checkpoint instead of trusting
//! incremental sums.

use crate::config::ReconciliationConfig;
use crate::exchange::{
    AccountTrade, ApiError, FillRecord, HistoricalOrder, OrderSide, OrderStatus, VenueClient,
};
use crate::execution::{retry, RetryError};
use crate::store::{DocumentStore, Filter, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const FILLS_COLLECTION: &str = "fills";
const SUMMARIES_COLLECTION: &str = "recon_summaries";
const FETCH_ATTEMPTS: u32 = 3;
const FETCH_SETTLE: Duration = Duration::from_secs(1);

/// Errors surfaced to the reconciliation schedule.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("history fetch failed: {0}")]
    Fetch(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<RetryError<ApiError>> for ReconcileError {
    fn from(err: RetryError<ApiError>) -> Self {
        ReconcileError::Fetch(err.to_string())
    }
}

/// Read-side of the venue history API, mockable in tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderHistorySource: Send + Sync {
    async fn historical_orders(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<HistoricalOrder>, ApiError>;

    async fn account_trades(
        &self,
        symbol: &str,
        start_ms: i64,
    ) -> Result<Vec<AccountTrade>, ApiError>;
}

#[async_trait]
impl OrderHistorySource for crate::exchange::VenueClient {
    async fn historical_orders(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<HistoricalOrder>, ApiError> {
        VenueClient::historical_orders(self, symbol, start_ms, end_ms).await
    }

    async fn account_trades(
        &self,
        symbol: &str,
        start_ms: i64,
    ) -> Result<Vec<AccountTrade>, ApiError> {
        VenueClient::account_trades(self, symbol, start_ms).await
    }
}

/// Per-subaccount reconciliation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconSummary {
    pub subaccount: String,
    pub start_date: DateTime<Utc>,
    pub last_trade_added: DateTime<Utc>,
    /// Once set, dependent aggregations must recompute from the last
    /// known-good checkpoint instead of trusting cached running sums.
    pub recent_error_in_reconciliation: bool,
}

/// A fill as stored durably, stamped with the owning subaccount and a
/// monotonic insertion sequence used to target duplicates precisely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredFill {
    subaccount: String,
    seq: u64,
    #[serde(flatten)]
    fill: FillRecord,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub first_run: bool,
    pub net_new: usize,
    pub duplicates_removed: usize,
    pub summary: ReconSummary,
}

/// Engine for one (venue, subaccount, instrument) triple.
pub struct ReconcileEngine {
    source: Arc<dyn OrderHistorySource>,
    store: Arc<dyn DocumentStore>,
    config: ReconciliationConfig,
    subaccount: String,
    symbol: String,
    /// Caller-supplied commencement date seeding the first-run checkpoint.
    commencement: DateTime<Utc>,
}

impl ReconcileEngine {
    pub fn new(
        source: Arc<dyn OrderHistorySource>,
        store: Arc<dyn DocumentStore>,
        config: ReconciliationConfig,
        subaccount: impl Into<String>,
        symbol: impl Into<String>,
        commencement: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            store,
            config,
            subaccount: subaccount.into(),
            symbol: symbol.into(),
            commencement,
        }
    }

    fn summary_filter(&self) -> Filter {
        Filter::new().eq("subaccount", self.subaccount.as_str())
    }

    fn fills_filter(&self) -> Filter {
        Filter::new()
            .eq("subaccount", self.subaccount.as_str())
            .eq("symbol", self.symbol.as_str())
    }

    fn composite_filter(&self, fill: &FillRecord) -> Filter {
        Filter::new()
            .eq("subaccount", self.subaccount.as_str())
            .eq("orderId", fill.order_id)
            .eq("clientOrderId", fill.client_order_id.as_str())
            .eq("price", fill.price.to_string())
            .eq("executedQty", fill.executed_qty.to_string())
    }

    /// Load the summary, creating it on the subaccount's very first run.
    async fn load_or_seed_summary(&self) -> Result<(ReconSummary, bool), ReconcileError> {
        if let Some(doc) = self
            .store
            .find_one(SUMMARIES_COLLECTION, &self.summary_filter())
            .await?
        {
            let summary: ReconSummary = serde_json::from_value(doc).map_err(StoreError::from)?;
            return Ok((summary, false));
        }

        let summary = ReconSummary {
            subaccount: self.subaccount.clone(),
            start_date: self.commencement,
            last_trade_added: self.commencement,
            recent_error_in_reconciliation: false,
        };
        self.store
            .insert_one(
                SUMMARIES_COLLECTION,
                serde_json::to_value(&summary).map_err(StoreError::from)?,
            )
            .await?;
        info!(
            subaccount = %self.subaccount,
            start = %summary.start_date,
            "Seeded reconciliation summary from commencement date"
        );
        Ok((summary, true))
    }

    /// Page the historical-orders endpoint in bounded windows, collecting
    /// FILLED records. An empty page is "no activity in this sub-window" and
    /// the window advances by the fixed span, bounded by the present.
    async fn collect_history(
        &self,
        from: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<FillRecord>, ReconcileError> {
        let span = ChronoDuration::days(self.config.page_window_days);
        let mut window_start = from;
        let mut collected = Vec::new();

        loop {
            let window_end = window_start + span;
            let capped_end = window_end.min(now);

            let page = retry(FETCH_ATTEMPTS, FETCH_SETTLE, ApiError::is_retryable, || {
                self.source.historical_orders(
                    &self.symbol,
                    window_start.timestamp_millis(),
                    capped_end.timestamp_millis(),
                )
            })
            .await?;

            let filled = page
                .iter()
                .filter(|o| o.status.is_filled())
                .map(FillRecord::from);
            let before = collected.len();
            collected.extend(filled);

            debug!(
                subaccount = %self.subaccount,
                window_start = %window_start,
                window_end = %capped_end,
                found = collected.len() - before,
                "Reconciliation window paged"
            );

            if window_end >= now {
                break;
            }
            window_start = window_end;
        }

        Ok(collected)
    }

    /// For records observed in the last half hour, the paged history may lag;
    /// query the live-trades endpoint directly and synthesize fills for
    /// anything it has that the pages did not.
    async fn collect_recent_trades(
        &self,
        collected: &[FillRecord],
        now: DateTime<Utc>,
    ) -> Result<Vec<FillRecord>, ReconcileError> {
        let recent_cutoff =
            (now - ChronoDuration::minutes(self.config.recent_trades_mins)).timestamp_millis();

        if !collected.iter().any(|f| f.transact_time >= recent_cutoff) {
            return Ok(Vec::new());
        }

        let trades = retry(FETCH_ATTEMPTS, FETCH_SETTLE, ApiError::is_retryable, || {
            self.source.account_trades(&self.symbol, recent_cutoff)
        })
        .await?;

        let by_order: HashMap<i64, &FillRecord> =
            collected.iter().map(|f| (f.order_id, f)).collect();

        Ok(trades
            .iter()
            .map(|trade| FillRecord {
                order_id: trade.order_id,
                client_order_id: by_order
                    .get(&trade.order_id)
                    .map(|f| f.client_order_id.clone())
                    .unwrap_or_default(),
                symbol: trade.symbol.clone(),
                side: if trade.buyer { OrderSide::Buy } else { OrderSide::Sell },
                price: trade.price,
                executed_qty: trade.qty,
                status: OrderStatus::Filled,
                transact_time: trade.time,
            })
            .collect())
    }

    /// Merge fills into the store, keyed by the composite of venue order id,
    /// client order id, price, and quantity. Returns `(net_new,
    /// newest_transact_time)`.
    async fn merge(&self, fills: &[FillRecord]) -> Result<(usize, Option<i64>), ReconcileError> {
        let stored = self.store.find_all(FILLS_COLLECTION, &self.fills_filter()).await?;
        let mut next_seq = stored
            .iter()
            .filter_map(|doc| doc.get("seq").and_then(|s| s.as_u64()))
            .max()
            .map(|s| s + 1)
            .unwrap_or(0);

        let mut net_new = 0usize;
        let mut newest: Option<i64> = None;

        for fill in fills {
            if self
                .store
                .find_one(FILLS_COLLECTION, &self.composite_filter(fill))
                .await?
                .is_some()
            {
                continue;
            }

            let doc = StoredFill {
                subaccount: self.subaccount.clone(),
                seq: next_seq,
                fill: fill.clone(),
            };
            self.store
                .insert_one(
                    FILLS_COLLECTION,
                    serde_json::to_value(&doc).map_err(StoreError::from)?,
                )
                .await?;
            next_seq += 1;
            net_new += 1;
            newest = Some(newest.map_or(fill.transact_time, |t: i64| t.max(fill.transact_time)));
        }

        Ok((net_new, newest))
    }

    /// Deduplicate the stored collection.
    ///
    /// Exact duplicates share the full composite key; the later-inserted one
    /// is deleted. Near-duplicates share a client order id with transaction
    /// times inside the retry-race window and also collapse to one.
    async fn dedup_stored(&self) -> Result<usize, ReconcileError> {
        let stored = self.store.find_all(FILLS_COLLECTION, &self.fills_filter()).await?;

        let mut fills: Vec<StoredFill> = Vec::with_capacity(stored.len());
        for doc in stored {
            fills.push(serde_json::from_value(doc).map_err(StoreError::from)?);
        }

        let mut doomed: Vec<u64> = Vec::new();
        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut kept: Vec<&StoredFill> = Vec::new();

        for stored_fill in &fills {
            let fill = &stored_fill.fill;
            let key = format!(
                "{}|{}|{}|{}",
                fill.order_id, fill.client_order_id, fill.price, fill.executed_qty
            );

            if !seen_keys.insert(key) {
                // Exact duplicate: keep the earlier-inserted record.
                doomed.push(stored_fill.seq);
                continue;
            }

            let near_duplicate = !fill.client_order_id.is_empty()
                && kept.iter().any(|k| {
                    k.fill.client_order_id == fill.client_order_id
                        && (k.fill.transact_time - fill.transact_time).abs()
                            <= self.config.near_duplicate_ms
                });
            if near_duplicate {
                doomed.push(stored_fill.seq);
                continue;
            }

            kept.push(stored_fill);
        }

        for seq in &doomed {
            let filter = self.fills_filter().eq("seq", *seq);
            self.store.delete_one(FILLS_COLLECTION, &filter).await?;
            warn!(
                subaccount = %self.subaccount,
                seq,
                "Removed duplicate fill record"
            );
        }

        Ok(doomed.len())
    }

    /// Run one reconciliation pass.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport, ReconcileError> {
        let (mut summary, first_run) = self.load_or_seed_summary().await?;

        let from = summary.last_trade_added.max(self.commencement);
        let mut fills = self.collect_history(from, now).await?;
        let recent = self.collect_recent_trades(&fills, now).await?;
        fills.extend(recent);

        let (net_new, newest) = self.merge(&fills).await?;
        let duplicates_removed = self.dedup_stored().await?;

        if let Some(newest_ms) = newest {
            if let Some(ts) = DateTime::from_timestamp_millis(newest_ms) {
                summary.last_trade_added = summary.last_trade_added.max(ts);
            }
        }

        // Conservative trust downgrade: any change on a pass that is not the
        // very first run means cached running totals can no longer be trusted.
        if !first_run && (duplicates_removed > 0 || net_new > 0) {
            summary.recent_error_in_reconciliation = true;
        }

        self.store
            .replace_one(
                SUMMARIES_COLLECTION,
                &self.summary_filter(),
                serde_json::to_value(&summary).map_err(StoreError::from)?,
            )
            .await?;

        info!(
            subaccount = %self.subaccount,
            symbol = %self.symbol,
            net_new,
            duplicates_removed,
            error_flag = summary.recent_error_in_reconciliation,
            "Reconciliation pass complete"
        );

        Ok(ReconcileReport {
            first_run,
            net_new,
            duplicates_removed,
            summary,
        })
    }

    /// Clear the trust-downgrade flag after a dependent aggregation has
    /// recomputed from its checkpoint.
    pub async fn clear_error_flag(&self) -> Result<(), ReconcileError> {
        if let Some(doc) = self
            .store
            .find_one(SUMMARIES_COLLECTION, &self.summary_filter())
            .await?
        {
            let mut summary: ReconSummary = serde_json::from_value(doc).map_err(StoreError::from)?;
            summary.recent_error_in_reconciliation = false;
            self.store
                .replace_one(
                    SUMMARIES_COLLECTION,
                    &self.summary_filter(),
                    serde_json::to_value(&summary).map_err(StoreError::from)?,
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn order(
        order_id: i64,
        client_order_id: &str,
        price: Decimal,
        qty: Decimal,
        transact_time: i64,
    ) -> HistoricalOrder {
        HistoricalOrder {
            order_id,
            client_order_id: client_order_id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            status: OrderStatus::Filled,
            price,
            avg_price: None,
            executed_qty: qty,
            update_time: transact_time,
        }
    }

    fn engine(
        source: MockOrderHistorySource,
        store: Arc<MemoryStore>,
        commencement: DateTime<Utc>,
    ) -> ReconcileEngine {
        ReconcileEngine::new(
            Arc::new(source),
            store,
            ReconciliationConfig::default(),
            "alpha",
            "BTCUSDT",
            commencement,
        )
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    #[tokio::test]
    async fn test_first_run_seeds_checkpoint_without_error_flag() {
        let now = now();
        let commencement = now - ChronoDuration::hours(6);
        let fill_time = (now - ChronoDuration::hours(2)).timestamp_millis();

        let mut source = MockOrderHistorySource::new();
        source
            .expect_historical_orders()
            .returning(move |_, _, _| Ok(vec![order(1, "v1:0", dec!(100), dec!(1), fill_time)]));

        let store = Arc::new(MemoryStore::new());
        let engine = engine(source, Arc::clone(&store), commencement);
        let report = engine.run_once(now).await.unwrap();

        assert!(report.first_run);
        assert_eq!(report.net_new, 1);
        assert_eq!(report.duplicates_removed, 0);
        assert!(!report.summary.recent_error_in_reconciliation);
        assert_eq!(
            report.summary.last_trade_added.timestamp_millis(),
            fill_time
        );
        assert_eq!(report.summary.start_date, commencement);
    }

    #[tokio::test]
    async fn test_net_new_on_later_run_downgrades_trust() {
        let now = now();
        let commencement = now - ChronoDuration::hours(6);
        let fill_time = (now - ChronoDuration::hours(2)).timestamp_millis();

        let mut source = MockOrderHistorySource::new();
        source
            .expect_historical_orders()
            .returning(move |_, _, _| Ok(vec![order(2, "v1:1", dec!(101), dec!(1), fill_time)]));

        let store = Arc::new(MemoryStore::new());
        // An existing summary means this is not the first run.
        let existing = ReconSummary {
            subaccount: "alpha".to_string(),
            start_date: commencement,
            last_trade_added: commencement,
            recent_error_in_reconciliation: false,
        };
        store
            .insert_one(SUMMARIES_COLLECTION, serde_json::to_value(&existing).unwrap())
            .await
            .unwrap();

        let engine = engine(source, Arc::clone(&store), commencement);
        let report = engine.run_once(now).await.unwrap();

        assert!(!report.first_run);
        assert_eq!(report.net_new, 1);
        assert!(report.summary.recent_error_in_reconciliation);
    }

    #[tokio::test]
    async fn test_identical_composite_records_merge_once() {
        let now = now();
        let commencement = now - ChronoDuration::hours(6);
        let fill_time = (now - ChronoDuration::hours(2)).timestamp_millis();

        // The partial-fill record and the final aggregate share the composite
        // key; the second representation must not re-insert.
        let mut source = MockOrderHistorySource::new();
        source.expect_historical_orders().returning(move |_, _, _| {
            Ok(vec![
                order(3, "v1:2", dec!(100), dec!(2), fill_time),
                order(3, "v1:2", dec!(100), dec!(2), fill_time),
            ])
        });

        let store = Arc::new(MemoryStore::new());
        let engine = engine(source, Arc::clone(&store), commencement);
        let report = engine.run_once(now).await.unwrap();

        assert_eq!(report.net_new, 1);
        let stored = store
            .find_all(FILLS_COLLECTION, &Filter::new().eq("subaccount", "alpha"))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_exact_stored_duplicates_delete_later_inserted() {
        let now = now();
        let commencement = now - ChronoDuration::hours(6);

        let mut source = MockOrderHistorySource::new();
        source
            .expect_historical_orders()
            .returning(|_, _, _| Ok(vec![]));

        let store = Arc::new(MemoryStore::new());
        // Two stored records with identical composite keys, distinct seqs.
        for seq in [0u64, 1u64] {
            let doc = StoredFill {
                subaccount: "alpha".to_string(),
                seq,
                fill: FillRecord {
                    order_id: 4,
                    client_order_id: "v1:3".to_string(),
                    symbol: "BTCUSDT".to_string(),
                    side: OrderSide::Buy,
                    price: dec!(100),
                    executed_qty: dec!(1),
                    status: OrderStatus::Filled,
                    transact_time: 1_699_999_000_000,
                },
            };
            store
                .insert_one(FILLS_COLLECTION, serde_json::to_value(&doc).unwrap())
                .await
                .unwrap();
        }

        let engine = engine(source, Arc::clone(&store), commencement);
        let report = engine.run_once(now).await.unwrap();

        assert_eq!(report.duplicates_removed, 1);
        let stored = store
            .find_all(FILLS_COLLECTION, &Filter::new().eq("subaccount", "alpha"))
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["seq"], 0);
        // Duplicates on a non-first run downgrade trust.
        assert!(report.summary.recent_error_in_reconciliation);
    }

    #[tokio::test]
    async fn test_near_duplicates_inside_retry_window_collapse() {
        let now = now();
        let commencement = now - ChronoDuration::hours(6);
        let base = 1_699_999_000_000i64;

        let mut source = MockOrderHistorySource::new();
        source.expect_historical_orders().returning(move |_, _, _| {
            Ok(vec![
                // Same client order id, 4s apart, different venue order ids:
                // a retry race producing two representations.
                order(5, "v1:4", dec!(100), dec!(1), base),
                order(6, "v1:4", dec!(100.5), dec!(1), base + 4_000),
                // Same client order id but 8s apart: distinct fills, kept.
                order(7, "v1:5", dec!(101), dec!(1), base),
                order(8, "v1:5", dec!(101.5), dec!(1), base + 8_000),
            ])
        });

        let store = Arc::new(MemoryStore::new());
        let engine = engine(source, Arc::clone(&store), commencement);
        let report = engine.run_once(now).await.unwrap();

        assert_eq!(report.duplicates_removed, 1);
        let stored = store
            .find_all(FILLS_COLLECTION, &Filter::new().eq("subaccount", "alpha"))
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
    }

    #[tokio::test]
    async fn test_recent_records_trigger_live_trades_check() {
        let now = now();
        let commencement = now - ChronoDuration::hours(6);
        let recent_time = (now - ChronoDuration::minutes(10)).timestamp_millis();

        let mut source = MockOrderHistorySource::new();
        source
            .expect_historical_orders()
            .returning(move |_, _, _| Ok(vec![order(9, "v1:6", dec!(100), dec!(1), recent_time)]));
        // The live endpoint has an extra trade the pages have not indexed.
        source.expect_account_trades().times(1).returning(move |_, _| {
            Ok(vec![AccountTrade {
                id: 1000,
                order_id: 10,
                symbol: "BTCUSDT".to_string(),
                price: dec!(100.2),
                qty: dec!(0.5),
                buyer: false,
                time: recent_time + 60_000,
            }])
        });

        let store = Arc::new(MemoryStore::new());
        let engine = engine(source, Arc::clone(&store), commencement);
        let report = engine.run_once(now).await.unwrap();

        assert_eq!(report.net_new, 2);
    }

    #[tokio::test]
    async fn test_stale_history_skips_live_trades_check() {
        let now = now();
        let commencement = now - ChronoDuration::hours(6);
        let old_time = (now - ChronoDuration::hours(3)).timestamp_millis();

        let mut source = MockOrderHistorySource::new();
        source
            .expect_historical_orders()
            .returning(move |_, _, _| Ok(vec![order(11, "v1:7", dec!(100), dec!(1), old_time)]));
        source.expect_account_trades().times(0);

        let store = Arc::new(MemoryStore::new());
        let engine = engine(source, Arc::clone(&store), commencement);
        engine.run_once(now).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_windows_advance_to_the_present() {
        let now = now();
        // A month of silence: the engine must page forward through empty
        // windows rather than stopping at the first one.
        let commencement = now - ChronoDuration::days(30);

        let mut source = MockOrderHistorySource::new();
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = std::sync::Arc::clone(&calls);
        source.expect_historical_orders().returning(move |_, _, _| {
            calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(vec![])
        });

        let store = Arc::new(MemoryStore::new());
        let engine = engine(source, Arc::clone(&store), commencement);
        let report = engine.run_once(now).await.unwrap();

        assert_eq!(report.net_new, 0);
        // 30 days at a 7-day span: five windows to reach the present.
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 5);
    }
}
