//! The reconciliation state machine.
//!
//! SYNCING runs fetch, map and upsert passes. Any error in a pass clears the index
//! and moves to RECOVERING, which rebuilds the index from the knowledge base before
//! syncing resumes. Nothing is resumed from the entry that failed.

use std::error::Error as _;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gumsync_core::{map_product, Entry, Index};
use gumsync_remote::{ApiError, ErrorClass, KnowledgeBase, Storefront};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub database_query: String,
    /// Pause after every row write, to stay under the knowledge-base rate limit.
    pub upsert_delay: Duration,
    /// Pause after a completed cycle, and after a failed recovery attempt.
    pub cycle_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Syncing,
    Recovering,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Synced(CycleSummary),
    CycleFailed(ErrorClass),
    Recovered { rows: usize },
    RecoveryFailed(ErrorClass),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub database_id: String,
    pub index: Index,
}

/// Locate the target database and load every row into a fresh index.
pub async fn bootstrap<K>(kb: &K, database_query: &str) -> Result<Bootstrap, ApiError>
where
    K: KnowledgeBase + ?Sized,
{
    let database_id = kb.find_database(database_query).await?;
    let rows = kb.query_rows(&database_id).await?;

    let mut index = Index::new();
    for row in rows {
        if let Some(displaced) = index.insert(row) {
            warn!(
                external_id = %displaced.external_id,
                row_id = displaced.internal_row_id.as_deref().unwrap_or("-"),
                "duplicate rows for one product; keeping the later row"
            );
        }
    }

    Ok(Bootstrap { database_id, index })
}

/// Create the row when the entry has never been written, otherwise update it in place.
pub async fn upsert_entry<K>(
    kb: &K,
    database_id: &str,
    entry: &Entry,
) -> Result<(String, UpsertAction), ApiError>
where
    K: KnowledgeBase + ?Sized,
{
    match entry.internal_row_id.as_deref() {
        None => Ok((kb.create_row(database_id, entry).await?, UpsertAction::Created)),
        Some(row_id) => Ok((kb.update_row(row_id, entry).await?, UpsertAction::Updated)),
    }
}

fn error_chain(err: &ApiError) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

pub struct ReconciliationLoop<K, S> {
    kb: K,
    storefront: S,
    config: LoopConfig,
    database_id: String,
    index: Index,
    state: LoopState,
}

impl<K, S> ReconciliationLoop<K, S>
where
    K: KnowledgeBase,
    S: Storefront,
{
    /// Bootstrap outside the recovery boundary: any error here is a startup failure.
    pub async fn start(kb: K, storefront: S, config: LoopConfig) -> Result<Self, ApiError> {
        let Bootstrap { database_id, index } = bootstrap(&kb, &config.database_query).await?;
        Ok(Self {
            kb,
            storefront,
            config,
            database_id,
            index,
            state: LoopState::Syncing,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// One fetch, map and upsert pass. Stops at the first error.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary, ApiError> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("reconcile_cycle", %cycle_id);
        async move {
            let started_at = Utc::now();
            let products = self.storefront.list_products().await?;
            for product in &products {
                let entry = map_product(product, &self.index);
                self.index.apply_mapped(entry);
            }

            let mut created = 0usize;
            let mut updated = 0usize;
            for external_id in self.index.external_ids() {
                let Some(entry) = self.index.get(&external_id).cloned() else {
                    continue;
                };
                let (row_id, action) = upsert_entry(&self.kb, &self.database_id, &entry).await?;
                let recorded = self.index.record_row_id(&external_id, row_id);
                debug_assert!(recorded, "upserted {external_id} is missing from the index");
                match action {
                    UpsertAction::Created => created += 1,
                    UpsertAction::Updated => updated += 1,
                }
                tokio::time::sleep(self.config.upsert_delay).await;
            }

            Ok::<_, ApiError>(CycleSummary {
                cycle_id,
                started_at,
                finished_at: Utc::now(),
                fetched: products.len(),
                created,
                updated,
            })
        }
        .instrument(span)
        .await
    }

    async fn recover(&mut self) -> Result<usize, ApiError> {
        let Bootstrap { database_id, index } =
            bootstrap(&self.kb, &self.config.database_query).await?;
        let rows = index.len();
        self.database_id = database_id;
        self.index = index;
        Ok(rows)
    }

    /// Advance the state machine by one transition.
    ///
    /// Returns `Err` only for fatal errors; everything else is absorbed and reported
    /// through the outcome.
    pub async fn step(&mut self) -> Result<StepOutcome, ApiError> {
        match self.state {
            LoopState::Syncing => match self.run_cycle().await {
                Ok(summary) => {
                    info!(
                        cycle_id = %summary.cycle_id,
                        fetched = summary.fetched,
                        created = summary.created,
                        updated = summary.updated,
                        "reconciliation cycle complete"
                    );
                    tokio::time::sleep(self.config.cycle_delay).await;
                    Ok(StepOutcome::Synced(summary))
                }
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    error!(
                        class = %err.class(),
                        error = %error_chain(&err),
                        "reconciliation cycle failed; rebuilding index from knowledge base"
                    );
                    self.index.clear();
                    self.state = LoopState::Recovering;
                    Ok(StepOutcome::CycleFailed(err.class()))
                }
            },
            LoopState::Recovering => match self.recover().await {
                Ok(rows) => {
                    info!(database_id = %self.database_id, rows, "index rebuilt");
                    self.state = LoopState::Syncing;
                    Ok(StepOutcome::Recovered { rows })
                }
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    error!(
                        class = %err.class(),
                        error = %error_chain(&err),
                        "index rebuild failed; retrying"
                    );
                    self.index.clear();
                    tokio::time::sleep(self.config.cycle_delay).await;
                    Ok(StepOutcome::RecoveryFailed(err.class()))
                }
            },
        }
    }

    /// Step forever. Returns only when a fatal error occurs.
    pub async fn run_forever(mut self) -> Result<(), ApiError> {
        loop {
            self.step().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use gumsync_core::{Decimal, StorefrontProduct, FALLBACK_COVER_URL};
    use tokio::time::Instant;

    use super::*;

    #[derive(Default)]
    struct KbState {
        search_hits: usize,
        rows: BTreeMap<String, Entry>,
        next_row: usize,
        searches: usize,
        queries: usize,
        writes: usize,
        fail_on_write: Option<usize>,
        fail_next_query: bool,
        created: Vec<String>,
        updated: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakeKb(Arc<Mutex<KbState>>);

    impl FakeKb {
        fn with_rows(rows: Vec<Entry>) -> Self {
            let kb = FakeKb::default();
            {
                let mut state = kb.lock();
                state.search_hits = 1;
                for row in rows {
                    let row_id = row.internal_row_id.clone().expect("seeded rows have ids");
                    state.rows.insert(row_id, row);
                }
            }
            kb
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, KbState> {
            self.0.lock().expect("kb lock")
        }

        fn write(&self) -> Result<(), ApiError> {
            let mut state = self.lock();
            state.writes += 1;
            if state.fail_on_write == Some(state.writes) {
                state.fail_on_write = None;
                return Err(ApiError::HttpStatus {
                    status: 429,
                    url: "fake://pages".into(),
                    body: "rate limited".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KnowledgeBase for FakeKb {
        async fn find_database(&self, query: &str) -> Result<String, ApiError> {
            let mut state = self.lock();
            state.searches += 1;
            match state.search_hits {
                1 => Ok("db-1".into()),
                found => Err(ApiError::DatabaseDiscovery {
                    query: query.into(),
                    found,
                }),
            }
        }

        async fn query_rows(&self, database_id: &str) -> Result<Vec<Entry>, ApiError> {
            assert_eq!(database_id, "db-1");
            let mut state = self.lock();
            state.queries += 1;
            if std::mem::take(&mut state.fail_next_query) {
                return Err(ApiError::Malformed("truncated body".into()));
            }
            Ok(state.rows.values().cloned().collect())
        }

        async fn create_row(&self, database_id: &str, entry: &Entry) -> Result<String, ApiError> {
            assert_eq!(database_id, "db-1");
            self.write()?;
            let mut state = self.lock();
            state.next_row += 1;
            let row_id = format!("row-{}", state.next_row);
            let mut stored = entry.clone();
            stored.internal_row_id = Some(row_id.clone());
            state.rows.insert(row_id.clone(), stored);
            state.created.push(entry.external_id.clone());
            Ok(row_id)
        }

        async fn update_row(&self, row_id: &str, entry: &Entry) -> Result<String, ApiError> {
            self.write()?;
            let mut state = self.lock();
            let mut stored = entry.clone();
            stored.internal_row_id = Some(row_id.to_string());
            state.rows.insert(row_id.to_string(), stored);
            state.updated.push(row_id.to_string());
            Ok(row_id.to_string())
        }
    }

    #[derive(Clone, Default)]
    struct FakeStore {
        products: Arc<Mutex<Vec<StorefrontProduct>>>,
        fail: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl Storefront for FakeStore {
        async fn list_products(&self) -> Result<Vec<StorefrontProduct>, ApiError> {
            if *self.fail.lock().expect("fail lock") {
                return Err(ApiError::HttpStatus {
                    status: 502,
                    url: "fake://products".into(),
                    body: String::new(),
                });
            }
            Ok(self.products.lock().expect("products lock").clone())
        }
    }

    fn product(id: &str, price: i64, sales_count: u64) -> StorefrontProduct {
        StorefrontProduct {
            id: id.into(),
            name: format!("Product {id}"),
            price,
            sales_count,
            sales_usd_cents: price * sales_count as i64,
            short_url: format!("https://x/{id}"),
            preview_url: None,
        }
    }

    fn store(products: Vec<StorefrontProduct>) -> FakeStore {
        let store = FakeStore::default();
        *store.products.lock().expect("products lock") = products;
        store
    }

    fn config() -> LoopConfig {
        LoopConfig {
            database_query: "Store".into(),
            upsert_delay: Duration::ZERO,
            cycle_delay: Duration::ZERO,
        }
    }

    fn synced(outcome: StepOutcome) -> CycleSummary {
        match outcome {
            StepOutcome::Synced(summary) => summary,
            other => panic!("expected a synced cycle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn new_product_is_created_then_updated() {
        let kb = FakeKb::with_rows(vec![]);
        let widget = StorefrontProduct {
            id: "abc".into(),
            name: "Widget".into(),
            price: 1999,
            sales_count: 3,
            sales_usd_cents: 5997,
            short_url: "https://x/abc".into(),
            preview_url: Some(String::new()),
        };
        let mut sync = ReconciliationLoop::start(kb.clone(), store(vec![widget]), config())
            .await
            .expect("start");
        assert!(sync.index().is_empty());

        let first = synced(sync.step().await.expect("step"));
        assert_eq!((first.fetched, first.created, first.updated), (1, 1, 0));
        let entry = sync.index().get("abc").expect("indexed");
        assert_eq!(entry.internal_row_id.as_deref(), Some("row-1"));
        assert_eq!(entry.price, Decimal::new(1999, 2));
        assert_eq!(entry.revenue, Decimal::new(5997, 2));
        assert_eq!(entry.cover_image_url, FALLBACK_COVER_URL);

        let second = synced(sync.step().await.expect("step"));
        assert_eq!((second.created, second.updated), (0, 1));
        let state = kb.lock();
        assert_eq!(state.created, ["abc"]);
        assert_eq!(state.updated, ["row-1"]);
    }

    #[tokio::test]
    async fn bootstrapped_rows_are_updated_not_recreated() {
        let existing = Entry {
            external_id: "abc".into(),
            internal_row_id: Some("row-42".into()),
            name: "Widget (old)".into(),
            price: Decimal::TEN,
            sales_count: 1,
            revenue: Decimal::TEN,
            link: "https://x/abc".into(),
            cover_image_url: FALLBACK_COVER_URL.into(),
        };
        let kb = FakeKb::with_rows(vec![existing]);
        let mut sync = ReconciliationLoop::start(kb.clone(), store(vec![product("abc", 1999, 4)]), config())
            .await
            .expect("start");
        assert_eq!(sync.index().row_id("abc"), Some("row-42"));

        let summary = synced(sync.step().await.expect("step"));
        assert_eq!((summary.created, summary.updated), (0, 1));

        let state = kb.lock();
        assert!(state.created.is_empty());
        assert_eq!(state.updated, ["row-42"]);
        assert_eq!(state.rows["row-42"].sales_count, 4);
        assert_eq!(state.rows["row-42"].name, "Product abc");
        assert_eq!(state.rows["row-42"].price, Decimal::new(1999, 2));
        assert_eq!(state.rows["row-42"].revenue, Decimal::new(7996, 2));
    }

    #[tokio::test]
    async fn failure_mid_cycle_clears_index_and_rebuilds_instead_of_resuming() {
        let kb = FakeKb::with_rows(vec![]);
        let products = (0..10).map(|i| product(&format!("p{i}"), 100, i)).collect();
        let mut sync = ReconciliationLoop::start(kb.clone(), store(products), config())
            .await
            .expect("start");
        kb.lock().fail_on_write = Some(3);

        let outcome = sync.step().await.expect("step");
        assert_eq!(outcome, StepOutcome::CycleFailed(ErrorClass::Transient));
        assert!(sync.index().is_empty());
        assert_eq!(sync.state(), LoopState::Recovering);
        assert_eq!(kb.lock().writes, 3);

        let outcome = sync.step().await.expect("step");
        assert_eq!(outcome, StepOutcome::Recovered { rows: 2 });
        assert_eq!(sync.state(), LoopState::Syncing);
        {
            let state = kb.lock();
            assert_eq!(state.writes, 3, "recovery must not write");
            assert_eq!(state.queries, 2);
            assert_eq!(state.searches, 2);
        }
        assert_eq!(sync.index().len(), 2);

        let summary = synced(sync.step().await.expect("step"));
        assert_eq!((summary.created, summary.updated), (8, 2));
        assert_eq!(kb.lock().rows.len(), 10);
        assert!(sync.index().iter().all(|e| e.internal_row_id.is_some()));
    }

    #[tokio::test]
    async fn fetch_failure_writes_nothing_and_recovers() {
        let kb = FakeKb::with_rows(vec![]);
        let store = store(vec![product("abc", 100, 1)]);
        let mut sync = ReconciliationLoop::start(kb.clone(), store.clone(), config())
            .await
            .expect("start");
        *store.fail.lock().expect("fail lock") = true;

        assert_eq!(
            sync.step().await.expect("step"),
            StepOutcome::CycleFailed(ErrorClass::Transient)
        );
        assert_eq!(kb.lock().writes, 0);

        *store.fail.lock().expect("fail lock") = false;
        assert_eq!(sync.step().await.expect("step"), StepOutcome::Recovered { rows: 0 });
        synced(sync.step().await.expect("step"));
        assert_eq!(kb.lock().created, ["abc"]);
    }

    #[tokio::test]
    async fn failed_rebuild_stays_recovering_until_it_succeeds() {
        let kb = FakeKb::with_rows(vec![]);
        let mut sync = ReconciliationLoop::start(kb.clone(), store(vec![product("a", 1, 1)]), config())
            .await
            .expect("start");
        kb.lock().fail_on_write = Some(1);
        sync.step().await.expect("step");

        kb.lock().fail_next_query = true;
        assert_eq!(
            sync.step().await.expect("step"),
            StepOutcome::RecoveryFailed(ErrorClass::Malformed)
        );
        assert_eq!(sync.state(), LoopState::Recovering);

        assert_eq!(sync.step().await.expect("step"), StepOutcome::Recovered { rows: 0 });
        assert_eq!(sync.state(), LoopState::Syncing);
    }

    #[tokio::test(start_paused = true)]
    async fn delays_follow_each_upsert_and_each_cycle_outcome() {
        let upsert_delay = Duration::from_secs(5);
        let cycle_delay = Duration::from_secs(10);
        let config = LoopConfig {
            database_query: "Store".into(),
            upsert_delay,
            cycle_delay,
        };
        let kb = FakeKb::with_rows(vec![]);
        let products = vec![product("a", 100, 1), product("b", 200, 2), product("c", 300, 3)];
        let mut sync = ReconciliationLoop::start(kb.clone(), store(products), config)
            .await
            .expect("start");

        let before = Instant::now();
        synced(sync.step().await.expect("step"));
        assert_eq!(before.elapsed(), upsert_delay * 3 + cycle_delay);

        // Second write of the next cycle fails: one upsert delay, no cycle delay.
        kb.lock().fail_on_write = Some(5);
        let before = Instant::now();
        assert_eq!(
            sync.step().await.expect("step"),
            StepOutcome::CycleFailed(ErrorClass::Transient)
        );
        assert_eq!(before.elapsed(), upsert_delay);

        kb.lock().fail_next_query = true;
        let before = Instant::now();
        assert_eq!(
            sync.step().await.expect("step"),
            StepOutcome::RecoveryFailed(ErrorClass::Malformed)
        );
        assert_eq!(before.elapsed(), cycle_delay);

        let before = Instant::now();
        assert_eq!(sync.step().await.expect("step"), StepOutcome::Recovered { rows: 3 });
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn discovery_errors_are_fatal_at_startup_and_during_recovery() {
        let kb = FakeKb::default();
        let err = ReconciliationLoop::start(kb, store(vec![]), config())
            .await
            .err()
            .expect("no database");
        assert!(matches!(err, ApiError::DatabaseDiscovery { found: 0, .. }));

        let kb = FakeKb::with_rows(vec![]);
        let mut sync = ReconciliationLoop::start(kb.clone(), store(vec![product("a", 1, 1)]), config())
            .await
            .expect("start");
        kb.lock().fail_on_write = Some(1);
        sync.step().await.expect("step");

        kb.lock().search_hits = 2;
        let err = sync.step().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn duplicate_rows_keep_one_entry_per_product() {
        let row = |row_id: &str| Entry {
            external_id: "abc".into(),
            internal_row_id: Some(row_id.into()),
            name: "Widget".into(),
            price: Decimal::ONE,
            sales_count: 0,
            revenue: Decimal::ZERO,
            link: "https://x/abc".into(),
            cover_image_url: FALLBACK_COVER_URL.into(),
        };
        let kb = FakeKb::with_rows(vec![row("row-1"), row("row-2")]);
        let boot = bootstrap(&kb, "Store").await.expect("bootstrap");
        assert_eq!(boot.database_id, "db-1");
        assert_eq!(boot.index.len(), 1);
        assert_eq!(boot.index.row_id("abc"), Some("row-2"));
    }
}
