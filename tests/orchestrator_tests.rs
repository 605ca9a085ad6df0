//! Integration tests for paginated loading and prefetch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use feed_prefetch::cache::key::{FeedQuery, SortOrder};
use feed_prefetch::fetch::error::{ErrorKind, FetchError};
use feed_prefetch::fetch::orchestrator::{
    FeedOrchestrator, FetchStatus, NextPageOutcome, OrchestratorOptions, SkipReason,
};
use feed_prefetch::fetch::page::{Cursor, Page, PageFetcher};
use feed_prefetch::mode::ModePolicy;

/// Numbered catalog with per-cursor latency and injectable failures.
struct Catalog {
    total: u32,
    calls: AtomicU32,
    delays: HashMap<u32, Duration>,
    failures: Mutex<HashMap<u32, FetchError>>,
}

impl Catalog {
    fn new(total: u32) -> Self {
        Self {
            total,
            calls: AtomicU32::new(0),
            delays: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn with_delay(mut self, page: u32, delay: Duration) -> Self {
        self.delays.insert(page, delay);
        self
    }

    fn fail(&self, page: u32, error: FetchError) {
        self.failures.lock().insert(page, error);
    }

    fn recover(&self, page: u32) {
        self.failures.lock().remove(&page);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher<u32> for Catalog {
    async fn fetch_page(
        &self,
        cursor: Option<Cursor>,
        page_size: u32,
    ) -> Result<Page<u32>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = cursor.map(|c| c.0).unwrap_or(0);

        if let Some(delay) = self.delays.get(&index) {
            tokio::time::sleep(*delay).await;
        }
        let failure = self.failures.lock().get(&index).cloned();
        if let Some(error) = failure {
            return Err(error);
        }

        let start = index * page_size;
        let end = (start + page_size).min(self.total);
        let next = (end < self.total).then_some(Cursor(index + 1));
        Ok(Page::new((start..end).collect(), next))
    }
}

fn policy() -> ModePolicy {
    ModePolicy::new(Duration::from_secs(600), Duration::from_secs(120))
}

fn orchestrator(catalog: &Arc<Catalog>, options: OrchestratorOptions) -> FeedOrchestrator<u32> {
    FeedOrchestrator::with_fetcher(catalog.clone(), policy(), options)
}

fn movies(page_size: u32) -> FeedQuery {
    FeedQuery::new("movies", "release_date", SortOrder::Desc, page_size)
}

#[tokio::test(start_paused = true)]
async fn test_load_until_exhausted() {
    let catalog = Arc::new(Catalog::new(35));
    let orch = orchestrator(&catalog, OrchestratorOptions::default());
    let query = movies(20);
    let key = query.cache_key();

    let first = orch.load_first_page(&query).await;
    assert_eq!(first.status, FetchStatus::Ready);
    assert_eq!(first.item_count(), 20);
    assert_eq!(first.next_cursor, Some(Cursor(1)));

    assert_eq!(orch.load_next_page(&key).await, NextPageOutcome::Appended { items: 15 });
    let state = orch.snapshot(&key).unwrap();
    assert_eq!(state.item_count(), 35);
    assert_eq!(state.next_cursor, None);
    assert!(!state.has_more());

    assert_eq!(orch.load_next_page(&key).await, NextPageOutcome::Exhausted);
    assert_eq!(orch.snapshot(&key).unwrap().status, FetchStatus::Ready);
    assert_eq!(
        orch.prefetch_bulk(&key, 3).await.skipped,
        Some(SkipReason::Exhausted)
    );
    assert_eq!(catalog.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_loads_share_one_fetch() {
    let catalog = Arc::new(Catalog::new(100).with_delay(0, Duration::from_millis(200)));
    let orch = orchestrator(&catalog, OrchestratorOptions::default());
    let query = movies(20);

    let (a, b) = tokio::join!(orch.load_first_page(&query), orch.load_first_page(&query));

    assert_eq!(catalog.calls(), 1);
    assert_eq!(a.item_count(), 20);
    assert_eq!(b.item_count(), 20);
    assert_eq!(b.status, FetchStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_next_page_is_single_flight() {
    let catalog = Arc::new(Catalog::new(100).with_delay(1, Duration::from_millis(200)));
    let orch = orchestrator(&catalog, OrchestratorOptions::default());
    let query = movies(20);
    let key = query.cache_key();
    orch.load_first_page(&query).await;

    let (a, b) = tokio::join!(orch.load_next_page(&key), orch.load_next_page(&key));

    assert_eq!(a, NextPageOutcome::Appended { items: 20 });
    assert_eq!(b, NextPageOutcome::InFlight);
    assert_eq!(catalog.calls(), 2);
    assert_eq!(orch.snapshot(&key).unwrap().pages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_bulk_prefetch_splices_in_cursor_order() {
    // Pages complete in the order 3, 1, 2.
    let catalog = Arc::new(
        Catalog::new(200)
            .with_delay(1, Duration::from_millis(300))
            .with_delay(2, Duration::from_millis(400))
            .with_delay(3, Duration::from_millis(200)),
    );
    let options = OrchestratorOptions {
        concurrency_cap: 3,
        ..Default::default()
    };
    let orch = orchestrator(&catalog, options);
    let query = movies(10);
    let key = query.cache_key();
    orch.load_first_page(&query).await;

    let report = orch.prefetch_bulk(&key, 5).await;
    assert_eq!(report.fetched, 3);
    assert_eq!(report.spliced, 3);
    assert_eq!(report.failed, 0);

    let state = orch.snapshot(&key).unwrap();
    let firsts: Vec<u32> = state.pages.iter().map(|p| p.items[0]).collect();
    assert_eq!(firsts, vec![0, 10, 20, 30]);
    assert!(state.items().copied().eq(0..40));
    assert_eq!(state.next_cursor, Some(Cursor(4)));
    assert_eq!(orch.cached_page_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_bulk_prefetch_holds_pages_after_gap() {
    let catalog = Arc::new(Catalog::new(200));
    catalog.fail(2, FetchError::from_status(404, "gone"));
    let options = OrchestratorOptions {
        concurrency_cap: 3,
        ..Default::default()
    };
    let orch = orchestrator(&catalog, options);
    let query = movies(10);
    let key = query.cache_key();
    orch.load_first_page(&query).await;

    let report = orch.prefetch_bulk(&key, 3).await;
    assert_eq!(report.spliced, 1);
    assert_eq!(report.failed, 1);

    // The feed stops before the gap; page 3 waits in the cache.
    let state = orch.snapshot(&key).unwrap();
    assert_eq!(state.status, FetchStatus::Ready);
    assert_eq!(state.next_cursor, Some(Cursor(2)));
    assert!(orch.is_page_cached(&key, Cursor(3)));

    catalog.recover(2);
    let calls = catalog.calls();
    assert_eq!(orch.load_next_page(&key).await, NextPageOutcome::Appended { items: 10 });
    assert_eq!(orch.load_next_page(&key).await, NextPageOutcome::Appended { items: 10 });
    assert_eq!(catalog.calls(), calls + 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_load_more_keeps_pages_and_retries() {
    let catalog = Arc::new(Catalog::new(100));
    let orch = orchestrator(&catalog, OrchestratorOptions::default());
    let query = movies(20);
    let key = query.cache_key();
    orch.load_first_page(&query).await;

    catalog.fail(1, FetchError::Network("connection reset".into()));
    let outcome = orch.load_next_page(&key).await;
    let NextPageOutcome::Failed(info) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(info.kind, ErrorKind::Transient);
    // One call plus six retries of the infinite-scroll policy.
    assert_eq!(info.attempts, 7);

    let state = orch.snapshot(&key).unwrap();
    assert!(matches!(state.status, FetchStatus::Error(_)));
    assert_eq!(state.item_count(), 20);
    assert_eq!(state.next_cursor, Some(Cursor(1)));

    catalog.recover(1);
    assert_eq!(orch.load_next_page(&key).await, NextPageOutcome::Appended { items: 20 });
    assert_eq!(orch.snapshot(&key).unwrap().status, FetchStatus::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_first_page_is_not_retried() {
    let catalog = Arc::new(Catalog::new(100));
    catalog.fail(0, FetchError::from_status(403, "forbidden"));
    let orch = orchestrator(&catalog, OrchestratorOptions::default());

    let state = orch.load_first_page(&movies(20)).await;
    let FetchStatus::Error(info) = state.status else {
        panic!("expected error status");
    };
    assert_eq!(info.kind, ErrorKind::Fatal);
    assert_eq!(info.attempts, 1);
    assert_eq!(catalog.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_failure_leaves_status_alone() {
    let catalog = Arc::new(Catalog::new(100));
    let orch = orchestrator(&catalog, OrchestratorOptions::default());
    let query = movies(20);
    let key = query.cache_key();
    orch.load_first_page(&query).await;

    catalog.fail(1, FetchError::from_status(500, "internal"));
    let report = orch.prefetch_ahead(&key, 3).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.fetched, 0);

    let state = orch.snapshot(&key).unwrap();
    assert_eq!(state.status, FetchStatus::Ready);
    assert_eq!(state.item_count(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_cancels_in_flight_load() {
    let catalog = Arc::new(Catalog::new(100).with_delay(1, Duration::from_secs(10)));
    let orch = orchestrator(&catalog, OrchestratorOptions::default());
    let query = movies(20);
    let key = query.cache_key();
    let mut sub = orch.subscribe(&query);
    orch.load_first_page(&query).await;

    let task = {
        let orch = orch.clone();
        let key = key.clone();
        tokio::spawn(async move { orch.load_next_page(&key).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sub.snapshot().status, FetchStatus::LoadingMore);

    assert!(orch.invalidate_feed(&key));
    assert_eq!(task.await.unwrap(), NextPageOutcome::Cancelled);

    let state = sub.snapshot();
    assert_eq!(state.status, FetchStatus::Ready);
    assert_eq!(state.item_count(), 20);
    assert!(orch.snapshot(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_subscription_follows_reload_after_invalidation() {
    let catalog = Arc::new(Catalog::new(100));
    let orch = orchestrator(&catalog, OrchestratorOptions::default());
    let query = movies(20);
    let key = query.cache_key();
    let mut sub = orch.subscribe(&query);
    orch.load_first_page(&query).await;
    assert_eq!(sub.snapshot().item_count(), 20);

    assert!(orch.invalidate_feed(&key));
    assert!(sub.is_detached());
    let gone = tokio::time::timeout(Duration::from_secs(60), sub.changed()).await;
    assert_eq!(gone, Ok(false));

    orch.load_first_page(&query).await;
    let moved = tokio::time::timeout(Duration::from_secs(60), sub.changed()).await;
    assert_eq!(moved, Ok(true));
    assert!(!sub.is_detached());
    assert_eq!(sub.snapshot().item_count(), 20);

    orch.load_next_page(&key).await;
    assert!(sub.changed().await);
    assert_eq!(sub.snapshot().item_count(), 40);
}

#[tokio::test(start_paused = true)]
async fn test_prefetched_page_served_without_fetch() {
    let catalog = Arc::new(Catalog::new(100));
    let orch = orchestrator(&catalog, OrchestratorOptions::default());
    let query = movies(20);
    let key = query.cache_key();
    orch.load_first_page(&query).await;

    let report = orch.prefetch_ahead(&key, 2).await;
    assert_eq!(report.fetched, 2);
    assert_eq!(catalog.calls(), 3);

    assert_eq!(orch.load_next_page(&key).await, NextPageOutcome::Appended { items: 20 });
    assert_eq!(orch.load_next_page(&key).await, NextPageOutcome::Appended { items: 20 });
    assert_eq!(catalog.calls(), 3);
    assert_eq!(orch.cached_page_count(), 0);

    // Nothing left to reuse: the following prefetch goes to the network.
    let report = orch.prefetch_ahead(&key, 1).await;
    assert_eq!(report.cache_hits, 0);
    assert_eq!(report.fetched, 1);
}
