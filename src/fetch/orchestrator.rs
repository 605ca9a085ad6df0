//! Paginated fetch orchestrator.
//!
//! Owns one [`FeedState`] per feed key and drives it through
//!
//! ```text
//! Idle ──► Loading ──► Ready ◄──► LoadingMore
//!             │          ▲             │
//!             ▼          │             ▼
//!           Error ───────┴──────────  Error (pages kept)
//! ```
//!
//! Each feed lives in a `watch` channel. Every write goes through the
//! channel's sender, which serializes `load_next_page`, `prefetch_ahead` and
//! `prefetch_bulk` for the same key; UI observers read consistent snapshots
//! from receivers without blocking the writer.
//!
//! Only one user-initiated fetch may be in flight per key: a load claims the
//! key by flipping `status` to `Loading`/`LoadingMore` before its first await,
//! and any concurrent load sees the claim and backs off.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::key::{CacheKey, FeedQuery, KeyPattern};
use crate::cache::store::{Evictable, TtlStore};
use crate::config::Config;
use crate::fetch::error::ErrorInfo;
use crate::fetch::page::{Cursor, Page, PageFetcher};
use crate::fetch::retry::{retry_with_backoff, RetryFailure, RetryPolicy};
use crate::mode::{ModeController, ModePolicy};

/// Fetch lifecycle of one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    /// Created, nothing requested yet.
    Idle,
    /// First page in flight.
    Loading,
    /// An append is in flight.
    LoadingMore,
    Ready,
    /// Last user-initiated fetch failed. Pages loaded before it are kept.
    Error(ErrorInfo),
}

impl FetchStatus {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, FetchStatus::Loading | FetchStatus::LoadingMore)
    }
}

/// Accumulated pages of one feed query.
#[derive(Debug, Clone)]
pub struct FeedState<T> {
    pub pages: Vec<Page<T>>,
    pub next_cursor: Option<Cursor>,
    pub status: FetchStatus,
}

impl<T> FeedState<T> {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            next_cursor: None,
            status: FetchStatus::Idle,
        }
    }

    pub fn has_data(&self) -> bool {
        !self.pages.is_empty()
    }

    /// All items in page order.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.pages.iter().flat_map(|page| page.items.iter())
    }

    pub fn item_count(&self) -> usize {
        self.pages.iter().map(|page| page.items.len()).sum()
    }

    /// Whether more pages can be requested.
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }

    fn append(&mut self, page: Page<T>, page_size: u32) {
        self.next_cursor = page.continuation(page_size);
        self.pages.push(page);
    }
}

/// Result of [`FeedOrchestrator::load_next_page`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPageOutcome {
    /// A page was appended.
    Appended { items: usize },
    /// The page arrived but a prefetch had already appended it.
    Superseded,
    /// The feed has no further pages.
    Exhausted,
    /// Another fetch for this key is in flight.
    InFlight,
    /// The first page has not loaded yet.
    NotReady,
    /// No such feed (never loaded, invalidated, or expired).
    Missing,
    /// The fetch was cancelled; the feed keeps its pages.
    Cancelled,
    Failed(ErrorInfo),
}

/// Why a background prefetch did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Missing,
    NotReady,
    InFlight,
    Exhausted,
    Constrained,
}

/// What a background prefetch did. Background failures end up here and
/// nowhere else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Pages fetched from the network.
    pub fetched: usize,
    /// Pages already present in the page cache.
    pub cache_hits: usize,
    /// Pages appended to the feed (bulk prefetch only).
    pub spliced: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub skipped: Option<SkipReason>,
}

impl PrefetchReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }
}

/// Retry budgets and limits for one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub first_page_retry: RetryPolicy,
    pub next_page_retry: RetryPolicy,
    pub background_retry: RetryPolicy,
    /// Upper bound on concurrent fetches in one bulk prefetch.
    pub concurrency_cap: usize,
    /// Delay before a feed without subscribers is dropped.
    pub retention: Duration,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            first_page_retry: RetryPolicy::single_shot(),
            next_page_retry: RetryPolicy::infinite_scroll(),
            background_retry: RetryPolicy::infinite_scroll(),
            concurrency_cap: 2,
            retention: Duration::from_secs(300),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            first_page_retry: config.retry.single_shot.policy(),
            next_page_retry: config.retry.infinite.policy(),
            background_retry: config.retry.infinite.policy(),
            concurrency_cap: config.prefetch.concurrency_cap.max(1),
            retention: config.cache.retention(),
        }
    }
}

struct FeedSlot<T> {
    key: CacheKey,
    page_size: u32,
    state: watch::Sender<FeedState<T>>,
    /// Set while a background prefetch runs for this key.
    background: AtomicBool,
    /// Cancels user-initiated fetches when the feed is dropped.
    cancel: CancellationToken,
}

impl<T: Clone> FeedSlot<T> {
    fn new(key: CacheKey, page_size: u32) -> Self {
        let (state, _) = watch::channel(FeedState::new());
        Self {
            key,
            page_size,
            state,
            background: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    fn snapshot(&self) -> FeedState<T> {
        self.state.borrow().clone()
    }
}

/// Clears the background flag when a prefetch ends, however it ends.
struct BackgroundGuard<'a>(&'a AtomicBool);

impl<'a> BackgroundGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BackgroundGuard(flag))
    }
}

impl Drop for BackgroundGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type FeedStore<T> = TtlStore<Arc<FeedSlot<T>>>;

/// Live subscriptions of one key. `epoch` moves every time the count drops
/// to zero, so only the latest retention timer may release the feed.
#[derive(Debug, Default)]
struct Watchers {
    count: usize,
    epoch: u64,
}

struct Inner<T> {
    fetcher: Arc<dyn PageFetcher<T>>,
    feeds: Arc<FeedStore<T>>,
    pages: Arc<TtlStore<Page<T>>>,
    watchers: Mutex<HashMap<CacheKey, Watchers>>,
    policy: ModePolicy,
    options: OrchestratorOptions,
}

/// Page accumulation and prefetch for every feed of one item type.
pub struct FeedOrchestrator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FeedOrchestrator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> FeedOrchestrator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        fetcher: impl PageFetcher<T> + 'static,
        policy: ModePolicy,
        options: OrchestratorOptions,
    ) -> Self {
        Self::with_fetcher(Arc::new(fetcher), policy, options)
    }

    pub fn with_fetcher(
        fetcher: Arc<dyn PageFetcher<T>>,
        policy: ModePolicy,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                feeds: Arc::new(TtlStore::new("feeds")),
                pages: Arc::new(TtlStore::new("pages")),
                watchers: Mutex::new(HashMap::new()),
                policy,
                options,
            }),
        }
    }

    /// Hand both caches to a mode controller.
    pub fn attach(&self, controller: &ModeController) {
        controller.register(self.inner.feeds.clone());
        controller.register(self.inner.pages.clone());
    }

    /// Stores owned by this orchestrator, for sweeping.
    pub fn stores(&self) -> [Arc<dyn Evictable>; 2] {
        [self.inner.feeds.clone(), self.inner.pages.clone()]
    }

    /// Number of feeds currently cached.
    pub fn feed_count(&self) -> usize {
        self.inner.feeds.len()
    }

    /// Number of prefetched pages waiting in the page cache.
    pub fn cached_page_count(&self) -> usize {
        self.inner.pages.len()
    }

    /// Consistent snapshot of a cached feed.
    pub fn snapshot(&self, key: &CacheKey) -> Option<FeedState<T>> {
        self.slot(key).map(|slot| slot.snapshot())
    }

    /// Whether `key`'s page at `cursor` is in the page cache.
    pub fn is_page_cached(&self, key: &CacheKey, cursor: Cursor) -> bool {
        self.inner.pages.get(key.page(cursor)).is_some()
    }

    fn slot(&self, key: &CacheKey) -> Option<Arc<FeedSlot<T>>> {
        self.inner.feeds.get(key)
    }

    fn slot_for(&self, query: &FeedQuery) -> Arc<FeedSlot<T>> {
        let key = query.cache_key();
        self.inner
            .feeds
            .get_or_insert_with(&key, self.inner.policy.feed_ttl(), || {
                Arc::new(FeedSlot::new(key.clone(), query.page_size))
            })
    }

    /// Load the first page of `query`, or return the cached feed.
    ///
    /// A cached feed with data is returned without any fetch. If another
    /// caller is already loading the first page, this waits for that load
    /// instead of issuing a second request.
    pub async fn load_first_page(&self, query: &FeedQuery) -> FeedState<T> {
        let slot = self.slot_for(query);

        let claimed = slot.state.send_if_modified(|s| {
            if s.status.is_in_flight() || s.has_data() {
                return false;
            }
            s.status = FetchStatus::Loading;
            true
        });

        if !claimed {
            debug!(key = %slot.key, "First page served from cache");
            return self.settled(&slot).await;
        }

        self.fetch_first_page(&slot).await
    }

    /// Drop cached pages and reload the first page of `query`, keeping
    /// current subscribers attached.
    pub async fn refresh(&self, query: &FeedQuery) -> FeedState<T> {
        let slot = self.slot_for(query);
        self.inner.pages.invalidate_pattern(&slot.key.pages_pattern());

        let claimed = slot.state.send_if_modified(|s| {
            if s.status.is_in_flight() {
                return false;
            }
            s.status = FetchStatus::Loading;
            true
        });

        if !claimed {
            return self.settled(&slot).await;
        }

        self.fetch_first_page(&slot).await
    }

    /// Wait until the feed has no first-page load in flight.
    async fn settled(&self, slot: &FeedSlot<T>) -> FeedState<T> {
        let mut rx = slot.state.subscribe();
        let settled = match rx.wait_for(|s| s.status != FetchStatus::Loading).await {
            Ok(state) => state.clone(),
            Err(_) => slot.snapshot(),
        };
        settled
    }

    async fn fetch_first_page(&self, slot: &FeedSlot<T>) -> FeedState<T> {
        info!(key = %slot.key, page_size = slot.page_size, "Loading first page");

        let result = self
            .fetch(slot, None, &self.inner.options.first_page_retry, &slot.cancel, "first_page")
            .await;

        match result {
            Ok(page) => {
                let items = page.items.len();
                slot.state.send_modify(|s| {
                    s.pages.clear();
                    s.append(page, slot.page_size);
                    s.status = FetchStatus::Ready;
                });
                self.inner.feeds.refresh(&slot.key, self.inner.policy.feed_ttl());
                debug!(key = %slot.key, items, "First page loaded");
            }
            Err(failure) if failure.is_cancelled() => {
                debug!(key = %slot.key, "First page load cancelled");
                slot.state.send_modify(|s| {
                    s.status = if s.has_data() {
                        FetchStatus::Ready
                    } else {
                        FetchStatus::Idle
                    };
                });
            }
            Err(failure) => {
                warn!(
                    key = %slot.key,
                    attempts = failure.attempts,
                    "First page failed: {}",
                    failure.error
                );
                slot.state.send_modify(|s| s.status = FetchStatus::Error(failure.info()));
            }
        }

        slot.snapshot()
    }

    /// Append the next page of the feed at `key`.
    ///
    /// A no-op (reported in the outcome) while another fetch for the key is
    /// in flight, before the first page has loaded, or once the feed is
    /// exhausted. After a failed append the feed keeps its pages and this can
    /// be called again to retry.
    pub async fn load_next_page(&self, key: &CacheKey) -> NextPageOutcome {
        let Some(slot) = self.slot(key) else {
            return NextPageOutcome::Missing;
        };

        let mut claimed = None;
        let mut refused = NextPageOutcome::NotReady;
        slot.state.send_if_modified(|s| {
            if s.status.is_in_flight() {
                refused = NextPageOutcome::InFlight;
                return false;
            }
            if !s.has_data() {
                return false;
            }
            match s.next_cursor {
                Some(cursor) => {
                    claimed = Some(cursor);
                    s.status = FetchStatus::LoadingMore;
                    true
                }
                None => {
                    refused = NextPageOutcome::Exhausted;
                    false
                }
            }
        });

        let Some(cursor) = claimed else {
            return refused;
        };

        let page_key = key.page(cursor);
        let result = match self.inner.pages.get(&page_key) {
            Some(page) => {
                debug!(key = %key, %cursor, "Next page served from prefetch cache");
                Ok(page)
            }
            None => {
                let policy = &self.inner.options.next_page_retry;
                self.fetch(&slot, Some(cursor), policy, &slot.cancel, "next_page").await
            }
        };

        match result {
            Ok(page) => {
                let items = page.items.len();
                let mut applied = false;
                slot.state.send_modify(|s| {
                    // A bulk prefetch may have appended this cursor meanwhile.
                    if s.next_cursor == Some(cursor) {
                        s.append(page, slot.page_size);
                        applied = true;
                    }
                    s.status = FetchStatus::Ready;
                });
                self.inner.pages.invalidate(&page_key);
                self.inner.feeds.refresh(key, self.inner.policy.feed_ttl());

                if applied {
                    debug!(key = %key, %cursor, items, "Page appended");
                    NextPageOutcome::Appended { items }
                } else {
                    NextPageOutcome::Superseded
                }
            }
            Err(failure) if failure.is_cancelled() => {
                slot.state.send_modify(|s| s.status = FetchStatus::Ready);
                NextPageOutcome::Cancelled
            }
            Err(failure) => {
                warn!(
                    key = %key,
                    %cursor,
                    attempts = failure.attempts,
                    "Next page failed: {}",
                    failure.error
                );
                let info = failure.info();
                slot.state.send_modify(|s| s.status = FetchStatus::Error(info.clone()));
                NextPageOutcome::Failed(info)
            }
        }
    }

    /// Warm the page cache with up to `distance` pages following the feed's
    /// current position, one after another. The feed itself is not touched:
    /// a later `load_next_page` finds the pages in cache.
    pub async fn prefetch_ahead(&self, key: &CacheKey, distance: u32) -> PrefetchReport {
        let cancel = self.inner.policy.background_token();
        let (slot, start) = match self.background_start(key) {
            Ok(found) => found,
            Err(reason) => return PrefetchReport::skipped(reason),
        };
        let Some(_guard) = BackgroundGuard::acquire(&slot.background) else {
            return PrefetchReport::skipped(SkipReason::InFlight);
        };

        let mut report = PrefetchReport::default();
        let mut cursor = Some(start);

        for _ in 0..distance {
            let Some(current) = cursor else {
                break;
            };

            match self.cached_or_fetch(&slot, current, &cancel, "prefetch_ahead").await {
                Ok((page, from_cache)) => {
                    if from_cache {
                        report.cache_hits += 1;
                    } else {
                        report.fetched += 1;
                    }
                    cursor = page.continuation(slot.page_size);
                }
                Err(failure) if failure.is_cancelled() => {
                    debug!(key = %key, cursor = %current, "Prefetch cancelled");
                    report.cancelled = true;
                    break;
                }
                Err(failure) => {
                    warn!(
                        key = %key,
                        cursor = %current,
                        attempts = failure.attempts,
                        "Background prefetch failed: {}",
                        failure.error
                    );
                    report.failed += 1;
                    break;
                }
            }
        }

        debug!(
            key = %key,
            fetched = report.fetched,
            hits = report.cache_hits,
            "Prefetch ahead done"
        );
        report
    }

    /// Fetch up to `min(max_pages, concurrency_cap)` pages concurrently,
    /// starting at the feed's next cursor, and append them in cursor order.
    ///
    /// Pages that complete before their predecessor are held back until it
    /// arrives; if it never does they stay in the page cache for a later
    /// `load_next_page`. Failures are logged and counted, never surfaced in
    /// the feed's status.
    pub async fn prefetch_bulk(&self, key: &CacheKey, max_pages: u32) -> PrefetchReport {
        let cancel = self.inner.policy.background_token();
        let (slot, start) = match self.background_start(key) {
            Ok(found) => found,
            Err(reason) => return PrefetchReport::skipped(reason),
        };
        let Some(_guard) = BackgroundGuard::acquire(&slot.background) else {
            return PrefetchReport::skipped(SkipReason::InFlight);
        };

        let count = (max_pages as usize).min(self.inner.options.concurrency_cap) as u32;
        let mut report = PrefetchReport::default();

        let mut pending: FuturesUnordered<_> = (0..count)
            .map(|offset| {
                let cursor = start.advance(offset);
                let slot = &slot;
                let cancel = &cancel;
                async move {
                    let result = self.cached_or_fetch(slot, cursor, cancel, "prefetch_bulk").await;
                    (cursor, result)
                }
            })
            .collect();

        let mut held: BTreeMap<Cursor, Page<T>> = BTreeMap::new();

        while let Some((cursor, result)) = pending.next().await {
            match result {
                Ok((page, from_cache)) => {
                    if from_cache {
                        report.cache_hits += 1;
                    } else {
                        report.fetched += 1;
                    }
                    held.insert(cursor, page);
                    report.spliced += self.splice_in_order(&slot, &mut held);
                }
                Err(failure) if failure.is_cancelled() => {
                    report.cancelled = true;
                }
                Err(failure) => {
                    warn!(
                        key = %key,
                        %cursor,
                        attempts = failure.attempts,
                        "Bulk prefetch page failed: {}",
                        failure.error
                    );
                    report.failed += 1;
                }
            }
        }

        if !held.is_empty() {
            debug!(key = %key, held = held.len(), "Pages left in cache awaiting predecessor");
        }
        debug!(
            key = %key,
            fetched = report.fetched,
            spliced = report.spliced,
            failed = report.failed,
            "Bulk prefetch done"
        );
        report
    }

    /// Append held pages while the feed's next cursor is among them.
    fn splice_in_order(&self, slot: &FeedSlot<T>, held: &mut BTreeMap<Cursor, Page<T>>) -> usize {
        let mut spliced = Vec::new();

        slot.state.send_if_modified(|s| {
            while let Some(next) = s.next_cursor {
                let Some(page) = held.remove(&next) else {
                    break;
                };
                s.append(page, slot.page_size);
                spliced.push(next);
            }
            // Anything at or before the feed's position, or past its end, is stale.
            match s.next_cursor {
                Some(next) => held.retain(|cursor, _| *cursor > next),
                None => held.clear(),
            }
            !spliced.is_empty()
        });

        for cursor in &spliced {
            self.inner.pages.invalidate(slot.key.page(*cursor));
        }
        spliced.len()
    }

    /// Slot and starting cursor for a background prefetch, or why it must not run.
    ///
    /// Callers take their background token before this check: an entry into
    /// constrained mode racing with it either fails the check or cancels the
    /// token.
    fn background_start(&self, key: &CacheKey) -> Result<(Arc<FeedSlot<T>>, Cursor), SkipReason> {
        if self.inner.policy.is_constrained() {
            return Err(SkipReason::Constrained);
        }
        let slot = self.slot(key).ok_or(SkipReason::Missing)?;

        let state = slot.state.borrow();
        if state.status.is_in_flight() {
            return Err(SkipReason::InFlight);
        }
        if state.status != FetchStatus::Ready {
            return Err(SkipReason::NotReady);
        }
        let start = state.next_cursor.ok_or(SkipReason::Exhausted)?;
        drop(state);

        Ok((slot, start))
    }

    async fn cached_or_fetch(
        &self,
        slot: &FeedSlot<T>,
        cursor: Cursor,
        cancel: &CancellationToken,
        op_name: &str,
    ) -> Result<(Page<T>, bool), RetryFailure> {
        let page_key = slot.key.page(cursor);
        if let Some(page) = self.inner.pages.get(&page_key) {
            return Ok((page, true));
        }

        let page = self
            .fetch(slot, Some(cursor), &self.inner.options.background_retry, cancel, op_name)
            .await?;

        // Constrained mode may have evicted this namespace while the page was
        // in flight. Nothing may be written back after that.
        if cancel.is_cancelled() {
            return Err(RetryFailure::cancelled(1));
        }
        self.inner
            .pages
            .set(page_key.as_str(), page.clone(), self.inner.policy.feed_ttl());
        if cancel.is_cancelled() {
            self.inner.pages.invalidate(&page_key);
            return Err(RetryFailure::cancelled(1));
        }
        Ok((page, false))
    }

    async fn fetch(
        &self,
        slot: &FeedSlot<T>,
        cursor: Option<Cursor>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        op_name: &str,
    ) -> Result<Page<T>, RetryFailure> {
        let fetcher = &self.inner.fetcher;
        let page_size = slot.page_size;
        retry_with_backoff(policy, cancel, op_name, || fetcher.fetch_page(cursor, page_size)).await
    }

    /// Drop one feed and its cached pages, cancelling its in-flight loads.
    pub fn invalidate_feed(&self, key: &CacheKey) -> bool {
        let slot = self.inner.feeds.get(key);
        let removed = self.inner.feeds.invalidate(key);
        self.inner.pages.invalidate_pattern(&key.pages_pattern());
        if let Some(slot) = slot {
            slot.cancel.cancel();
        }
        removed
    }

    /// Drop every feed in `namespace`. Returns the number of feeds dropped.
    pub fn invalidate_namespace(&self, namespace: &str) -> usize {
        let pattern = KeyPattern::namespace(namespace);
        let slots = self.inner.feeds.remove_matching(&pattern);
        self.inner.pages.invalidate_pattern(&pattern);
        for slot in &slots {
            slot.cancel.cancel();
        }
        info!(namespace, feeds = slots.len(), "Namespace invalidated");
        slots.len()
    }

    /// Observe a feed, creating it (idle) if needed.
    ///
    /// The subscription follows the key, not one feed instance: if the feed
    /// is evicted and later reloaded, the subscription moves to the new one.
    /// When the last subscription of a key is dropped, the feed is removed
    /// after the configured retention delay unless someone subscribes again.
    pub fn subscribe(&self, query: &FeedQuery) -> FeedSubscription<T> {
        let slot = self.slot_for(query);
        self.inner
            .watchers
            .lock()
            .entry(slot.key.clone())
            .or_default()
            .count += 1;

        FeedSubscription {
            key: slot.key.clone(),
            rx: slot.state.subscribe(),
            slot: Arc::downgrade(&slot),
            owner: Arc::downgrade(&self.inner),
        }
    }
}

/// Drop the feed at `key` if nobody subscribed to it since `epoch`.
fn release_if_unused<T>(inner: &Inner<T>, key: &CacheKey, epoch: u64)
where
    T: Clone + Send + Sync + 'static,
{
    {
        let mut watchers = inner.watchers.lock();
        let idle = watchers
            .get(key)
            .is_some_and(|w| w.count == 0 && w.epoch == epoch);
        if !idle {
            return;
        }
        watchers.remove(key);
    }

    let slot = inner.feeds.get(key);
    inner.feeds.invalidate(key);
    inner.pages.invalidate_pattern(&key.pages_pattern());
    if let Some(slot) = slot {
        slot.cancel.cancel();
    }
    debug!(key = %key, "Released unobserved feed");
}

/// A live view of the feed at one key. Dropping the last subscription of a
/// key starts its retention countdown.
///
/// Only a weak reference to the feed is held. Once the feed is evicted and
/// its last in-flight load finishes, the channel closes; the subscription
/// then re-attaches to a reloaded feed or reports the feed gone.
pub struct FeedSubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    key: CacheKey,
    rx: watch::Receiver<FeedState<T>>,
    slot: Weak<FeedSlot<T>>,
    owner: Weak<Inner<T>>,
}

impl<T> FeedSubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Current state of the cached feed. After an eviction this is the last
    /// state seen until the key is loaded again.
    pub fn snapshot(&mut self) -> FeedState<T> {
        self.reattach();
        let state = self.rx.borrow_and_update().clone();
        state
    }

    /// Wait for the next state change. Moving to a reloaded feed counts as
    /// a change. Returns `false` once the feed is gone and nothing replaced it.
    pub async fn changed(&mut self) -> bool {
        if self.reattach() {
            return true;
        }
        match self.rx.changed().await {
            Ok(()) => true,
            Err(_) => self.reattach(),
        }
    }

    /// Whether the feed this subscription watches is no longer cached.
    pub fn is_detached(&self) -> bool {
        let Some(inner) = self.owner.upgrade() else {
            return true;
        };
        match (inner.feeds.get(&self.key), self.slot.upgrade()) {
            (Some(current), Some(slot)) => !Arc::ptr_eq(&current, &slot),
            _ => true,
        }
    }

    /// Switch to the feed currently cached under the key, if it is not the
    /// one already watched.
    fn reattach(&mut self) -> bool {
        let Some(inner) = self.owner.upgrade() else {
            return false;
        };
        let Some(current) = inner.feeds.get(&self.key) else {
            return false;
        };
        if self.slot.upgrade().is_some_and(|slot| Arc::ptr_eq(&slot, &current)) {
            return false;
        }

        debug!(key = %self.key, "Subscription moved to reloaded feed");
        self.rx = current.state.subscribe();
        self.slot = Arc::downgrade(&current);
        true
    }
}

impl<T> Drop for FeedSubscription<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let Some(inner) = self.owner.upgrade() else {
            return;
        };
        let epoch = {
            let mut watchers = inner.watchers.lock();
            let Some(w) = watchers.get_mut(&self.key) else {
                return;
            };
            w.count = w.count.saturating_sub(1);
            if w.count > 0 {
                return;
            }
            w.epoch += 1;
            w.epoch
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let retention = inner.options.retention;
                let owner = self.owner.clone();
                let key = self.key.clone();
                handle.spawn(async move {
                    tokio::time::sleep(retention).await;
                    if let Some(inner) = owner.upgrade() {
                        release_if_unused(&inner, &key, epoch);
                    }
                });
            }
            Err(_) => release_if_unused(&inner, &self.key, epoch),
        }
    }
}
