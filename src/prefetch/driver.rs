//! Turns the UI's scroll stream into prefetch calls.

use tokio::task::JoinSet;
use tokio::time::sleep_until;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::cache::key::CacheKey;
use crate::fetch::orchestrator::{FeedOrchestrator, PrefetchReport};
use crate::prefetch::debounce::Debouncer;
use crate::prefetch::velocity::{ScrollDirection, VelocitySample, VelocityTracker};

/// Totals for one scroll session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrollSummary {
    pub samples: usize,
    /// Prefetches issued.
    pub triggered: usize,
    pub fetched: usize,
    pub cache_hits: usize,
    /// Prefetches that declined to run (in flight, constrained, exhausted).
    pub skipped: usize,
}

impl ScrollSummary {
    fn absorb(&mut self, report: PrefetchReport) {
        self.fetched += report.fetched;
        self.cache_hits += report.cache_hits;
        if report.skipped.is_some() {
            self.skipped += 1;
        }
    }
}

/// Consume `samples` until the stream ends, prefetching ahead of forward
/// scrolling on `key` with the distance the tracker recommends.
///
/// Prefetches are debounced: the first forward sample of a burst triggers
/// one, and if the burst continues a trailing prefetch runs once the
/// interval has passed, using the latest classification.
pub async fn drive_scroll_prefetch<T, S>(
    samples: S,
    tracker: &mut VelocityTracker,
    debouncer: &mut Debouncer,
    orchestrator: &FeedOrchestrator<T>,
    key: &CacheKey,
) -> ScrollSummary
where
    T: Clone + Send + Sync + 'static,
    S: Stream<Item = VelocitySample>,
{
    tokio::pin!(samples);
    let mut tasks = JoinSet::new();
    let mut summary = ScrollSummary::default();
    let mut pending = false;

    loop {
        let deadline = debouncer.next_ready_at();

        tokio::select! {
            sample = samples.next() => {
                let Some(sample) = sample else {
                    break;
                };
                summary.samples += 1;
                tracker.observe(sample);
            }
            _ = sleep_until(deadline), if pending => {
                pending = false;
            }
        }

        let hint = tracker.classify();
        if hint.direction != ScrollDirection::Forward {
            pending = false;
            continue;
        }
        if !debouncer.ready() {
            pending = true;
            continue;
        }

        debug!(
            key = %key,
            level = ?hint.level,
            distance = hint.prefetch_distance,
            velocity = hint.velocity,
            "Scroll-triggered prefetch"
        );
        summary.triggered += 1;

        let orchestrator = orchestrator.clone();
        let key = key.clone();
        tasks.spawn(async move { orchestrator.prefetch_ahead(&key, hint.prefetch_distance).await });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => summary.absorb(report),
            Err(e) => warn!("Prefetch task failed: {e}"),
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cache::key::{FeedQuery, SortOrder};
    use crate::config::VelocityConfig;
    use crate::fetch::error::FetchError;
    use crate::fetch::orchestrator::OrchestratorOptions;
    use crate::fetch::page::{Cursor, Page};
    use crate::mode::ModePolicy;

    fn orchestrator(calls: Arc<AtomicU32>) -> FeedOrchestrator<u32> {
        let fetcher = move |cursor: Option<Cursor>, size: u32| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                let index = cursor.map(|c| c.0).unwrap_or(0);
                Ok::<_, FetchError>(Page::new(vec![index; size as usize], Some(Cursor(index + 1))))
            }
        };
        FeedOrchestrator::new(
            fetcher,
            ModePolicy::new(Duration::from_secs(600), Duration::from_secs(120)),
            OrchestratorOptions::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_forward_scroll_prefetches() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = orchestrator(calls.clone());
        let query = FeedQuery::new("movies", "id", SortOrder::Asc, 10);
        orch.load_first_page(&query).await;

        let samples =
            tokio_stream::iter((0..5u64).map(|i| VelocitySample::new(i as f64 * 10.0, i * 5)));
        let mut tracker = VelocityTracker::new(VelocityConfig::default());
        let mut debouncer = Debouncer::new(Duration::from_millis(150));

        let key = query.cache_key();
        let summary = drive_scroll_prefetch(samples, &mut tracker, &mut debouncer, &orch, &key).await;

        assert_eq!(summary.samples, 5);
        assert!(summary.triggered >= 1);
        // UltraHigh: five pages ahead, at least one prefetch fetched them.
        assert!(summary.fetched >= 5);
        assert!(orch.is_page_cached(&query.cache_key(), Cursor(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_scroll_does_not_prefetch() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = orchestrator(calls.clone());
        let query = FeedQuery::new("movies", "id", SortOrder::Asc, 10);
        orch.load_first_page(&query).await;

        let samples =
            tokio_stream::iter((0..5u64).map(|i| VelocitySample::new(i as f64 * 0.1, i * 16)));
        let mut tracker = VelocityTracker::new(VelocityConfig::default());
        let mut debouncer = Debouncer::new(Duration::from_millis(150));

        let key = query.cache_key();
        let summary = drive_scroll_prefetch(samples, &mut tracker, &mut debouncer, &orch, &key).await;

        assert_eq!(summary.triggered, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
