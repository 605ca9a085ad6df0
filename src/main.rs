//! feed-prefetch: simulated browsing session over the predictive feed cache.
//!
//! Serves a synthetic catalog with configurable size and failure rate, then
//! walks through a typical session: first page, fast scroll with velocity
//! prefetch, load-more, bulk prefetch, and a playback interruption that puts
//! the engine in constrained mode.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::Serialize;
use tokio::time::{interval, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use feed_prefetch::config::{Cli, Config};
use feed_prefetch::prefetch::driver::drive_scroll_prefetch;
use feed_prefetch::{
    Cursor, FetchError, Mode, NextPageOutcome, Page, PageFetcher, PrefetchEngine, SortOrder,
    VelocitySample,
};

/// One catalog entry.
#[derive(Debug, Clone, Serialize)]
struct Title {
    id: u32,
    name: String,
}

/// In-memory catalog standing in for the content backend.
struct SimulatedCatalog {
    total: u32,
    failure_every: u32,
    latency: Duration,
    requests: AtomicU32,
}

impl SimulatedCatalog {
    fn new(total: u32, failure_every: u32) -> Self {
        Self {
            total,
            failure_every,
            latency: Duration::from_millis(40),
            requests: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PageFetcher<Title> for SimulatedCatalog {
    async fn fetch_page(
        &self,
        cursor: Option<Cursor>,
        page_size: u32,
    ) -> Result<Page<Title>, FetchError> {
        let request = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.latency).await;

        if self.failure_every > 0 && request % self.failure_every == 0 {
            return Err(FetchError::from_status(503, "simulated outage"));
        }

        let index = cursor.map(|c| c.0).unwrap_or(0);
        let start = index.saturating_mul(page_size);
        let end = start.saturating_add(page_size).min(self.total);
        let items: Vec<Title> = (start..end)
            .map(|id| Title {
                id,
                name: format!("Title #{id}"),
            })
            .collect();

        let next = (end < self.total).then_some(Cursor(index + 1));
        Ok(Page::new(items, next))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "feed_prefetch=debug"
    } else {
        "feed_prefetch=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("feed-prefetch v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config, cli.profile)?;
    info!(
        profile = ?cli.profile,
        items = cli.items,
        failure_every = cli.failure_every,
        "Configuration loaded"
    );

    let engine = PrefetchEngine::new(config);
    let feed = engine.feed(SimulatedCatalog::new(cli.items, cli.failure_every));

    // First page, with a UI subscription keeping the feed alive.
    let movies = engine.query("movies", "release_date", SortOrder::Desc);
    let key = movies.cache_key();
    let mut subscription = feed.subscribe(&movies);

    let state = feed.load_first_page(&movies).await;
    info!(key = %key, items = state.item_count(), status = ?state.status, "First page");
    if let Some(title) = state.items().next() {
        info!(row = %serde_json::to_string(title)?, "Sample row");
    }

    // Fast forward scroll: 60 frames, 12 units per frame.
    let started = Instant::now();
    let frames = IntervalStream::new(interval(Duration::from_millis(16)))
        .take(60)
        .map(|tick| {
            let ms = tick.duration_since(started).as_millis() as u64;
            VelocitySample::new(ms as f64 * 0.75, ms)
        });

    let mut tracker = engine.velocity_tracker();
    let mut debouncer = engine.debouncer();
    let summary = drive_scroll_prefetch(frames, &mut tracker, &mut debouncer, &feed, &key).await;
    let hint = tracker.classify();
    info!(
        samples = summary.samples,
        triggered = summary.triggered,
        fetched = summary.fetched,
        level = ?hint.level,
        "Scroll session"
    );

    // Load-more, served from the prefetch cache where possible.
    for _ in 0..3 {
        match feed.load_next_page(&key).await {
            NextPageOutcome::Appended { items } => info!(items, "Loaded next page"),
            NextPageOutcome::Failed(err) => {
                warn!(attempts = err.attempts, "Load more failed: {}", err.message)
            }
            other => info!(outcome = ?other, "Load more skipped"),
        }
    }

    let report = feed.prefetch_bulk(&key, 4).await;
    info!(
        fetched = report.fetched,
        spliced = report.spliced,
        failed = report.failed,
        "Bulk prefetch"
    );

    // Playback starts: background feeds are shed until it ends.
    let transition = engine.set_mode(Mode::Constrained);
    info!(evicted = transition.evicted, "Playback started");

    let shows = engine.query("shows", "title", SortOrder::Asc);
    let report = feed.prefetch_ahead(&shows.cache_key(), 2).await;
    info!(skipped = ?report.skipped, "Prefetch during playback");

    engine.set_mode(Mode::Normal);
    let state = feed.load_first_page(&movies).await;
    info!(items = state.item_count(), has_more = state.has_more(), "Movies after playback");

    info!(
        feeds = feed.feed_count(),
        cached_pages = feed.cached_page_count(),
        live_items = subscription.snapshot().item_count(),
        "Session complete"
    );

    drop(subscription);
    engine.shutdown().await;

    Ok(())
}
