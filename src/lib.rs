//! feed-prefetch: predictive content cache for paginated media feeds.
//!
//! Keeps browse feeds (movies, shows, genres, ...) warm ahead of the user:
//!   TTL store → cursor-paginated feed state → velocity-adaptive prefetch
//!
//! and sheds background work when the device enters a constrained mode such
//! as video playback.

pub mod cache;
pub mod config;
pub mod engine;
pub mod fetch;
pub mod mode;
pub mod prefetch;

pub use cache::key::{CacheKey, FeedQuery, KeyPattern, SortOrder};
pub use cache::store::{StoreStats, TtlStore};
pub use config::{Config, Profile};
pub use engine::PrefetchEngine;
pub use fetch::error::{ErrorInfo, ErrorKind, FetchError};
pub use fetch::orchestrator::{
    FeedOrchestrator, FeedState, FeedSubscription, FetchStatus, NextPageOutcome, PrefetchReport,
};
pub use fetch::page::{Cursor, Page, PageFetcher};
pub use fetch::retry::{retry_with_backoff, RetryPolicy};
pub use mode::{Mode, ModeController, ModePolicy};
pub use prefetch::velocity::{PrefetchHint, PrefetchLevel, VelocitySample, VelocityTracker};
