//! Fetching paginated feeds.
//!
//! - [`page`]: cursors, pages, and the injected [`page::PageFetcher`]
//! - [`error`]: failure taxonomy
//! - [`retry`]: capped exponential backoff
//! - [`orchestrator`]: per-feed page accumulation, single-flight loads and prefetch

pub mod error;
pub mod orchestrator;
pub mod page;
pub mod retry;
