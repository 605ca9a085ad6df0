//! Scroll-driven prefetching.
//!
//! - [`velocity`]: rolling scroll velocity and prefetch-distance classification
//! - [`debounce`]: collapses bursts of triggers into one call per interval
//! - [`driver`]: consumes the UI scroll stream and schedules prefetches

pub mod debounce;
pub mod driver;
pub mod velocity;
