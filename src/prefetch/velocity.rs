//! Scroll velocity classification.
//!
//! Keeps a rolling window of instantaneous scroll speeds and maps the mean
//! onto a prefetch aggressiveness level. Speeds are normalised to scroll
//! units per frame (`VelocityConfig::frame_ms`).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::VelocityConfig;

/// One scroll position reading from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VelocitySample {
    pub position: f64,
    pub timestamp_ms: u64,
}

impl VelocitySample {
    pub fn new(position: f64, timestamp_ms: u64) -> Self {
        Self {
            position,
            timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScrollDirection {
    Idle,
    Forward,
    Backward,
}

/// How aggressively to prefetch, ordered from least to most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrefetchLevel {
    Idle,
    Low,
    Medium,
    High,
    UltraHigh,
}

/// Classification of the current scroll motion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefetchHint {
    pub direction: ScrollDirection,
    pub level: PrefetchLevel,
    /// Pages to fetch ahead of the current position.
    pub prefetch_distance: u32,
    /// Mean speed over the window in units per frame, where a frame is
    /// `VelocityConfig::frame_ms` milliseconds (16 by default). This is
    /// units/ms multiplied by `frame_ms`, not a per-ms value.
    pub velocity: f64,
}

/// Rolling-window scroll velocity tracker.
#[derive(Debug, Clone)]
pub struct VelocityTracker {
    config: VelocityConfig,
    window: VecDeque<f64>,
    last: Option<VelocitySample>,
    last_delta: f64,
}

impl VelocityTracker {
    pub fn new(config: VelocityConfig) -> Self {
        let capacity = config.window.max(1);
        Self {
            config,
            window: VecDeque::with_capacity(capacity),
            last: None,
            last_delta: 0.0,
        }
    }

    /// Feed one sample. Samples whose timestamp does not move forward are
    /// ignored.
    pub fn observe(&mut self, sample: VelocitySample) {
        if let Some(previous) = self.last {
            if sample.timestamp_ms <= previous.timestamp_ms {
                return;
            }
            let dt = (sample.timestamp_ms - previous.timestamp_ms) as f64;
            let delta = sample.position - previous.position;
            let speed = delta.abs() / dt * self.config.frame_ms.max(1) as f64;

            self.last_delta = delta;
            if self.window.len() == self.config.window.max(1) {
                self.window.pop_front();
            }
            self.window.push_back(speed);
        }
        self.last = Some(sample);
    }

    /// Mean speed over the window; zero before two samples have been seen.
    pub fn mean_velocity(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    pub fn direction(&self) -> ScrollDirection {
        if self.last_delta.abs() < self.config.idle_delta {
            ScrollDirection::Idle
        } else if self.last_delta > 0.0 {
            ScrollDirection::Forward
        } else {
            ScrollDirection::Backward
        }
    }

    pub fn classify(&self) -> PrefetchHint {
        let direction = self.direction();
        let velocity = self.mean_velocity();
        let distances = &self.config.distances;

        let (level, prefetch_distance) = if direction == ScrollDirection::Idle {
            (PrefetchLevel::Idle, distances.low)
        } else if velocity <= self.config.low_max {
            (PrefetchLevel::Low, distances.low)
        } else if velocity <= self.config.medium_max {
            (PrefetchLevel::Medium, distances.medium)
        } else if velocity <= self.config.high_max {
            (PrefetchLevel::High, distances.high)
        } else {
            (PrefetchLevel::UltraHigh, distances.ultra)
        };

        PrefetchHint {
            direction,
            level,
            prefetch_distance,
            velocity,
        }
    }

    /// Forget all history, e.g. when the user switches to another feed.
    pub fn reset(&mut self) {
        self.window.clear();
        self.last = None;
        self.last_delta = 0.0;
    }
}
