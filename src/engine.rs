//! Top-level wiring: one mode policy, one mode controller, and any number of
//! feed orchestrators sharing them.
//!
//! The engine owns the periodic sweepers for every store it hands out and
//! stops them on [`PrefetchEngine::shutdown`] or drop.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::key::{FeedQuery, SortOrder};
use crate::cache::store::spawn_sweeper;
use crate::config::Config;
use crate::fetch::orchestrator::{FeedOrchestrator, OrchestratorOptions};
use crate::fetch::page::PageFetcher;
use crate::mode::{Mode, ModeController, ModePolicy, ModeTransition};
use crate::prefetch::debounce::Debouncer;
use crate::prefetch::velocity::VelocityTracker;

pub struct PrefetchEngine {
    config: Arc<Config>,
    controller: Arc<ModeController>,
    shutdown: CancellationToken,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl PrefetchEngine {
    pub fn new(config: Config) -> Self {
        let policy = ModePolicy::from_config(&config.cache);
        let controller = ModeController::from_config(policy, &config.mode);

        info!(
            normal_ttl_secs = config.cache.normal_ttl_secs,
            constrained_ttl_secs = config.cache.constrained_ttl_secs,
            retention_secs = config.cache.retention_secs,
            page_size = config.prefetch.page_size,
            "Prefetch engine initialized"
        );

        Self {
            config: Arc::new(config),
            controller: Arc::new(controller),
            shutdown: CancellationToken::new(),
            sweepers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn controller(&self) -> &Arc<ModeController> {
        &self.controller
    }

    pub fn policy(&self) -> &ModePolicy {
        self.controller.policy()
    }

    pub fn mode(&self) -> Mode {
        self.controller.mode()
    }

    pub fn set_mode(&self, mode: Mode) -> ModeTransition {
        self.controller.apply(mode)
    }

    /// Track a mode published by the host application until its sender is
    /// dropped. The current value is applied first.
    pub async fn follow_mode(&self, modes: watch::Receiver<Mode>) {
        self.controller.follow(WatchStream::new(modes)).await
    }

    /// Create an orchestrator for one item type.
    ///
    /// Its stores are registered with the mode controller and, when called
    /// inside a Tokio runtime, swept every `cache.sweep_interval_secs`.
    pub fn feed<T>(&self, fetcher: impl PageFetcher<T> + 'static) -> FeedOrchestrator<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let orchestrator = FeedOrchestrator::new(
            fetcher,
            self.policy().clone(),
            OrchestratorOptions::from_config(&self.config),
        );
        orchestrator.attach(&self.controller);

        if Handle::try_current().is_ok() {
            let every = self.config.cache.sweep_interval();
            let mut sweepers = self.sweepers.lock();
            for store in orchestrator.stores() {
                sweepers.push(spawn_sweeper(&store, every, self.shutdown.child_token()));
            }
        } else {
            debug!("No runtime; stores will only expire lazily");
        }

        orchestrator
    }

    /// A query in `namespace` with the configured page size.
    pub fn query(&self, namespace: &str, sort_key: &str, sort_order: SortOrder) -> FeedQuery {
        FeedQuery::new(namespace, sort_key, sort_order, self.config.prefetch.page_size)
    }

    pub fn velocity_tracker(&self) -> VelocityTracker {
        VelocityTracker::new(self.config.velocity.clone())
    }

    pub fn debouncer(&self) -> Debouncer {
        Debouncer::new(self.config.prefetch.debounce())
    }

    /// Number of sweeper tasks still running.
    pub fn active_sweepers(&self) -> usize {
        self.sweepers.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Stop all sweepers and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.sweepers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Prefetch engine stopped");
    }
}

impl Drop for PrefetchEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
