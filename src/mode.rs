//! Normal vs. constrained operation.
//!
//! Constrained mode is entered while a foreground-critical activity (video
//! playback) needs the device's memory and bandwidth. Entering it:
//! 1. refuses new background prefetches and cancels the running ones
//! 2. drops every cache entry in a background-eligible namespace
//! 3. shortens the TTL given to newly cached feeds
//!
//! Leaving it restores the normal TTL. Nothing is re-fetched automatically.
//!
//! The controller knows nothing about feed queries; it works on namespace
//! patterns and cancellation tokens only.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::key::KeyPattern;
use crate::cache::store::Evictable;
use crate::config::{CacheConfig, ModeConfig};

/// Process-wide operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    Constrained,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Normal => write!(f, "normal"),
            Mode::Constrained => write!(f, "constrained"),
        }
    }
}

struct PolicyState {
    mode: watch::Sender<Mode>,
    normal_ttl: Duration,
    constrained_ttl: Duration,
    /// Parent of every background task's token. Replaced on each entry into
    /// constrained mode so later tasks get a live token.
    background: Mutex<CancellationToken>,
}

/// Cheap, cloneable view of the current mode, handed to orchestrators.
#[derive(Clone)]
pub struct ModePolicy {
    inner: Arc<PolicyState>,
}

impl ModePolicy {
    pub fn new(normal_ttl: Duration, constrained_ttl: Duration) -> Self {
        let (mode, _) = watch::channel(Mode::Normal);
        Self {
            inner: Arc::new(PolicyState {
                mode,
                normal_ttl,
                constrained_ttl,
                background: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.normal_ttl(), config.constrained_ttl())
    }

    pub fn mode(&self) -> Mode {
        *self.inner.mode.borrow()
    }

    pub fn is_constrained(&self) -> bool {
        self.mode() == Mode::Constrained
    }

    /// TTL for feed entries created or refreshed now.
    pub fn feed_ttl(&self) -> Duration {
        match self.mode() {
            Mode::Normal => self.inner.normal_ttl,
            Mode::Constrained => self.inner.constrained_ttl,
        }
    }

    /// Token for a new background task; cancelled on the next entry into
    /// constrained mode.
    pub fn background_token(&self) -> CancellationToken {
        self.inner.background.lock().child_token()
    }

    /// Watch mode changes.
    pub fn subscribe(&self) -> watch::Receiver<Mode> {
        self.inner.mode.subscribe()
    }

    fn set_mode(&self, mode: Mode) -> Mode {
        let mut previous = mode;
        self.inner.mode.send_if_modified(|current| {
            previous = *current;
            if *current == mode {
                return false;
            }
            *current = mode;
            true
        });
        previous
    }

    fn cancel_background(&self) {
        let old = std::mem::replace(&mut *self.inner.background.lock(), CancellationToken::new());
        old.cancel();
    }
}

impl std::fmt::Debug for ModePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModePolicy")
            .field("mode", &self.mode())
            .field("normal_ttl", &self.inner.normal_ttl)
            .field("constrained_ttl", &self.inner.constrained_ttl)
            .finish()
    }
}

/// What a mode change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub from: Mode,
    pub to: Mode,
    /// Cache entries dropped across all registered stores.
    pub evicted: usize,
}

impl ModeTransition {
    pub fn is_change(&self) -> bool {
        self.from != self.to
    }
}

/// Switches the engine between normal and constrained mode.
pub struct ModeController {
    policy: ModePolicy,
    background: Option<KeyPattern>,
    stores: Mutex<Vec<Arc<dyn Evictable>>>,
}

impl ModeController {
    /// `background_namespaces` lists the namespaces whose entries are dropped
    /// on entry into constrained mode.
    pub fn new<S: AsRef<str>>(policy: ModePolicy, background_namespaces: &[S]) -> Self {
        Self {
            policy,
            background: KeyPattern::namespaces(background_namespaces),
            stores: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(policy: ModePolicy, config: &ModeConfig) -> Self {
        Self::new(policy, config.background_namespaces.as_slice())
    }

    pub fn policy(&self) -> &ModePolicy {
        &self.policy
    }

    pub fn mode(&self) -> Mode {
        self.policy.mode()
    }

    /// Put a store under this controller's eviction authority.
    pub fn register(&self, store: Arc<dyn Evictable>) {
        debug!(store = store.label(), "Store registered with mode controller");
        self.stores.lock().push(store);
    }

    pub fn enter_constrained(&self) -> ModeTransition {
        let from = self.policy.set_mode(Mode::Constrained);
        if from == Mode::Constrained {
            return ModeTransition {
                from,
                to: Mode::Constrained,
                evicted: 0,
            };
        }

        // Mode is flipped first so no new background task starts between the
        // cancellation and the eviction.
        self.policy.cancel_background();

        let mut evicted = 0;
        if let Some(pattern) = &self.background {
            let stores = self.stores.lock().clone();
            for store in stores {
                let n = store.evict_matching(pattern);
                debug!(store = store.label(), evicted = n, "Background entries evicted");
                evicted += n;
            }
        }

        info!(evicted, ttl_secs = self.policy.feed_ttl().as_secs(), "Entered constrained mode");
        ModeTransition {
            from,
            to: Mode::Constrained,
            evicted,
        }
    }

    pub fn exit_constrained(&self) -> ModeTransition {
        let from = self.policy.set_mode(Mode::Normal);
        if from == Mode::Constrained {
            info!(ttl_secs = self.policy.feed_ttl().as_secs(), "Returned to normal mode");
        }
        ModeTransition {
            from,
            to: Mode::Normal,
            evicted: 0,
        }
    }

    pub fn apply(&self, mode: Mode) -> ModeTransition {
        match mode {
            Mode::Normal => self.exit_constrained(),
            Mode::Constrained => self.enter_constrained(),
        }
    }

    /// Apply every value of an injected mode signal until it ends.
    pub async fn follow<S>(&self, signal: S)
    where
        S: Stream<Item = Mode>,
    {
        tokio::pin!(signal);
        while let Some(mode) = signal.next().await {
            self.apply(mode);
        }
        debug!("Mode signal ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::TtlStore;

    fn policy() -> ModePolicy {
        ModePolicy::new(Duration::from_secs(600), Duration::from_secs(120))
    }

    #[test]
    fn test_ttl_follows_mode() {
        let controller = ModeController::new(policy(), &["movies"]);
        assert_eq!(controller.policy().feed_ttl(), Duration::from_secs(600));

        let t = controller.enter_constrained();
        assert!(t.is_change());
        assert_eq!(controller.policy().feed_ttl(), Duration::from_secs(120));

        let t = controller.exit_constrained();
        assert_eq!(t.from, Mode::Constrained);
        assert_eq!(controller.policy().feed_ttl(), Duration::from_secs(600));
    }

    #[test]
    fn test_entry_cancels_only_existing_background_tokens() {
        let controller = ModeController::new(policy(), &["movies"]);
        let before = controller.policy().background_token();

        controller.enter_constrained();
        assert!(before.is_cancelled());

        let after = controller.policy().background_token();
        assert!(!after.is_cancelled());
    }

    #[test]
    fn test_repeated_entry_is_noop() {
        let store = Arc::new(TtlStore::new("feeds"));
        let controller = ModeController::new(policy(), &["movies"]);
        controller.register(store.clone());

        store.set("movies:id:asc:20:", 1u32, Duration::from_secs(60));
        assert_eq!(controller.enter_constrained().evicted, 1);

        store.set("movies:id:asc:20:", 1u32, Duration::from_secs(60));
        let again = controller.enter_constrained();
        assert!(!again.is_change());
        assert_eq!(again.evicted, 0);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_follow_signal() {
        let store = Arc::new(TtlStore::new("pages"));
        store.set("shows:a", 1u32, Duration::from_secs(60));
        store.set("continue-watching:a", 2u32, Duration::from_secs(60));

        let controller = ModeController::new(policy(), &["shows"]);
        controller.register(store.clone());
        let changes = controller.policy().subscribe();

        controller
            .follow(tokio_stream::iter(vec![Mode::Constrained, Mode::Constrained]))
            .await;

        assert_eq!(controller.mode(), Mode::Constrained);
        assert!(changes.has_changed().unwrap());
        assert_eq!(store.get("shows:a"), None);
        assert_eq!(store.get("continue-watching:a"), Some(2));
    }
}
