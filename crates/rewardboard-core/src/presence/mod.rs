//! "Who is online" tracking.
//!
//! A `PresenceTracker` runs one `PresenceStrategy` in a background task and
//! publishes every change through a `watch` channel:
//!
//! - `PollingStrategy`: announce once, then fetch the full set periodically
//! - `SubscriptionStrategy`: STOMP over WebSocket with reconnect backoff
//!
//! Presence failures are recorded on the state and logged; they never touch
//! the session.

pub mod backoff;
pub mod polling;
pub mod stomp;
pub mod subscription;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use backoff::ExponentialBackoff;
pub use polling::{PollingSettings, PollingStrategy};
pub use subscription::{SubscriptionSettings, SubscriptionStrategy};

use crate::api::ApiClient;
use crate::models::PresenceState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceMode {
    Polling(PollingSettings),
    Subscription(SubscriptionSettings),
}

/// One way of keeping `PresenceState` current.
#[async_trait]
pub trait PresenceStrategy: Send + Sync {
    fn mode(&self) -> &'static str;

    /// Run until `shutdown` fires. Must not schedule work after it returns.
    async fn run(&self, state: watch::Sender<PresenceState>, shutdown: Shutdown);
}

/// Manually-closed flag plus a wakeup for whoever is waiting on it.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    closed: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn trigger(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger` has been called, including before this call.
    pub async fn wait(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

pub struct PresenceTracker {
    state: watch::Receiver<PresenceState>,
    shutdown: Shutdown,
    task: Option<JoinHandle<()>>,
    mode: &'static str,
}

impl PresenceTracker {
    /// Start tracking in the background. Must be called inside a tokio runtime.
    pub fn start(mode: PresenceMode, client: ApiClient) -> Self {
        let strategy: Box<dyn PresenceStrategy> = match mode {
            PresenceMode::Polling(settings) => Box::new(PollingStrategy::new(client, settings)),
            PresenceMode::Subscription(settings) => {
                Box::new(SubscriptionStrategy::new(client, settings))
            }
        };
        Self::with_strategy(strategy)
    }

    pub fn with_strategy(strategy: Box<dyn PresenceStrategy>) -> Self {
        let (tx, rx) = watch::channel(PresenceState::default());
        let shutdown = Shutdown::default();
        let mode = strategy.mode();
        debug!(mode = mode, "Starting presence tracker");

        let task_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            strategy.run(tx, task_shutdown).await;
        });

        Self {
            state: rx,
            shutdown,
            task: Some(task),
            mode,
        }
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    /// Change feed for UI widgets. The current value is available immediately.
    pub fn subscribe(&self) -> watch::Receiver<PresenceState> {
        self.state.clone()
    }

    pub fn snapshot(&self) -> PresenceState {
        self.state.borrow().clone()
    }

    /// Stop and wait for the strategy to finish its teardown.
    pub async fn stop(mut self) {
        self.shutdown.trigger();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(mode = self.mode, "Presence task panicked");
                }
            }
        }
        debug!(mode = self.mode, "Presence tracker stopped");
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.shutdown.trigger();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
