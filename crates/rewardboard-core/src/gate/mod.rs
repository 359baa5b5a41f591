//! Per-route authentication gate.
//!
//! `AuthGate::mount` starts a small state machine for one route:
//!
//! ```text
//!   public route ──────────────────────────────► Authenticated
//!
//!   protected:  Checking ──(initial delay)──► read store
//!                                               │
//!                      ┌─── record present ─────┴──── absent/malformed ───┐
//!                      ▼                                                   ▼
//!                Authenticated ◄──── re-check on signal ────►  Unauthenticated
//!                                                               (redirect after delay)
//! ```
//!
//! Storage changes, login and logout signals re-run the check without a
//! remount. Dropping the `GateHandle` unmounts the gate and cancels its timers.

pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

pub use routes::RoutePolicy;

use crate::auth::{AuthSignal, AuthSignals, CredentialStore, PROFILE_KEY, TOKEN_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum GateState {
    Checking,
    Authenticated,
    Unauthenticated,
}

/// What the guarded screen should draw for a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateView {
    /// Neutral loading affordance
    Loading,
    /// Render nothing, so protected content never flashes
    Nothing,
    /// Render the guarded subtree
    Content,
}

impl GateState {
    pub fn view(&self) -> GateView {
        match self {
            GateState::Checking => GateView::Loading,
            GateState::Unauthenticated => GateView::Nothing,
            GateState::Authenticated => GateView::Content,
        }
    }
}

/// Performs the actual navigation when the gate gives up on a route.
pub trait Navigator: Send + Sync {
    fn redirect(&self, to: &str, from: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSettings {
    /// Wait before the first store read, so a just-finished login write can land
    pub initial_delay: Duration,
    /// Wait between turning `Unauthenticated` and redirecting, so the state is observable
    pub redirect_delay: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            redirect_delay: Duration::from_millis(3000),
        }
    }
}

/// Factory for per-route gates. Clone is cheap.
#[derive(Clone)]
pub struct AuthGate {
    store: CredentialStore,
    signals: AuthSignals,
    policy: Arc<RoutePolicy>,
    navigator: Arc<dyn Navigator>,
    settings: GateSettings,
}

impl AuthGate {
    pub fn new(
        store: CredentialStore,
        signals: AuthSignals,
        policy: RoutePolicy,
        navigator: Arc<dyn Navigator>,
        settings: GateSettings,
    ) -> Self {
        Self {
            store,
            signals,
            policy: Arc::new(policy),
            navigator,
            settings,
        }
    }

    pub fn policy(&self) -> &RoutePolicy {
        &self.policy
    }

    /// Start gating `route`. Must be called inside a tokio runtime.
    pub fn mount(&self, route: &str) -> GateHandle {
        if self.policy.is_public(route) {
            debug!(route = route, "Public route, gate does not apply");
            let (tx, rx) = watch::channel(GateState::Authenticated);
            return GateHandle {
                state: rx,
                task: None,
                _public: Some(tx),
            };
        }

        let (tx, rx) = watch::channel(GateState::Checking);
        // Subscribe before spawning so no signal between mount and first poll is lost
        let signals = self.signals.subscribe();
        let task = GateTask {
            route: route.to_string(),
            store: self.store.clone(),
            navigator: Arc::clone(&self.navigator),
            login_route: self.policy.login_route.clone(),
            settings: self.settings,
            state: tx,
        };
        GateHandle {
            state: rx,
            task: Some(tokio::spawn(task.run(signals))),
            _public: None,
        }
    }
}

/// A mounted gate. Dropping it unmounts.
pub struct GateHandle {
    state: watch::Receiver<GateState>,
    task: Option<JoinHandle<()>>,
    // Keeps the state channel open for public routes, which have no task
    _public: Option<watch::Sender<GateState>>,
}

impl GateHandle {
    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    pub fn view(&self) -> GateView {
        self.state().view()
    }

    /// Wait for the next state change. `None` once the gate has stopped.
    pub async fn changed(&mut self) -> Option<GateState> {
        self.state.changed().await.ok()?;
        Some(*self.state.borrow_and_update())
    }

    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.state.clone()
    }

    pub fn unmount(self) {}
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct GateTask {
    route: String,
    store: CredentialStore,
    navigator: Arc<dyn Navigator>,
    login_route: String,
    settings: GateSettings,
    state: watch::Sender<GateState>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl GateTask {
    async fn run(self, mut signals: broadcast::Receiver<AuthSignal>) {
        let mut initial_check = Some(Instant::now() + self.settings.initial_delay);
        let mut redirect_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = sleep_until_opt(initial_check) => {
                    initial_check = None;
                    self.check(&mut redirect_at);
                }
                _ = sleep_until_opt(redirect_at) => {
                    redirect_at = None;
                    self.redirect();
                }
                signal = signals.recv() => match signal {
                    Ok(AuthSignal::ForceLogout) => {
                        initial_check = None;
                        redirect_at = None;
                        self.set_state(GateState::Unauthenticated);
                        self.redirect();
                    }
                    Ok(signal) if Self::triggers_check(&signal) => {
                        debug!(route = %self.route, signal = ?signal, "Re-checking authentication");
                        initial_check = None;
                        self.check(&mut redirect_at);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        debug!(route = %self.route, missed = missed, "Auth signals lagged, re-checking");
                        initial_check = None;
                        self.check(&mut redirect_at);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    fn triggers_check(signal: &AuthSignal) -> bool {
        match signal {
            AuthSignal::StorageChanged { key } => key == TOKEN_KEY || key == PROFILE_KEY,
            AuthSignal::LoginSucceeded | AuthSignal::LoggedOut => true,
            AuthSignal::ForceLogout => false,
        }
    }

    fn check(&self, redirect_at: &mut Option<Instant>) {
        match self.store.get() {
            Some(record) => {
                debug!(route = %self.route, email = %record.profile.email, "Auth check passed");
                *redirect_at = None;
                self.set_state(GateState::Authenticated);
            }
            None => {
                self.set_state(GateState::Unauthenticated);
                if redirect_at.is_none() {
                    info!(
                        route = %self.route,
                        delay_ms = self.settings.redirect_delay.as_millis() as u64,
                        "Auth check failed, will redirect to login"
                    );
                    *redirect_at = Some(Instant::now() + self.settings.redirect_delay);
                }
            }
        }
    }

    fn set_state(&self, next: GateState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn redirect(&self) {
        info!(route = %self.route, to = %self.login_route, "Redirecting to login");
        self.navigator.redirect(&self.login_route, &self.route);
    }
}
