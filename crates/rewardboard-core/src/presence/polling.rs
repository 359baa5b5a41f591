use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{PresenceStrategy, Shutdown};
use crate::api::{paths, ApiClient, ApiError};
use crate::models::{PresenceSnapshot, PresenceState, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingSettings {
    /// Wait after the connect call before the first snapshot
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            interval: Duration::from_secs(10),
        }
    }
}

/// Announce once, then fetch the full online set on a fixed cadence.
pub struct PollingStrategy {
    client: ApiClient,
    settings: PollingSettings,
}

impl PollingStrategy {
    pub fn new(client: ApiClient, settings: PollingSettings) -> Self {
        Self { client, settings }
    }

    async fn poll_once(&self, state: &watch::Sender<PresenceState>) {
        match fetch_snapshot(&self.client).await {
            Ok(online) => {
                debug!(count = online.len(), "Presence snapshot received");
                state.send_modify(|s| s.apply_snapshot(online));
            }
            Err(e) => {
                warn!(error = %e, "Presence poll failed");
                state.send_modify(|s| s.mark_failed(e.display_message()));
            }
        }
    }
}

/// `GET /api/presence` as a set, in either response shape.
pub async fn fetch_snapshot(client: &ApiClient) -> Result<BTreeSet<UserId>, ApiError> {
    let snapshot: PresenceSnapshot = client.get_json(paths::PRESENCE).await?;
    Ok(snapshot.into_set())
}

#[async_trait]
impl PresenceStrategy for PollingStrategy {
    fn mode(&self) -> &'static str {
        "polling"
    }

    async fn run(&self, state: watch::Sender<PresenceState>, shutdown: Shutdown) {
        if self.client.store().get().is_none() {
            debug!("No credentials, presence polling not started");
            return;
        }

        tokio::select! {
            _ = shutdown.wait() => return,
            result = self.client.post_empty(paths::PRESENCE_CONNECT) => {
                if let Err(e) = result {
                    warn!(error = %e, "Presence connect failed, polling anyway");
                }
            }
        }

        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            "Presence polling started"
        );
        // interval_at panics on a zero period
        let period = self.settings.interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + self.settings.initial_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = self.poll_once(&state) => {}
            }
        }
        debug!("Presence polling stopped");
    }
}
