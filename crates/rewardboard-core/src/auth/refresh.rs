//! Single-flight access token renewal.
//!
//! At most one renewal request is in flight at any time. Every caller that
//! asks for a renewal while one is running awaits the same shared future and
//! observes the same token or the same failure. The slot is emptied when the
//! renewal settles, so the next expiry starts a fresh attempt. The renewal
//! runs as its own task, so it settles even when every caller gives up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::jwt;
use super::signals::{AuthSignal, AuthSignals};
use super::store::CredentialStore;
use crate::api::error::ErrorBody;
use crate::api::{paths, ApiRequest, ApiResponse, Transport};
use crate::models::UserProfile;
use crate::utils::redact_token;

/// Code the backend sends when the request carried no refresh cookie
pub const NO_RENEWAL_CREDENTIAL_CODE: &str = "NO_REFRESH_COOKIE";

/// Terminal renewal failure. Callers must treat the user as logged out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalError {
    #[error("No renewal credential present")]
    NoRenewalCredential,

    #[error("Renewal rejected with status {status}: {message}")]
    Rejected {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Renewal request failed: {0}")]
    Transport(String),

    #[error("Invalid renewal response: {0}")]
    InvalidResponse(String),

    #[error("No profile available for the renewed token")]
    MissingProfile,

    #[error("Failed to store renewed token: {0}")]
    Store(String),

    /// The session was cleared or replaced while the renewal was in flight
    #[error("Session changed during renewal")]
    Superseded,
}

impl RenewalError {
    fn from_response(response: &ApiResponse) -> Self {
        let body = ErrorBody::parse(&response.body);
        if body.code() == Some(NO_RENEWAL_CREDENTIAL_CODE) {
            return RenewalError::NoRenewalCredential;
        }
        RenewalError::Rejected {
            status: response.status,
            code: body.code().map(str::to_string),
            message: body
                .message
                .clone()
                .unwrap_or_else(|| crate::api::ApiError::truncate_body(&response.body)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSettings {
    /// How long after start-up a missing refresh cookie is blamed on the page still loading
    pub startup_window: Duration,
    /// Pause before the single start-up retry
    pub startup_retry_delay: Duration,
    /// Pause between a terminal failure and the forced logout signal
    pub forced_logout_delay: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            startup_window: Duration::from_millis(2000),
            startup_retry_delay: Duration::from_millis(500),
            forced_logout_delay: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "expiresIn", default)]
    expires_in: Option<i64>,
    // Some deployments echo the identity alongside the token
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    authorities: Option<Vec<String>>,
}

impl RefreshResponse {
    fn profile(&self) -> Option<UserProfile> {
        Some(UserProfile {
            id: self.id?,
            username: self.username.clone().unwrap_or_default(),
            email: self.email.clone()?,
            role: self.role.clone().unwrap_or_default(),
            authorities: self.authorities.clone().unwrap_or_default(),
        })
    }
}

type SharedRenewal = Shared<BoxFuture<'static, Result<String, RenewalError>>>;

/// Clone is cheap; all clones share the in-flight slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    signals: AuthSignals,
    settings: RefreshSettings,
    started_at: Instant,
    cookies_ready: AtomicBool,
    in_flight: Mutex<Option<SharedRenewal>>,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        signals: AuthSignals,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                signals,
                settings,
                started_at: Instant::now(),
                cookies_ready: AtomicBool::new(false),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Renew the access token, joining the in-flight renewal if there is one.
    pub async fn renew(&self) -> Result<String, RenewalError> {
        let renewal = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Reusing in-flight token renewal");
                    existing.clone()
                }
                None => {
                    debug!("Starting new token renewal");
                    let generation = self.inner.store.generation();
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(async move {
                        let result = inner.run(generation).await;
                        inner.settle();
                        result
                    });
                    let inner = Arc::clone(&self.inner);
                    let renewal = task
                        .map(move |joined| {
                            joined.unwrap_or_else(|e| {
                                // A panicked task never reached settle()
                                inner.settle();
                                Err(RenewalError::Transport(format!("Renewal task failed: {}", e)))
                            })
                        })
                        .boxed()
                        .shared();
                    *slot = Some(renewal.clone());
                    renewal
                }
            }
        };
        renewal.await
    }

    /// Whether a renewal is currently running
    pub fn is_renewing(&self) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Declare the cookie jar hydrated. After this a missing refresh cookie is never retried.
    pub fn mark_cookies_ready(&self) {
        self.inner.cookies_ready.store(true, Ordering::SeqCst);
    }
}

struct RenewalGrant {
    access_token: String,
    profile: Option<UserProfile>,
}

impl Inner {
    async fn run(&self, generation: u64) -> Result<String, RenewalError> {
        let result = match self.request_renewal().await {
            Err(RenewalError::NoRenewalCredential) if self.in_startup_window() => {
                info!(
                    delay_ms = self.settings.startup_retry_delay.as_millis() as u64,
                    "No refresh cookie right after start-up, retrying once"
                );
                tokio::time::sleep(self.settings.startup_retry_delay).await;
                self.request_renewal().await
            }
            other => other,
        };

        match result.and_then(|grant| self.store_grant(grant, generation)) {
            Ok(token) => {
                info!(token = %redact_token(&token), "Access token renewed");
                Ok(token)
            }
            Err(RenewalError::Superseded) => {
                info!("Session changed during renewal, renewed token discarded");
                Err(RenewalError::Superseded)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn settle(&self) {
        *self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn in_startup_window(&self) -> bool {
        !self.cookies_ready.load(Ordering::SeqCst)
            && self.started_at.elapsed() < self.settings.startup_window
    }

    async fn request_renewal(&self) -> Result<RenewalGrant, RenewalError> {
        let request = ApiRequest::post(paths::REFRESH);
        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| RenewalError::Transport(e.to_string()))?;

        if !response.is_success() {
            let error = RenewalError::from_response(&response);
            warn!(status = response.status, error = %error, "Refresh request rejected");
            return Err(error);
        }

        let body: RefreshResponse = response
            .json()
            .map_err(|e| RenewalError::InvalidResponse(e.to_string()))?;
        debug!(expires_in = ?body.expires_in, "Refresh request succeeded");
        Ok(RenewalGrant {
            profile: body.profile(),
            access_token: body.access_token,
        })
    }

    /// Write the new token, picking the profile from the response, the store, then the token claims.
    ///
    /// Nothing is written when the session was stored or cleared after `generation` was taken.
    fn store_grant(&self, grant: RenewalGrant, generation: u64) -> Result<String, RenewalError> {
        if self.store.generation() != generation {
            return Err(RenewalError::Superseded);
        }
        let profile = match grant.profile {
            Some(profile) => Some(profile),
            None if self.store.profile().is_some() => None,
            None => Some(
                jwt::decode_claims(&grant.access_token)
                    .and_then(|claims| claims.profile())
                    .ok_or(RenewalError::MissingProfile)?,
            ),
        };

        match self
            .store
            .replace_token_if(generation, &grant.access_token, profile)
        {
            Ok(Some(record)) => Ok(record.access_token),
            Ok(None) => Err(RenewalError::Superseded),
            Err(e) => Err(RenewalError::Store(e.to_string())),
        }
    }

    /// Clear the session and schedule the forced logout.
    fn fail(&self, error: RenewalError) -> RenewalError {
        error!(error = %error, "Token renewal failed, logging out");
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear credentials after renewal failure");
        }

        let signals = self.signals.clone();
        let delay = self.settings.forced_logout_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            signals.emit(AuthSignal::ForceLogout);
        });
        error
    }
}
