use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::signals::{AuthSignal, AuthSignals};
use super::store::{CredentialRecord, CredentialStore};
use crate::api::{paths, ApiClient, ApiError};
use crate::models::UserProfile;

#[derive(Debug, Serialize)]
struct LoginPayload<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    message: Option<String>,
    token: String,
    id: i64,
    username: String,
    email: String,
    role: String,
    #[serde(default)]
    authorities: Vec<String>,
    #[serde(rename = "expiresIn", default)]
    expires_in: Option<i64>,
}

/// Identity as reported by `GET /api/auth/me`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MeResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
}

/// Login, logout and identity lookups on top of the request pipeline.
#[derive(Clone)]
pub struct SessionManager {
    client: ApiClient,
    store: CredentialStore,
    signals: AuthSignals,
}

impl SessionManager {
    pub fn new(client: ApiClient, store: CredentialStore, signals: AuthSignals) -> Self {
        Self {
            client,
            store,
            signals,
        }
    }

    /// Authenticate and store the issued record.
    ///
    /// The refresh cookie arrives out of band and stays in the transport's cookie jar.
    pub async fn login(&self, email: &str, password: &str) -> Result<CredentialRecord, ApiError> {
        let payload = LoginPayload { email, password };
        let response: LoginResponse = self.client.post_json(paths::LOGIN, &payload).await?;

        let record = CredentialRecord::new(
            response.token,
            UserProfile {
                id: response.id,
                username: response.username,
                email: response.email,
                role: response.role,
                authorities: response.authorities,
            },
        );
        self.store
            .set(&record)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to store credentials: {:#}", e)))?;

        info!(
            email = %record.profile.email,
            expires_in = ?response.expires_in,
            server_message = ?response.message,
            "Login succeeded"
        );
        self.signals.emit(AuthSignal::LoginSucceeded);
        Ok(record)
    }

    /// Invalidate the refresh cookie server-side and clear local credentials.
    ///
    /// The local clear happens even when the backend call fails.
    pub async fn logout(&self) -> anyhow::Result<()> {
        if let Err(e) = self.client.post_empty(paths::LOGOUT).await {
            warn!(error = %e, "Logout request failed, clearing local session anyway");
        }
        self.store.clear()?;
        info!("Logged out");
        self.signals.emit(AuthSignal::LoggedOut);
        Ok(())
    }

    /// Renew the access token now, outside of any failing request
    pub async fn refresh(&self) -> Result<String, ApiError> {
        Ok(self.client.refresher().renew().await?)
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.store.profile()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    pub async fn fetch_me(&self) -> Result<MeResponse, ApiError> {
        self.client.get_json(paths::ME).await
    }
}
