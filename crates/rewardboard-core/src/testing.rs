//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::api::{ApiClient, ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::{
    AuthSignals, CredentialStore, KeyValueStore, MemoryStore, RefreshCoordinator, RefreshSettings,
    SessionManager, TOKEN_KEY,
};
use crate::gate::Navigator;
use crate::models::UserProfile;

type Script = dyn Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync;

/// Transport that answers from a closure and records every request.
pub struct ScriptedTransport {
    script: Box<Script>,
    delay: Option<Duration>,
    log: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            delay: None,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Every response takes this long, so concurrent callers overlap
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.log.lock().expect("request log").clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.log
            .lock()
            .expect("request log")
            .iter()
            .filter(|r| r.path == path)
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.log.lock().expect("request log").push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.script)(request)
    }
}

pub fn json_response(status: u16, body: &str) -> ApiResponse {
    ApiResponse::new(status, body)
}

pub fn expired_response() -> ApiResponse {
    json_response(401, r#"{"message":"Token expired","errorCode":"TOKEN_EXPIRED"}"#)
}

pub fn profile(email: &str) -> UserProfile {
    UserProfile {
        id: 3,
        username: "admin".to_string(),
        email: email.to_string(),
        role: "ADMIN".to_string(),
        authorities: vec!["CHALLENGE_CREATE".to_string()],
    }
}

/// Unsigned token with the given JSON payload
pub fn make_jwt(payload: &str) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(payload)
    )
}

/// Memory backend whose token writes always fail
#[derive(Default)]
pub struct FailingTokenStore {
    pub inner: MemoryStore,
}

impl KeyValueStore for FailingTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if key == TOKEN_KEY {
            return Err(anyhow!("disk full"));
        }
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    redirects: Mutex<Vec<(String, String)>>,
}

impl RecordingNavigator {
    /// `(to, from)` pairs in order
    pub fn redirects(&self) -> Vec<(String, String)> {
        self.redirects.lock().expect("redirects").clone()
    }
}

impl Navigator for RecordingNavigator {
    fn redirect(&self, to: &str, from: &str) {
        self.redirects
            .lock()
            .expect("redirects")
            .push((to.to_string(), from.to_string()));
    }
}

pub struct Harness {
    pub store: CredentialStore,
    pub signals: AuthSignals,
    pub refresher: RefreshCoordinator,
    pub client: ApiClient,
    pub session: SessionManager,
}

/// Full pipeline over an in-memory store and the given transport
pub fn harness(transport: Arc<ScriptedTransport>, settings: RefreshSettings) -> Harness {
    let signals = AuthSignals::new();
    let store = CredentialStore::new(Arc::new(MemoryStore::new()), signals.clone());
    let refresher = RefreshCoordinator::new(transport.clone(), store.clone(), signals.clone(), settings);
    let client = ApiClient::new(transport, store.clone(), refresher.clone());
    let session = SessionManager::new(client.clone(), store.clone(), signals.clone());
    Harness {
        store,
        signals,
        refresher,
        client,
        session,
    }
}
