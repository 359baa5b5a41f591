//! Request pipeline for the dashboard backend.
//!
//! `ApiClient` wraps a `Transport` with the two interceptors every call goes
//! through: attach the stored bearer token before sending, and after an
//! expired-token response renew once through the `RefreshCoordinator` and
//! resend. Callers only ever see the final outcome.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{paths, ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::{CredentialStore, RefreshCoordinator};

/// Clone is cheap - every field is a shared handle.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    refresher: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        refresher: RefreshCoordinator,
    ) -> Self {
        Self {
            transport,
            store,
            refresher,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    /// Send a request through the pipeline.
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        request.bearer = self.store.token();

        let response = self.transport.send(&request).await?;
        let error = match Self::check_response(response) {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        if !Self::should_renew(&request, &error) {
            debug!(path = %request.path, error = %error, "Request failed");
            return Err(error);
        }

        debug!(path = %request.path, "Token expired, attempting refresh");
        request.retried = true;
        match self.refresher.renew().await {
            Ok(token) => {
                debug!(path = %request.path, "Token refresh successful, retrying request");
                request.bearer = Some(token);
                let response = self.transport.send(&request).await?;
                Self::check_response(response)
            }
            Err(renewal_error) => {
                warn!(path = %request.path, error = %renewal_error, "Token refresh failed");
                Err(error)
            }
        }
    }

    fn should_renew(request: &ApiRequest, error: &ApiError) -> bool {
        error.is_token_expired() && !request.retried && !paths::is_renewal(&request.path)
    }

    /// Check if response is successful, returning the classified error if not.
    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).with_json(body)?).await?.json()
    }

    /// POST without a body, ignoring whatever the server answers on success
    pub async fn post_empty(&self, path: &str) -> Result<(), ApiError> {
        self.send(ApiRequest::post(path)).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::auth::{CredentialRecord, RefreshSettings};
    use crate::testing::{expired_response, harness, json_response, profile, ScriptedTransport};

    #[tokio::test(start_paused = true)]
    async fn test_attaches_bearer_token() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(json_response(200, r#"{"ok":true}"#))));
        let h = harness(transport.clone(), RefreshSettings::default());
        h.store.set(&CredentialRecord::new("T1", profile("a@b.com"))).expect("set");

        let _: serde_json::Value = h.client.get_json("/api/challenges").await.expect("ok");
        assert_eq!(transport.requests()[0].bearer.as_deref(), Some("T1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_bearer_without_record() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(json_response(200, "{}"))));
        let h = harness(transport.clone(), RefreshSettings::default());

        h.client.post_empty("/api/auth/login").await.expect("ok");
        assert!(transport.requests()[0].bearer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_renews_and_retries_once() {
        let transport = Arc::new(ScriptedTransport::new(|req| match req.path.as_str() {
            paths::REFRESH => Ok(json_response(200, r#"{"accessToken":"T2","expiresIn":300}"#)),
            _ if req.bearer.as_deref() == Some("T1") => Ok(expired_response()),
            _ => Ok(json_response(200, r#"{"items":[]}"#)),
        }));
        let h = harness(transport.clone(), RefreshSettings::default());
        h.store.set(&CredentialRecord::new("T1", profile("a@b.com"))).expect("set");

        let body: serde_json::Value = h.client.get_json("/api/challenges").await.expect("retried call succeeds");
        assert_eq!(body["items"], serde_json::json!([]));
        assert_eq!(transport.count(paths::REFRESH), 1);
        assert_eq!(h.store.token().as_deref(), Some("T2"));

        let calls: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|r| r.path == "/api/challenges")
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].bearer.as_deref(), Some("T2"));
        assert!(calls[1].retried);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_retries_twice() {
        let transport = Arc::new(ScriptedTransport::new(|req| match req.path.as_str() {
            paths::REFRESH => Ok(json_response(200, r#"{"accessToken":"T2"}"#)),
            _ => Ok(expired_response()),
        }));
        let h = harness(transport.clone(), RefreshSettings::default());
        h.store.set(&CredentialRecord::new("T1", profile("a@b.com"))).expect("set");

        let result = h.client.send(ApiRequest::get("/api/challenges")).await;
        assert!(matches!(result, Err(ApiError::TokenExpired { .. })));
        assert_eq!(transport.count("/api/challenges"), 2);
        assert_eq!(transport.count(paths::REFRESH), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failure_propagates_original_error() {
        let transport = Arc::new(ScriptedTransport::new(|req| match req.path.as_str() {
            paths::REFRESH => Ok(json_response(401, r#"{"message":"refresh token revoked","errorCode":"INVALID_REFRESH_TOKEN"}"#)),
            _ => Ok(expired_response()),
        }));
        let h = harness(transport.clone(), RefreshSettings::default());
        h.store.set(&CredentialRecord::new("T1", profile("a@b.com"))).expect("set");

        let result = h.client.send(ApiRequest::get("/api/challenges")).await;
        assert!(matches!(result, Err(ApiError::TokenExpired { .. })));
        // Not resent after a failed renewal
        assert_eq!(transport.count("/api/challenges"), 1);
        assert!(h.store.get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_pass_through() {
        let transport = Arc::new(ScriptedTransport::new(|req| match req.path.as_str() {
            "/api/users" => Ok(json_response(401, r#"{"message":"login required","errorCode":"AUTHENTICATION_REQUIRED"}"#)),
            _ => Ok(json_response(500, r#"{"message":"boom"}"#)),
        }));
        let h = harness(transport.clone(), RefreshSettings::default());
        h.store.set(&CredentialRecord::new("T1", profile("a@b.com"))).expect("set");

        let unauthorized = h.client.send(ApiRequest::get("/api/users")).await;
        assert!(matches!(unauthorized, Err(ApiError::Unauthorized { .. })));
        let server = h.client.send(ApiRequest::get("/api/payments")).await;
        assert!(matches!(server, Err(ApiError::ServerError(ref m)) if m == "boom"));

        assert_eq!(transport.count(paths::REFRESH), 0);
        assert_eq!(h.store.token().as_deref(), Some("T1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_path_is_never_intercepted() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(expired_response())));
        let h = harness(transport.clone(), RefreshSettings::default());
        h.store.set(&CredentialRecord::new("T1", profile("a@b.com"))).expect("set");

        let result = h.client.send(ApiRequest::post(paths::REFRESH)).await;
        assert!(matches!(result, Err(ApiError::TokenExpired { .. })));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_expired_calls_share_one_renewal() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let transport = Arc::new(
            ScriptedTransport::new(move |req| match req.path.as_str() {
                paths::REFRESH => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json_response(200, r#"{"accessToken":"T2"}"#))
                }
                _ if req.bearer.as_deref() == Some("T2") => Ok(json_response(200, "{}")),
                _ => Ok(expired_response()),
            })
            .with_delay(std::time::Duration::from_millis(50)),
        );
        let h = harness(transport.clone(), RefreshSettings::default());
        h.store.set(&CredentialRecord::new("T1", profile("a@b.com"))).expect("set");

        let (a, b, c) = tokio::join!(
            h.client.send(ApiRequest::get("/api/challenges")),
            h.client.send(ApiRequest::get("/api/users")),
            h.client.send(ApiRequest::get("/api/payments")),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
