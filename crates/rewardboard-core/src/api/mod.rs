//! REST API access for the dashboard backend.
//!
//! This module provides the `ApiClient` request pipeline, which attaches the
//! stored bearer token to every call and transparently renews it once when
//! the backend reports `TOKEN_EXPIRED`.
//!
//! The wire itself sits behind the `Transport` trait; `HttpTransport` is the
//! reqwest implementation. Its cookie jar carries the HTTP-only refresh
//! cookie the backend sets at login.

pub mod client;
pub mod error;
pub mod transport;

pub use client::ApiClient;
pub use error::ApiError;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Method, Transport};

/// Backend endpoint paths used by the core
pub mod paths {
    pub const LOGIN: &str = "/api/auth/login";
    pub const REFRESH: &str = "/api/auth/refresh";
    pub const LOGOUT: &str = "/api/auth/logout";
    pub const ME: &str = "/api/auth/me";
    pub const PRESENCE_CONNECT: &str = "/api/presence/connect";
    pub const PRESENCE: &str = "/api/presence";

    /// Whether a request targets the renewal endpoint
    pub fn is_renewal(path: &str) -> bool {
        path.contains("/auth/refresh")
    }
}
