//! Authentication module for managing the dashboard session.
//!
//! This module provides:
//! - `CredentialStore`: the access token and profile, stored and cleared together
//! - `KeyValueStore` backends: memory, JSON file, OS keychain
//! - `RefreshCoordinator`: single-flight access token renewal
//! - `SessionManager`: login, logout and identity lookups
//! - `AuthSignals`: in-process notifications that auth state changed
//!
//! Access tokens live for about five minutes; renewal relies on an
//! HTTP-only refresh cookie the transport carries.

pub mod credentials;
pub mod jwt;
pub mod kv;
pub mod refresh;
pub mod session;
pub mod signals;
pub mod store;

pub use credentials::KeyringStore;
pub use kv::{FileStore, KeyValueStore, MemoryStore};
pub use refresh::{RefreshCoordinator, RefreshSettings, RenewalError};
pub use session::{MeResponse, SessionManager};
pub use signals::{AuthSignal, AuthSignals};
pub use store::{CredentialRecord, CredentialStore, PROFILE_KEY, TOKEN_KEY};
