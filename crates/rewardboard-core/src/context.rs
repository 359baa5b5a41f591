use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::api::{ApiClient, HttpTransport, Transport};
use crate::auth::{
    AuthSignals, CredentialStore, FileStore, KeyValueStore, KeyringStore, RefreshCoordinator,
    RefreshSettings, SessionManager,
};
use crate::config::{Config, StorageBackend};
use crate::gate::{AuthGate, GateSettings, Navigator, RoutePolicy};
use crate::presence::{PresenceMode, PresenceTracker};

/// One session's worth of shared services: store, refresher, pipeline.
///
/// Build once per process and hand out clones of the parts; every part
/// shares the same credential store and refresh slot.
#[derive(Clone)]
pub struct AuthContext {
    signals: AuthSignals,
    store: CredentialStore,
    refresher: RefreshCoordinator,
    client: ApiClient,
    session: SessionManager,
}

impl AuthContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        backend: Arc<dyn KeyValueStore>,
        settings: RefreshSettings,
    ) -> Self {
        let signals = AuthSignals::new();
        let store = CredentialStore::new(backend, signals.clone());
        let refresher =
            RefreshCoordinator::new(Arc::clone(&transport), store.clone(), signals.clone(), settings);
        let client = ApiClient::new(transport, store.clone(), refresher.clone());
        let session = SessionManager::new(client.clone(), store.clone(), signals.clone());
        Self {
            signals,
            store,
            refresher,
            client,
            session,
        }
    }

    /// HTTP transport and the configured storage backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.api_base_url, config.request_timeout())
            .context("Failed to build HTTP transport")?;
        let backend: Arc<dyn KeyValueStore> = match config.storage {
            StorageBackend::File => Arc::new(FileStore::new(config.cache_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStore::new()),
        };
        debug!(
            base_url = %config.api_base_url,
            storage = ?config.storage,
            "Auth context created"
        );
        Ok(Self::new(Arc::new(transport), backend, config.refresh_settings()))
    }

    pub fn signals(&self) -> &AuthSignals {
        &self.signals
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn gate(
        &self,
        policy: RoutePolicy,
        navigator: Arc<dyn Navigator>,
        settings: GateSettings,
    ) -> AuthGate {
        AuthGate::new(
            self.store.clone(),
            self.signals.clone(),
            policy,
            navigator,
            settings,
        )
    }

    pub fn start_presence(&self, mode: PresenceMode) -> PresenceTracker {
        PresenceTracker::start(mode, self.client.clone())
    }
}
