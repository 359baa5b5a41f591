use tokio::sync::broadcast;

/// Buffer size for the signal channel.
/// Observers only need the latest few events; lagging receivers re-check instead.
const SIGNAL_BUFFER_SIZE: usize = 64;

/// In-process notification that authentication state may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSignal {
    /// A stored credential key was written or removed (by this or another context)
    StorageChanged { key: String },
    /// The login flow stored a fresh record
    LoginSucceeded,
    /// The user logged out deliberately
    LoggedOut,
    /// Renewal failed for good; observers should send the user to login now
    ForceLogout,
}

/// Broadcast bus for `AuthSignal`s. Clone is cheap and all clones share one channel.
#[derive(Debug, Clone)]
pub struct AuthSignals {
    tx: broadcast::Sender<AuthSignal>,
}

impl AuthSignals {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_BUFFER_SIZE);
        Self { tx }
    }

    /// Publish a signal. Having no subscribers is not an error.
    pub fn emit(&self, signal: AuthSignal) {
        let _ = self.tx.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthSignal> {
        self.tx.subscribe()
    }
}

impl Default for AuthSignals {
    fn default() -> Self {
        Self::new()
    }
}
