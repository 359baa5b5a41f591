use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::kv::KeyValueStore;
use super::signals::{AuthSignal, AuthSignals};
use crate::models::UserProfile;

/// Storage key for the raw access token
pub const TOKEN_KEY: &str = "authToken";

/// Storage key for the JSON-encoded user profile
pub const PROFILE_KEY: &str = "userInfo";

/// An access token together with the identity it was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct CredentialRecord {
    pub access_token: String,
    pub profile: UserProfile,
}

impl CredentialRecord {
    pub fn new(access_token: impl Into<String>, profile: UserProfile) -> Self {
        Self {
            access_token: access_token.into(),
            profile,
        }
    }
}

/// Credential store over a key-value substrate.
///
/// A record is only readable when both keys are present and the profile
/// parses. Reads, writes and clears all hold the same lock across both keys,
/// so a reader never pairs one record's token with another record's profile.
/// Clone is cheap; all clones share the backend and the lock.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
    signals: AuthSignals,
    /// Generation counter, bumped by `set` and `clear` but not by token swaps
    state: Arc<Mutex<u64>>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, signals: AuthSignals) -> Self {
        Self {
            backend,
            signals,
            state: Arc::new(Mutex::new(0)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, u64>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("Credential store lock poisoned"))
    }

    /// Read the current record. Missing, partial or malformed data reads as `None`.
    pub fn get(&self) -> Option<CredentialRecord> {
        let _guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_record()
    }

    /// The stored access token, only when a complete record exists
    pub fn token(&self) -> Option<String> {
        self.get().map(|r| r.access_token)
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.get().map(|r| r.profile)
    }

    pub fn is_authenticated(&self) -> bool {
        self.get().is_some()
    }

    /// Changes whenever a session is stored or removed.
    pub fn generation(&self) -> u64 {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the whole record.
    pub fn set(&self, record: &CredentialRecord) -> Result<()> {
        {
            let mut generation = self.lock()?;
            *generation += 1;
            self.write_record(record)?;
        }
        self.signals.emit(AuthSignal::StorageChanged {
            key: TOKEN_KEY.to_string(),
        });
        Ok(())
    }

    /// Swap in a renewed token, keeping the stored profile unless a newer one is given.
    ///
    /// Fails without touching storage when neither a stored nor a supplied profile exists.
    pub fn replace_token(
        &self,
        access_token: &str,
        profile: Option<UserProfile>,
    ) -> Result<CredentialRecord> {
        let record = {
            let _guard = self.lock()?;
            self.swap_token(access_token, profile)?
        };
        self.emit_token_changed();
        Ok(record)
    }

    /// Like [`replace_token`](Self::replace_token), but only while the store is
    /// still at `generation`. Returns `Ok(None)` and writes nothing when a
    /// `set` or `clear` happened since.
    pub fn replace_token_if(
        &self,
        generation: u64,
        access_token: &str,
        profile: Option<UserProfile>,
    ) -> Result<Option<CredentialRecord>> {
        let record = {
            let current = self.lock()?;
            if *current != generation {
                debug!(
                    expected = generation,
                    current = *current,
                    "Session changed, token swap skipped"
                );
                return Ok(None);
            }
            self.swap_token(access_token, profile)?
        };
        self.emit_token_changed();
        Ok(Some(record))
    }

    /// Remove the record. Token goes first so a half-finished clear reads as logged out.
    pub fn clear(&self) -> Result<()> {
        {
            let mut generation = self.lock()?;
            *generation += 1;
            self.backend
                .delete(TOKEN_KEY)
                .context("Failed to delete stored token")?;
            self.backend
                .delete(PROFILE_KEY)
                .context("Failed to delete stored profile")?;
        }
        self.emit_token_changed();
        Ok(())
    }

    fn emit_token_changed(&self) {
        self.signals.emit(AuthSignal::StorageChanged {
            key: TOKEN_KEY.to_string(),
        });
    }

    /// Caller holds the lock.
    fn read_record(&self) -> Option<CredentialRecord> {
        let token = match self.backend.get(TOKEN_KEY) {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read stored token");
                return None;
            }
        };

        let profile_json = match self.backend.get(PROFILE_KEY) {
            Ok(Some(json)) => json,
            Ok(None) => {
                debug!("Stored token has no profile, treating as logged out");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read stored profile");
                return None;
            }
        };

        match serde_json::from_str::<UserProfile>(&profile_json) {
            Ok(profile) => Some(CredentialRecord {
                access_token: token,
                profile,
            }),
            Err(e) => {
                debug!(error = %e, "Stored profile is malformed, treating as logged out");
                None
            }
        }
    }

    /// Caller holds the lock.
    fn swap_token(
        &self,
        access_token: &str,
        profile: Option<UserProfile>,
    ) -> Result<CredentialRecord> {
        let profile = match profile.or_else(|| self.stored_profile()) {
            Some(profile) => profile,
            None => anyhow::bail!("No profile available for renewed token"),
        };
        let record = CredentialRecord::new(access_token, profile);
        self.write_record(&record)?;
        Ok(record)
    }

    fn stored_profile(&self) -> Option<UserProfile> {
        let json = self.backend.get(PROFILE_KEY).ok().flatten()?;
        serde_json::from_str(&json).ok()
    }

    fn write_record(&self, record: &CredentialRecord) -> Result<()> {
        let profile_json = serde_json::to_string(&record.profile)?;
        self.backend
            .set(PROFILE_KEY, &profile_json)
            .context("Failed to store profile")?;
        if let Err(e) = self.backend.set(TOKEN_KEY, &record.access_token) {
            // Never leave a profile behind for a token that was not written
            let _ = self.backend.delete(TOKEN_KEY);
            let _ = self.backend.delete(PROFILE_KEY);
            return Err(e).context("Failed to store token");
        }
        Ok(())
    }
}
