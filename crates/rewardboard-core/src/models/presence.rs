use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Identifier the backend uses for an online user (their login email)
pub type UserId = String;

/// Push message published on the presence topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PresenceUpdate {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<Vec<UserId>>,
}

/// Body of `GET /api/presence`. The endpoint has shipped both shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PresenceSnapshot {
    /// A missing `online` means nobody is online
    Wrapped {
        #[serde(default)]
        online: Vec<UserId>,
    },
    Bare(Vec<UserId>),
}

impl PresenceSnapshot {
    pub fn into_set(self) -> BTreeSet<UserId> {
        match self {
            PresenceSnapshot::Wrapped { online } | PresenceSnapshot::Bare(online) => {
                online.into_iter().collect()
            }
        }
    }
}

/// Locally observed presence, published to UI widgets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct PresenceState {
    pub online: BTreeSet<UserId>,
    pub connected: bool,
    pub error: Option<String>,
    pub last_event: Option<PresenceUpdate>,
}

impl PresenceState {
    /// Replace the online set with a server snapshot. Never merges.
    pub fn apply_snapshot(&mut self, online: BTreeSet<UserId>) {
        self.online = online;
        self.connected = true;
        self.error = None;
    }

    /// Apply a push message. Messages without an `online` list only update `last_event`.
    pub fn apply_update(&mut self, update: PresenceUpdate) {
        if let Some(ref online) = update.online {
            self.online = online.iter().cloned().collect();
        }
        self.last_event = Some(update);
    }

    /// Record a transport failure, keeping the last acknowledged snapshot
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.connected = false;
        self.error = Some(error.into());
    }

    pub fn is_online(&self, user: &str) -> bool {
        self.online.contains(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<UserId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_snapshot_replaces_not_merges() {
        let mut state = PresenceState::default();
        state.apply_snapshot(set(&["A", "B"]));
        state.apply_snapshot(set(&["B", "C"]));
        assert_eq!(state.online, set(&["B", "C"]));
        assert!(state.connected);
    }

    #[test]
    fn test_update_without_online_keeps_set() {
        let mut state = PresenceState::default();
        state.apply_snapshot(set(&["u1"]));
        let update: PresenceUpdate =
            serde_json::from_str(r#"{"type":"PRESENCE_UPDATE","joined":["u2"]}"#).expect("update JSON");
        state.apply_update(update);
        assert_eq!(state.online, set(&["u1"]));
        assert_eq!(state.last_event.as_ref().map(|e| e.kind.as_str()), Some("PRESENCE_UPDATE"));
    }

    #[test]
    fn test_failure_keeps_last_snapshot() {
        let mut state = PresenceState::default();
        state.apply_snapshot(set(&["u1", "u2"]));
        state.mark_failed("HTTP 503");
        assert!(!state.connected);
        assert_eq!(state.error.as_deref(), Some("HTTP 503"));
        assert!(state.is_online("u2"));
    }

    #[test]
    fn test_parse_snapshot_shapes() {
        let wrapped: PresenceSnapshot = serde_json::from_str(r#"{"online":["u1","u2"]}"#).expect("wrapped");
        assert_eq!(wrapped.into_set(), set(&["u1", "u2"]));
        let bare: PresenceSnapshot = serde_json::from_str(r#"["u3"]"#).expect("bare");
        assert_eq!(bare.into_set(), set(&["u3"]));
        let empty: PresenceSnapshot = serde_json::from_str("{}").expect("empty object");
        assert!(empty.into_set().is_empty());
    }
}
