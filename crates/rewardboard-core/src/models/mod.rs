//! Data models shared by the session and presence code.
//!
//! - `UserProfile`: identity snapshot with authority helpers
//! - `PresenceState`, `PresenceUpdate`, `PresenceSnapshot`: online-user tracking

pub mod presence;
pub mod user;

pub use presence::{PresenceSnapshot, PresenceState, PresenceUpdate, UserId};
pub use user::UserProfile;
