use serde::{Deserialize, Serialize};

/// Role name carried by administrator accounts
pub const ADMIN_ROLE: &str = "ADMIN";

/// Authorities that grant access to the challenge management screens
const CHALLENGE_MANAGE_AUTHORITIES: &[&str] =
    &["CHALLENGE_UPDATE", "CHALLENGE_DELETE", "CHALLENGE_VIEW_ALL"];

/// Authorities that grant access to the user management screens
const USER_MANAGE_AUTHORITIES: &[&str] =
    &["USER_CREATE", "USER_UPDATE", "USER_DELETE", "USER_VIEW_ALL"];

/// Identity snapshot captured at login or refresh time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    #[serde(default)]
    pub authorities: Vec<String>,
}

impl UserProfile {
    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.iter().any(|a| a == authority)
    }

    pub fn has_any_authority(&self, authorities: &[&str]) -> bool {
        authorities.iter().any(|a| self.has_authority(a))
    }

    pub fn has_all_authorities(&self, authorities: &[&str]) -> bool {
        authorities.iter().all(|a| self.has_authority(a))
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }

    pub fn can_create_challenge(&self) -> bool {
        self.has_authority("CHALLENGE_CREATE")
    }

    pub fn can_manage_challenge(&self) -> bool {
        self.has_any_authority(CHALLENGE_MANAGE_AUTHORITIES)
    }

    pub fn can_manage_users(&self) -> bool {
        self.has_any_authority(USER_MANAGE_AUTHORITIES)
    }

    /// Name for display, falling back to the email when no username was issued
    pub fn display_name(&self) -> &str {
        if self.username.is_empty() {
            &self.email
        } else {
            &self.username
        }
    }
}
