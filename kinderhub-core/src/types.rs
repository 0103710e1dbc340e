//! Core data type definitions
//!
//! The session bundle persisted by the client and the user profile the
//! backend hands out with it.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current wall-clock time as epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Account role, always sourced from the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Provider,
    Admin,
    Teacher,
}

/// Profile dashboard section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DashboardSection {
    Overview,
    Favorites,
    Bookings,
    Reviews,
    Schedule,
    Listings,
    Moderation,
    Users,
    Settings,
}

impl Role {
    /// Dashboard sections visible to this role
    pub fn dashboard_sections(&self) -> &'static [DashboardSection] {
        use DashboardSection::*;

        match self {
            Role::User => &[Overview, Favorites, Bookings, Reviews, Settings],
            Role::Teacher => &[Overview, Schedule, Reviews, Settings],
            Role::Provider => &[Overview, Listings, Schedule, Bookings, Reviews, Settings],
            Role::Admin => &[Overview, Moderation, Users, Listings, Settings],
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Provider => write!(f, "provider"),
            Role::Admin => write!(f, "admin"),
            Role::Teacher => write!(f, "teacher"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "provider" => Ok(Role::Provider),
            "admin" => Ok(Role::Admin),
            "teacher" => Ok(Role::Teacher),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

/// Account status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Active,
    Inactive,
    Blocked,
}

/// Identity and role of the authenticated user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub notifications_enabled: bool,
}

impl UserProfile {
    /// Create a profile with only the required fields set
    pub fn new(id: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            role,
            status: UserStatus::Active,
            first_name: None,
            last_name: None,
            avatar: None,
            phone: None,
            address: None,
            email_verified: false,
            notifications_enabled: false,
        }
    }

    /// Whether this user may see a dashboard section
    ///
    /// Blocked accounts only keep access to their settings.
    pub fn can_view(&self, section: DashboardSection) -> bool {
        if self.status == UserStatus::Blocked {
            return section == DashboardSection::Settings;
        }
        self.role.dashboard_sections().contains(&section)
    }

    /// Sections this user may see, in display order
    pub fn visible_sections(&self) -> Vec<DashboardSection> {
        self.role
            .dashboard_sections()
            .iter()
            .copied()
            .filter(|section| self.can_view(*section))
            .collect()
    }

    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => self.email.clone(),
        }
    }

    /// Shallow-merge a patch into this profile
    pub fn apply(&mut self, patch: ProfilePatch) {
        if let Some(email) = patch.email {
            self.email = email;
        }
        if let Some(first_name) = patch.first_name {
            self.first_name = Some(first_name);
        }
        if let Some(last_name) = patch.last_name {
            self.last_name = Some(last_name);
        }
        if let Some(avatar) = patch.avatar {
            self.avatar = Some(avatar);
        }
        if let Some(phone) = patch.phone {
            self.phone = Some(phone);
        }
        if let Some(address) = patch.address {
            self.address = Some(address);
        }
        if let Some(flag) = patch.email_verified {
            self.email_verified = flag;
        }
        if let Some(flag) = patch.notifications_enabled {
            self.notifications_enabled = flag;
        }
    }
}

/// Partial profile update applied after local edits
///
/// `id`, `role` and `status` are owned by the backend and cannot be patched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub avatar: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub email_verified: Option<bool>,
    pub notifications_enabled: Option<bool>,
}

/// Persisted token record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime in seconds
    pub expires_in: i64,
    /// Epoch milliseconds
    pub issued_at: i64,
}

impl TokenSet {
    pub fn expires_at(&self) -> i64 {
        self.issued_at.saturating_add(self.expires_in.saturating_mul(1000))
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at()
    }
}

/// Token bundle plus the denormalized profile of one authenticated session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    /// Epoch milliseconds; stamped on first write when absent
    #[serde(default)]
    pub issued_at: Option<i64>,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

impl SessionBundle {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in: i64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_in,
            issued_at: None,
            user: None,
        }
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_issued_at(mut self, issued_at: i64) -> Self {
        self.issued_at = Some(issued_at);
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Absolute expiry in epoch milliseconds, if stamped
    pub fn expires_at(&self) -> Option<i64> {
        self.issued_at
            .map(|issued| issued.saturating_add(self.expires_in.saturating_mul(1000)))
    }

    /// An unstamped bundle has not started its lifetime yet and is not expired
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at().map(|at| now_ms >= at).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Split into the persisted token record, stamping `issued_at` with `now_ms` if unset
    pub fn tokens(&self, now_ms: i64) -> TokenSet {
        TokenSet {
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            expires_in: self.expires_in,
            issued_at: self.issued_at.unwrap_or(now_ms),
        }
    }

    pub fn from_parts(tokens: TokenSet, user: Option<UserProfile>) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_in: tokens.expires_in,
            issued_at: Some(tokens.issued_at),
            user,
        }
    }
}

/// Credentials for sign-in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Registration fields for sign-up
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub role: Role,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> UserProfile {
        UserProfile::new("42", "parent@example.com", Role::User)
    }

    #[test]
    fn test_profile_wire_format_is_camel_case() {
        let mut profile = sample_profile();
        profile.first_name = Some("Anna".to_string());
        profile.email_verified = true;

        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["firstName"], "Anna");
        assert_eq!(json["emailVerified"], true);
        assert_eq!(json["role"], "user");
        assert_eq!(json["status"], "active");
    }

    #[test]
    fn test_profile_decodes_with_missing_optional_fields() {
        let profile: UserProfile =
            serde_json::from_str(r#"{"id":"7","email":"a@b.c","role":"teacher"}"#).unwrap();
        assert_eq!(profile.role, Role::Teacher);
        assert_eq!(profile.status, UserStatus::Active);
        assert!(profile.first_name.is_none());
        assert!(!profile.notifications_enabled);
    }

    #[test]
    fn test_dashboard_sections_by_role() {
        let mut provider = sample_profile();
        provider.role = Role::Provider;
        assert!(provider.can_view(DashboardSection::Listings));
        assert!(!provider.can_view(DashboardSection::Moderation));

        let mut admin = sample_profile();
        admin.role = Role::Admin;
        assert!(admin.can_view(DashboardSection::Moderation));
        assert!(!admin.can_view(DashboardSection::Favorites));

        let user = sample_profile();
        assert_eq!(
            user.visible_sections(),
            vec![
                DashboardSection::Overview,
                DashboardSection::Favorites,
                DashboardSection::Bookings,
                DashboardSection::Reviews,
                DashboardSection::Settings,
            ]
        );
    }

    #[test]
    fn test_blocked_user_only_sees_settings() {
        let mut user = sample_profile();
        user.status = UserStatus::Blocked;
        assert_eq!(user.visible_sections(), vec![DashboardSection::Settings]);
    }

    #[test]
    fn test_apply_patch_is_shallow() {
        let mut profile = sample_profile();
        profile.phone = Some("+100".to_string());

        profile.apply(ProfilePatch {
            first_name: Some("Ivan".to_string()),
            notifications_enabled: Some(true),
            ..Default::default()
        });

        assert_eq!(profile.first_name.as_deref(), Some("Ivan"));
        assert_eq!(profile.phone.as_deref(), Some("+100"));
        assert!(profile.notifications_enabled);
        assert_eq!(profile.id, "42");
    }

    #[test]
    fn test_expiry_boundary() {
        let now = 1_700_000_000_000;
        let expired = SessionBundle::new("a", "r", 3600).with_issued_at(now - 3_600_000 - 1);
        let fresh = SessionBundle::new("a", "r", 3600).with_issued_at(now - 3_600_000 + 1000);

        assert!(expired.is_expired_at(now));
        assert!(!fresh.is_expired_at(now));
        assert!(!SessionBundle::new("a", "r", 3600).is_expired_at(now));
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Provider".parse::<Role>(), Ok(Role::Provider));
        assert!("guest".parse::<Role>().is_err());
        assert_eq!(Role::Teacher.to_string(), "teacher");
    }
}
