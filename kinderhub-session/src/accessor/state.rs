//! Reactive session state

use chrono::{DateTime, TimeZone, Utc};
use kinderhub_core::{now_millis, SessionBundle, UserProfile};
use serde::Serialize;

/// Lifecycle of a view's session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Nothing has been read yet
    #[default]
    Uninitialized,
    /// Cached profile shown while the authoritative one is fetched
    Hydrating,
    Authenticated,
    Anonymous,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Hydrating => "hydrating",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Anonymous => "anonymous",
        };
        f.write_str(name)
    }
}

/// View-local copy of the session, published through a `watch` channel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    pub bundle: Option<SessionBundle>,
}

impl SessionState {
    pub fn anonymous() -> Self {
        Self {
            phase: SessionPhase::Anonymous,
            bundle: None,
        }
    }

    pub fn hydrating(bundle: SessionBundle) -> Self {
        Self {
            phase: SessionPhase::Hydrating,
            bundle: Some(bundle),
        }
    }

    /// Resting state for a stored bundle at `now_ms`
    ///
    /// Authenticated needs a profile and an unexpired bundle. A bundle
    /// without a profile is kept but reads as anonymous.
    pub fn settled_at(bundle: Option<SessionBundle>, now_ms: i64) -> Self {
        let phase = match &bundle {
            Some(b) if b.user.is_some() && !b.is_expired_at(now_ms) => SessionPhase::Authenticated,
            _ => SessionPhase::Anonymous,
        };
        Self { phase, bundle }
    }

    pub fn settled(bundle: Option<SessionBundle>) -> Self {
        Self::settled_at(bundle, now_millis())
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.bundle.as_ref().and_then(|b| b.user.as_ref())
    }

    pub fn is_authenticated_at(&self, now_ms: i64) -> bool {
        self.bundle
            .as_ref()
            .map(|b| b.user.is_some() && !b.is_expired_at(now_ms))
            .unwrap_or(false)
    }

    /// Expiry of the held bundle, if it has been stamped
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let millis = self.bundle.as_ref()?.expires_at()?;
        Utc.timestamp_millis_opt(millis).single()
    }
}
