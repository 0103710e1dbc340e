//! Persistent Session Store
//!
//! Durable copy of the session bundle, split over two entries: the token
//! record and the user profile. Storage problems never reach the caller:
//! an unavailable backend degrades the view to an in-memory session and a
//! corrupt entry reads as absent and is purged.

mod backend;

pub use backend::{
    FileBackend, MemoryBackend, StorageBackend, StorageChange, UnavailableBackend, ViewId,
};

use crate::channel::SyncChannel;
use kinderhub_core::{now_millis, SessionBundle, TokenSet, UserProfile};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Key of the token record
pub const TOKENS_KEY: &str = "auth_tokens";
/// Key of the user profile
pub const USER_KEY: &str = "user";

/// Store handle for one view; clones share the same view state
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    channel: SyncChannel,
    /// View-local copy kept while the backend refuses writes, tagged with
    /// the channel's foreign change count at the time
    volatile: Arc<RwLock<Option<(SessionBundle, u64)>>>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn StorageBackend>, channel: SyncChannel) -> Self {
        Self {
            backend,
            channel,
            volatile: Arc::new(RwLock::new(None)),
        }
    }

    pub fn view_id(&self) -> ViewId {
        self.channel.view_id()
    }

    pub fn channel(&self) -> &SyncChannel {
        &self.channel
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// True while this view holds a session the backend could not persist
    pub fn is_degraded(&self) -> bool {
        self.volatile
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn set_volatile(&self, bundle: Option<SessionBundle>) {
        let tagged = bundle.map(|b| (b, self.channel.foreign_changes()));
        *self.volatile.write().unwrap_or_else(|e| e.into_inner()) = tagged;
    }

    /// The in-memory session, unless another view has changed the backend since
    fn volatile(&self) -> Option<SessionBundle> {
        let mut slot = self.volatile.write().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some((_, seen)) if *seen != self.channel.foreign_changes() => {
                debug!(
                    view = %self.view_id(),
                    "Another view changed the session, dropping in-memory copy"
                );
                *slot = None;
                None
            }
            Some((bundle, _)) => Some(bundle.clone()),
            None => None,
        }
    }

    /// Persist a bundle, stamping `issued_at` if unset
    ///
    /// Returns the bundle as stored. Never fails: if the backend refuses the
    /// write the bundle is kept in memory for this view only.
    pub fn write(&self, bundle: &SessionBundle) -> SessionBundle {
        let tokens = bundle.tokens(now_millis());
        let stored = SessionBundle::from_parts(tokens.clone(), bundle.user.clone());

        match self.persist(&tokens, stored.user.as_ref()) {
            Ok(()) => {
                self.set_volatile(None);
                debug!(view = %self.view_id(), "Session written");
            }
            Err(reason) => {
                warn!(
                    view = %self.view_id(),
                    backend = self.backend.name(),
                    error = %reason,
                    "Session storage unavailable, keeping session in memory only"
                );
                // A half-applied write could pair new tokens with an old profile
                if let Err(e) = self
                    .backend
                    .remove_many(self.view_id(), &[TOKENS_KEY, USER_KEY])
                {
                    debug!(error = %e, "Could not drop partially written session");
                }
                self.set_volatile(Some(stored.clone()));
            }
        }

        self.channel.notify_local();
        stored
    }

    fn persist(&self, tokens: &TokenSet, user: Option<&UserProfile>) -> Result<(), String> {
        let tokens_json = serde_json::to_string(tokens).map_err(|e| e.to_string())?;

        match user {
            Some(user) => {
                let user_json = serde_json::to_string(user).map_err(|e| e.to_string())?;
                self.backend
                    .set_many(
                        self.view_id(),
                        &[(TOKENS_KEY, tokens_json), (USER_KEY, user_json)],
                    )
                    .map_err(|e| e.to_string())
            }
            None => {
                self.backend
                    .set_many(self.view_id(), &[(TOKENS_KEY, tokens_json)])
                    .map_err(|e| e.to_string())?;
                // A bundle without a user must not inherit a previous profile
                self.backend
                    .remove_many(self.view_id(), &[USER_KEY])
                    .map_err(|e| e.to_string())
            }
        }
    }

    /// Read the current bundle; corrupt entries read as absent and are purged
    pub fn read(&self) -> Option<SessionBundle> {
        if let Some(bundle) = self.volatile() {
            return Some(bundle);
        }

        let raw_tokens = match self.backend.get(TOKENS_KEY) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Failed to read session tokens");
                return None;
            }
        };

        let tokens = match serde_json::from_str::<TokenSet>(&raw_tokens) {
            Ok(tokens) if !tokens.access_token.is_empty() => tokens,
            Ok(_) => {
                warn!("Stored session has an empty access token, purging");
                self.purge(&[TOKENS_KEY, USER_KEY]);
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Corrupt session token entry, purging");
                self.purge(&[TOKENS_KEY, USER_KEY]);
                return None;
            }
        };

        let user = match self.backend.get(USER_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<UserProfile>(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "Corrupt user profile entry, purging");
                    self.purge(&[USER_KEY]);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(backend = self.backend.name(), error = %e, "Failed to read user profile");
                None
            }
        };

        Some(SessionBundle::from_parts(tokens, user))
    }

    /// Silent removal of bad entries; does not notify
    fn purge(&self, keys: &[&str]) {
        if let Err(e) = self.backend.remove_many(self.view_id(), keys) {
            warn!(error = %e, "Failed to purge corrupt session entries");
        }
    }

    /// Remove both session entries together and notify
    pub fn clear(&self) {
        self.set_volatile(None);

        if let Err(e) = self
            .backend
            .remove_many(self.view_id(), &[TOKENS_KEY, USER_KEY])
        {
            warn!(
                backend = self.backend.name(),
                error = %e,
                "Failed to clear stored session"
            );
        }

        debug!(view = %self.view_id(), "Session cleared");
        self.channel.notify_local();
    }

    /// True when no bundle is stored or the stored one has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.read()
            .map(|bundle| bundle.is_expired_at(now_ms))
            .unwrap_or(true)
    }
}
