//! Session Accessor - the read/write gateway to the current session
//!
//! Keeps a view-local copy of the session in a `watch` channel, reconciles it
//! with the store on every sync event, and runs the login, logout and refresh
//! flows against a [`SessionAuthority`].
//!
//! Every async flow captures the request generation before it awaits and
//! commits only if the generation is unchanged and the store still holds the
//! same session. `login`, `logout` and every clear bump the generation, so a
//! late response can never resurrect or clobber a newer session.

mod state;

pub use state::{SessionPhase, SessionState};

use crate::authority::SessionAuthority;
use crate::channel::Subscription;
use crate::store::SessionStore;
use crate::{SessionError, SessionResult};
use kinderhub_core::{
    log_operation_start, log_operation_success, now_millis, retry_async_if, Credentials,
    DashboardSection, ProfilePatch, RefreshPolicy, Registration, RetryConfig, SessionBundle,
    UserProfile,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct AccessorInner {
    store: SessionStore,
    authority: Arc<dyn SessionAuthority>,
    state: watch::Sender<SessionState>,
    /// Request generation
    generation: AtomicU64,
    policy: RefreshPolicy,
}

impl AccessorInner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Clear store and state; always bumps the generation
    fn invalidate(&self, reason: &str) {
        self.bump();
        self.store.clear();
        self.publish(SessionState::anonymous());
        info!(view = %self.store.view_id(), reason, "Session invalidated");
    }

    /// True if a flow started at `generation` for `started` may still commit
    fn is_current(&self, generation: u64, started: &SessionBundle) -> bool {
        if self.generation() != generation {
            return false;
        }
        match self.store.read() {
            Some(stored) => {
                stored.access_token == started.access_token
                    && stored.user_id() == started.user_id()
            }
            None => false,
        }
    }

    /// Resting state for whatever the store holds now; expired bundles are cleared
    fn settled_from_store(&self) -> SessionState {
        let now = now_millis();
        let stored = match self.store.read() {
            Some(bundle) if bundle.is_expired_at(now) => {
                debug!(view = %self.store.view_id(), "Stored session expired");
                self.bump();
                // Re-enters reconcile through the store's notification
                self.store.clear();
                None
            }
            other => other,
        };
        SessionState::settled_at(stored, now)
    }

    /// Publish the store's resting state and return its phase
    fn settle(&self) -> SessionPhase {
        let next = self.settled_from_store();
        let phase = next.phase;
        self.publish(next);
        phase
    }

    /// Sync event handler: bring the view-local copy in line with the store
    ///
    /// A hydration in progress is left alone while the store still holds the
    /// bundle it started from.
    fn reconcile(&self) {
        let next = self.settled_from_store();
        let hydrating_same = {
            let current = self.state.borrow();
            current.phase == SessionPhase::Hydrating && current.bundle == next.bundle
        };
        if !hydrating_same {
            self.publish(next);
        }
    }
}

/// Reactive gateway to the session of one view
///
/// Cheap to clone; clones share state. The accessor stays subscribed to the
/// view's sync channel until the last clone is dropped.
#[derive(Clone)]
pub struct SessionAccessor {
    inner: Arc<AccessorInner>,
    _subscription: Arc<Subscription>,
}

impl SessionAccessor {
    /// Create an accessor over `store`; the state starts `Uninitialized`
    pub fn new(
        store: SessionStore,
        authority: Arc<dyn SessionAuthority>,
        policy: RefreshPolicy,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        let inner = Arc::new(AccessorInner {
            store,
            authority,
            state,
            generation: AtomicU64::new(0),
            policy,
        });

        let weak: Weak<AccessorInner> = Arc::downgrade(&inner);
        let subscription = inner.store.channel().subscribe(move || {
            if let Some(inner) = weak.upgrade() {
                inner.reconcile();
            }
        });

        Self {
            inner,
            _subscription: Arc::new(subscription),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// Snapshot of the current state
    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every state change of this view
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.borrow().phase
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.inner.state.borrow().user().cloned()
    }

    /// A profile is held and the bundle has not expired
    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated_at(now_millis())
    }

    /// Dashboard sections the current user may open; empty when signed out
    pub fn visible_sections(&self) -> Vec<DashboardSection> {
        self.current_user()
            .map(|user| user.visible_sections())
            .unwrap_or_default()
    }

    /// Re-read the store now, as a sync event would
    pub fn sync(&self) {
        self.inner.reconcile();
    }

    /// Install a session the caller already holds
    ///
    /// The new state is visible as soon as this returns; no sync event is
    /// needed.
    pub fn login(&self, bundle: SessionBundle) -> SessionResult<()> {
        if bundle.access_token.trim().is_empty() {
            return Err(SessionError::validation(
                "Access token must not be empty",
                "access_token",
            ));
        }

        self.inner.bump();
        self.inner.store.write(&bundle);
        self.inner.settle();

        info!(
            view = %self.inner.store.view_id(),
            user_id = ?bundle.user_id(),
            "Session established"
        );
        Ok(())
    }

    /// End the session locally and, best effort, remotely
    ///
    /// Local state is cleared before the authority is contacted. A failing or
    /// slow remote logout is logged and otherwise ignored.
    pub async fn logout(&self) {
        let access_token = self.inner.store.read().map(|bundle| bundle.access_token);

        self.inner.invalidate("logout");

        let Some(access_token) = access_token else {
            return;
        };
        if let Err(e) = self.inner.authority.logout(&access_token).await {
            warn!(error = %e, "Remote logout failed; local session already cleared");
        }
    }

    /// Exchange credentials for a session and install it
    ///
    /// Authority errors are returned unchanged and nothing is written.
    pub async fn sign_in(&self, credentials: &Credentials) -> SessionResult<UserProfile> {
        if credentials.email.trim().is_empty() {
            return Err(SessionError::validation("Email is required", "email"));
        }
        if credentials.password.is_empty() {
            return Err(SessionError::validation("Password is required", "password"));
        }

        log_operation_start!("sign_in", email = %credentials.email);
        let generation = self.inner.generation();
        let bundle = self.inner.authority.sign_in(credentials).await?;
        self.install(generation, bundle, "sign_in")
    }

    /// Create an account and install its first session
    pub async fn sign_up(&self, registration: &Registration) -> SessionResult<UserProfile> {
        if registration.email.trim().is_empty() {
            return Err(SessionError::validation("Email is required", "email"));
        }
        if registration.password.is_empty() {
            return Err(SessionError::validation("Password is required", "password"));
        }

        log_operation_start!("sign_up", email = %registration.email);
        let generation = self.inner.generation();
        let bundle = self.inner.authority.sign_up(registration).await?;
        self.install(generation, bundle, "sign_up")
    }

    fn install(
        &self,
        generation: u64,
        bundle: SessionBundle,
        operation: &str,
    ) -> SessionResult<UserProfile> {
        if self.inner.generation() != generation {
            debug!(operation, "Session changed while request was in flight, dropping result");
            return Err(SessionError::superseded(operation));
        }

        let Some(user) = bundle.user.clone() else {
            return Err(SessionError::validation(
                "Authority returned a session without a user profile",
                "user",
            ));
        };

        self.login(bundle)?;
        log_operation_success!(operation, user_id = %user.id);
        Ok(user)
    }

    /// Revalidate the stored session against the authority
    ///
    /// Shows the cached profile while fetching (`Hydrating`). Never fails:
    /// the resulting phase is returned and problems are logged.
    pub async fn refresh_profile(&self) -> SessionPhase {
        let inner = &self.inner;

        let Some(bundle) = inner.store.read() else {
            inner.publish(SessionState::anonymous());
            return SessionPhase::Anonymous;
        };
        if bundle.is_expired() {
            inner.invalidate("expired");
            return SessionPhase::Anonymous;
        }
        let Some(user_id) = bundle.user_id().map(str::to_string) else {
            return inner.settle();
        };

        let generation = inner.generation();
        inner.publish(SessionState::hydrating(bundle.clone()));
        debug!(view = %inner.store.view_id(), user_id = %user_id, "Refreshing profile");

        let retry = RetryConfig::from(&inner.policy);
        let authority = inner.authority.clone();
        let access_token = bundle.access_token.clone();
        let result = retry_async_if(
            || {
                let authority = authority.clone();
                let access_token = access_token.clone();
                let user_id = user_id.clone();
                async move { authority.get_current_user(&access_token, &user_id).await }
            },
            retry,
            "refresh_profile",
            SessionError::is_recoverable,
        )
        .await;

        if !inner.is_current(generation, &bundle) {
            debug!(user_id = %user_id, "Session changed during profile refresh, dropping result");
            return match self.phase() {
                SessionPhase::Hydrating => inner.settle(),
                phase => phase,
            };
        }

        match result {
            Ok(profile) => {
                let mut updated = bundle;
                updated.user = Some(profile);
                inner.store.write(&updated);
                inner.settle()
            }
            Err(e) if inner.policy.invalidate_on_failure => {
                warn!(error = %e, user_id = %user_id, "Profile refresh failed");
                inner.invalidate("profile refresh failed");
                SessionPhase::Anonymous
            }
            Err(e) => {
                warn!(
                    error = %e,
                    user_id = %user_id,
                    "Profile refresh failed, keeping cached profile"
                );
                inner.settle()
            }
        }
    }

    /// Trade the stored refresh token for new tokens
    ///
    /// Keeps the cached profile when the authority returns none. Any failure
    /// clears the session.
    pub async fn refresh_tokens(&self) -> SessionPhase {
        let inner = &self.inner;

        let Some(bundle) = inner.store.read() else {
            inner.publish(SessionState::anonymous());
            return SessionPhase::Anonymous;
        };

        let generation = inner.generation();
        let result = inner.authority.refresh(&bundle.refresh_token).await;

        if !inner.is_current(generation, &bundle) {
            debug!("Session changed during token refresh, dropping result");
            return self.phase();
        }

        match result {
            Ok(mut refreshed) if !refreshed.access_token.is_empty() => {
                if refreshed.user.is_none() {
                    refreshed.user = bundle.user;
                }
                inner.store.write(&refreshed);
                debug!("Session tokens refreshed");
                inner.settle()
            }
            Ok(_) => {
                warn!("Token refresh returned an empty access token");
                inner.invalidate("token refresh failed");
                SessionPhase::Anonymous
            }
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                inner.invalidate("token refresh failed");
                SessionPhase::Anonymous
            }
        }
    }

    /// Merge `patch` into the current profile and write it through
    pub fn update_user(&self, patch: ProfilePatch) -> SessionResult<UserProfile> {
        let inner = &self.inner;

        let Some(mut bundle) = inner.store.read() else {
            return Err(SessionError::not_authenticated("No stored session"));
        };
        let Some(user) = bundle.user.as_mut() else {
            return Err(SessionError::not_authenticated("Session has no user profile"));
        };
        user.apply(patch);
        let updated = user.clone();

        inner.store.write(&bundle);
        inner.settle();
        Ok(updated)
    }

    /// Clear the session if its bundle has expired; returns whether it did
    pub fn check_expiry(&self) -> bool {
        match self.inner.store.read() {
            Some(bundle) if bundle.is_expired() => {
                self.inner.invalidate("expired");
                true
            }
            _ => false,
        }
    }
}
