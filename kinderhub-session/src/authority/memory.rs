//! In-memory authority for tests, demos and offline development

use super::SessionAuthority;
use crate::SessionResult;
use async_trait::async_trait;
use kinderhub_core::{
    network_error, Credentials, ErrorContext, KinderhubError, Registration, SessionBundle,
    UserProfile,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct Account {
    password: String,
    profile: UserProfile,
}

#[derive(Default)]
struct AuthorityState {
    /// Accounts keyed by email
    accounts: HashMap<String, Account>,
    /// Live access tokens -> user id
    access_tokens: HashMap<String, String>,
    /// Live refresh tokens -> user id
    refresh_tokens: HashMap<String, String>,
}

/// Simple in-memory [`SessionAuthority`]
///
/// Supports failure injection (`set_offline`, `fail_profile_fetches`) and
/// holding profile responses behind a gate to exercise races.
pub struct InMemoryAuthority {
    state: Mutex<AuthorityState>,
    token_ttl_seconds: i64,
    next_token: AtomicUsize,
    offline: AtomicBool,
    failing_profile_fetches: AtomicUsize,
    profile_gate: Mutex<Option<Arc<Notify>>>,
    profile_calls: AtomicUsize,
    logout_calls: AtomicUsize,
}

impl InMemoryAuthority {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AuthorityState::default()),
            token_ttl_seconds: 3600,
            next_token: AtomicUsize::new(1),
            offline: AtomicBool::new(false),
            failing_profile_fetches: AtomicUsize::new(0),
            profile_gate: Mutex::new(None),
            profile_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_token_ttl(mut self, seconds: i64) -> Self {
        self.token_ttl_seconds = seconds;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AuthorityState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_user(&self, profile: UserProfile, password: &str) {
        self.lock().accounts.insert(
            profile.email.clone(),
            Account {
                password: password.to_string(),
                profile,
            },
        );
    }

    /// Replace the server-side profile of an existing account (matched by id)
    pub fn set_profile(&self, profile: UserProfile) {
        let mut state = self.lock();
        if let Some(account) = state
            .accounts
            .values_mut()
            .find(|account| account.profile.id == profile.id)
        {
            account.profile = profile;
        }
    }

    /// Issue a session for a known user without checking a password
    pub fn issue_session(&self, user_id: &str) -> Option<SessionBundle> {
        let mut state = self.lock();
        let profile = state
            .accounts
            .values()
            .find(|account| account.profile.id == user_id)
            .map(|account| account.profile.clone())?;
        Some(self.mint(&mut state, profile))
    }

    /// Make every call fail with a network error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` profile fetches with a network error
    pub fn fail_profile_fetches(&self, count: usize) {
        self.failing_profile_fetches.store(count, Ordering::SeqCst);
    }

    /// Hold profile responses until the returned gate is notified
    pub fn hold_profile_responses(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.profile_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
        gate
    }

    pub fn release_profile_responses(&self) {
        if let Some(gate) = self
            .profile_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            gate.notify_waiters();
            gate.notify_one();
        }
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn is_token_live(&self, access_token: &str) -> bool {
        self.lock().access_tokens.contains_key(access_token)
    }

    fn mint(&self, state: &mut AuthorityState, profile: UserProfile) -> SessionBundle {
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        let access = format!("access-{}-{}", profile.id, n);
        let refresh = format!("refresh-{}-{}", profile.id, n);

        state
            .access_tokens
            .insert(access.clone(), profile.id.clone());
        state
            .refresh_tokens
            .insert(refresh.clone(), profile.id.clone());

        SessionBundle::new(access, refresh, self.token_ttl_seconds).with_user(profile)
    }

    fn check_online(&self, operation: &str) -> Result<(), KinderhubError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(network_error!(
                format!("{}: backend unreachable", operation),
                "in_memory_authority"
            ));
        }
        Ok(())
    }

    fn unauthorized(message: &str, operation: &str) -> KinderhubError {
        KinderhubError::Authentication {
            message: message.to_string(),
            context: ErrorContext::new("in_memory_authority").with_operation(operation),
        }
    }
}

impl Default for InMemoryAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionAuthority for InMemoryAuthority {
    async fn sign_in(&self, credentials: &Credentials) -> SessionResult<SessionBundle> {
        self.check_online("sign_in")?;

        let mut state = self.lock();
        let profile = match state.accounts.get(&credentials.email) {
            Some(account) if account.password == credentials.password => account.profile.clone(),
            _ => return Err(Self::unauthorized("Invalid email or password", "sign_in").into()),
        };

        Ok(self.mint(&mut state, profile))
    }

    async fn sign_up(&self, registration: &Registration) -> SessionResult<SessionBundle> {
        self.check_online("sign_up")?;

        let mut state = self.lock();
        if state.accounts.contains_key(&registration.email) {
            return Err(KinderhubError::Api {
                status: 409,
                message: "Email is already registered".to_string(),
                context: ErrorContext::new("in_memory_authority").with_operation("sign_up"),
            }
            .into());
        }

        let id = (state.accounts.len() + 1).to_string();
        let mut profile = UserProfile::new(id, registration.email.clone(), registration.role);
        profile.first_name = registration.first_name.clone();
        profile.last_name = registration.last_name.clone();
        profile.phone = registration.phone.clone();

        state.accounts.insert(
            registration.email.clone(),
            Account {
                password: registration.password.clone(),
                profile: profile.clone(),
            },
        );

        Ok(self.mint(&mut state, profile))
    }

    async fn refresh(&self, refresh_token: &str) -> SessionResult<SessionBundle> {
        self.check_online("refresh")?;

        let mut state = self.lock();
        let Some(user_id) = state.refresh_tokens.remove(refresh_token) else {
            return Err(Self::unauthorized("Refresh token is not valid", "refresh").into());
        };

        let profile = state
            .accounts
            .values()
            .find(|account| account.profile.id == user_id)
            .map(|account| account.profile.clone())
            .ok_or_else(|| Self::unauthorized("Account no longer exists", "refresh"))?;

        Ok(self.mint(&mut state, profile))
    }

    async fn logout(&self, access_token: &str) -> SessionResult<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online("logout")?;

        let mut state = self.lock();
        if let Some(user_id) = state.access_tokens.remove(access_token) {
            state.refresh_tokens.retain(|_, owner| *owner != user_id);
        }
        Ok(())
    }

    async fn get_current_user(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> SessionResult<UserProfile> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self
            .profile_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.check_online("get_current_user")?;

        let injected_failure = self
            .failing_profile_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(
                network_error!("get_current_user: connection reset", "in_memory_authority").into(),
            );
        }

        let state = self.lock();
        match state.access_tokens.get(access_token) {
            Some(owner) if owner == user_id => {}
            _ => {
                return Err(
                    Self::unauthorized("Access token is not valid", "get_current_user").into(),
                )
            }
        }

        state
            .accounts
            .values()
            .find(|account| account.profile.id == user_id)
            .map(|account| account.profile.clone())
            .ok_or_else(|| {
                KinderhubError::NotFound {
                    resource: format!("user {}", user_id),
                    context: ErrorContext::new("in_memory_authority"),
                }
                .into()
            })
    }
}
