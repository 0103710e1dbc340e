//! Shared fixtures for the session integration tests

#![allow(dead_code)]

use kinderhub_core::{RefreshPolicy, Role, SessionBundle, UserProfile};
use kinderhub_session::{
    InMemoryAuthority, MemoryBackend, SessionAuthority, SessionState, SessionView, StorageBackend,
};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::watch;

// Initialize tracing only once
static TRACING: LazyLock<()> = LazyLock::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_writer(std::io::sink)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
    }
});

pub const EMAIL: &str = "parent@example.com";
pub const PASSWORD: &str = "correct horse";

/// One origin: a shared backend plus the authority every view talks to
pub struct Origin {
    pub backend: Arc<MemoryBackend>,
    pub authority: Arc<InMemoryAuthority>,
}

pub fn init_tracing() {
    LazyLock::force(&TRACING);
}

impl Origin {
    pub fn new() -> Self {
        init_tracing();

        let authority = Arc::new(InMemoryAuthority::new());
        authority.add_user(profile("42", Role::User), PASSWORD);

        Self {
            backend: Arc::new(MemoryBackend::new()),
            authority,
        }
    }

    pub fn open_view(&self) -> SessionView {
        self.open_view_with(RefreshPolicy::default())
    }

    pub fn open_view_with(&self, policy: RefreshPolicy) -> SessionView {
        let backend: Arc<dyn StorageBackend> = self.backend.clone();
        let authority: Arc<dyn SessionAuthority> = self.authority.clone();
        SessionView::open(backend, authority, policy)
    }

    /// A session for user 42 as the authority would issue it
    pub fn session(&self) -> SessionBundle {
        self.authority
            .issue_session("42")
            .expect("user 42 is registered")
    }
}

pub fn profile(id: &str, role: Role) -> UserProfile {
    let mut profile = UserProfile::new(id, EMAIL, role);
    profile.first_name = Some("Alex".to_string());
    profile
}

/// Wait until `predicate` holds for the watched state, or fail after a second
pub async fn wait_for_state<F>(rx: &mut watch::Receiver<SessionState>, predicate: F)
where
    F: Fn(&SessionState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|state| predicate(state)))
        .await
        .expect("timed out waiting for session state")
        .expect("session accessor dropped");
}
