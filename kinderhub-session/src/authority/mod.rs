//! Remote Session Authority
//!
//! The backend endpoints that issue and validate credentials. The accessor
//! only talks to them through [`SessionAuthority`].

use crate::SessionResult;
use async_trait::async_trait;
use kinderhub_core::{Credentials, Registration, SessionBundle, UserProfile};

pub mod http;
pub mod memory;

pub use http::HttpSessionAuthority;
pub use memory::InMemoryAuthority;

/// Trait for the remote authentication backend
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    /// Exchange credentials for a session bundle
    async fn sign_in(&self, credentials: &Credentials) -> SessionResult<SessionBundle>;

    /// Create an account and return its first session bundle
    async fn sign_up(&self, registration: &Registration) -> SessionResult<SessionBundle>;

    /// Mint new tokens from a refresh token
    async fn refresh(&self, refresh_token: &str) -> SessionResult<SessionBundle>;

    /// Invalidate the session server-side
    async fn logout(&self, access_token: &str) -> SessionResult<()>;

    /// Fetch the authoritative profile of `user_id`
    async fn get_current_user(&self, access_token: &str, user_id: &str)
        -> SessionResult<UserProfile>;
}
