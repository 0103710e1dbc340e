//! Kinderhub Session - client-side session cache and auth gateway
//!
//! The pieces a view of the marketplace client uses to know who is signed in:
//!
//! - [`SessionStore`]: durable, defensively decoded storage of the session
//!   bundle over a pluggable [`StorageBackend`]
//! - [`SyncChannel`]: payload-free "re-check now" signal shared by every view
//!   attached to the same backend
//! - [`SessionAccessor`]: reactive current-user state plus login, logout and
//!   profile refresh against a [`SessionAuthority`]
//!
//! A *view* is one store, channel and accessor attached to a shared backend;
//! [`SessionView::open`] wires them together.

pub mod accessor;
pub mod authority;
pub mod channel;
pub mod store;

use std::sync::Arc;

pub use accessor::{SessionAccessor, SessionPhase, SessionState};
pub use authority::{HttpSessionAuthority, InMemoryAuthority, SessionAuthority};
pub use channel::{Subscription, SyncChannel};
pub use store::{
    FileBackend, MemoryBackend, SessionStore, StorageBackend, StorageChange, UnavailableBackend,
    ViewId,
};

use kinderhub_core::{KinderhubError, RefreshPolicy};

/// Session-layer error type
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Core(#[from] KinderhubError),

    #[error("Not authenticated: {message}")]
    NotAuthenticated { message: String },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The session changed while the operation was in flight; its result was dropped
    #[error("Operation superseded: {operation}")]
    Superseded { operation: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    /// Create a not-authenticated error
    pub fn not_authenticated<S: Into<String>>(message: S) -> Self {
        Self::NotAuthenticated {
            message: message.into(),
        }
    }

    /// Create a validation error for a field
    pub fn validation<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a superseded error
    pub fn superseded<S: Into<String>>(operation: S) -> Self {
        Self::Superseded {
            operation: operation.into(),
        }
    }

    /// Transient failures worth retrying
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Core(error) => error.is_recoverable(),
            _ => false,
        }
    }
}

/// One view attached to a shared storage backend
pub struct SessionView {
    pub store: SessionStore,
    pub accessor: SessionAccessor,
}

impl SessionView {
    /// Attach a new view to `backend`
    ///
    /// Cross-view notifications are forwarded only when called inside a tokio
    /// runtime and the backend exposes a change feed.
    pub fn open(
        backend: Arc<dyn StorageBackend>,
        authority: Arc<dyn SessionAuthority>,
        policy: RefreshPolicy,
    ) -> Self {
        let view_id = ViewId::new();
        let channel = SyncChannel::attach(view_id, backend.as_ref());
        let store = SessionStore::new(backend, channel);
        let accessor = SessionAccessor::new(store.clone(), authority, policy);

        Self { store, accessor }
    }

    pub fn view_id(&self) -> ViewId {
        self.store.view_id()
    }
}
