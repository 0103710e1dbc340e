//! Unified error handling
//!
//! Structured error types carrying context and recovery suggestions, shared by
//! the session crate and the CLI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{error, warn};

pub type KinderhubResult<T> = Result<T, KinderhubError>;

/// Underlying cause attached to the sourced variants
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Where and when a failure happened, plus hints for the user
///
/// `error_id` appears in every log line for the error so a report from the
/// CLI can be matched to the log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error_id: String,
    pub timestamp: DateTime<Utc>,
    /// e.g. `session_store`, `http_authority`
    pub component: String,
    pub operation: Option<String>,
    pub metadata: HashMap<String, String>,
    pub recovery_suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.into(),
            operation: None,
            metadata: HashMap::new(),
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.recovery_suggestions.push(suggestion.to_string());
        self
    }
}

/// Every failure the session client can report
#[derive(Error, Debug)]
pub enum KinderhubError {
    #[error("Session storage failed: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<BoxedSource>,
        context: ErrorContext,
    },

    #[error("Invalid configuration: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxedSource>,
        context: ErrorContext,
    },

    #[error("Could not reach the Kinderhub API: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<BoxedSource>,
        context: ErrorContext,
    },

    #[error("Authentication failed: {message}")]
    Authentication {
        message: String,
        context: ErrorContext,
    },

    /// Non-success response from the backend that is not an auth failure
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        context: ErrorContext,
    },

    #[error("Invalid input: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        context: ErrorContext,
    },

    #[error("Not found: {resource}")]
    NotFound {
        resource: String,
        context: ErrorContext,
    },

    #[error("{operation} timed out after {duration_ms} ms")]
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unexpected failure: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<BoxedSource>,
        context: ErrorContext,
    },
}

impl KinderhubError {
    /// Get the error context
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            KinderhubError::Storage { context, .. } => Some(context),
            KinderhubError::Config { context, .. } => Some(context),
            KinderhubError::Network { context, .. } => Some(context),
            KinderhubError::Authentication { context, .. } => Some(context),
            KinderhubError::Api { context, .. } => Some(context),
            KinderhubError::Validation { context, .. } => Some(context),
            KinderhubError::NotFound { context, .. } => Some(context),
            KinderhubError::Timeout { context, .. } => Some(context),
            KinderhubError::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Transient failures: the backend may answer if asked again
    pub fn is_recoverable(&self) -> bool {
        match self {
            KinderhubError::Network { .. } | KinderhubError::Timeout { .. } => true,
            KinderhubError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Suggested wait before asking the backend again
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            KinderhubError::Network { .. } => Some(1000),
            KinderhubError::Timeout { .. } => Some(2000),
            KinderhubError::Api { status: 429, .. } => Some(5000),
            KinderhubError::Api { status, .. } if *status >= 500 => Some(1000),
            _ => None,
        }
    }

    /// True when the backend rejected the credentials or token
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, KinderhubError::Authentication { .. })
    }

    /// Log at a level matching how much the user should care
    pub fn log(&self) {
        let error_id = self.context().map(|c| c.error_id.as_str());
        match self {
            // Expected outcomes of a stale session or a typo
            KinderhubError::Authentication { .. } | KinderhubError::NotFound { .. } => {
                warn!(error_id = ?error_id, error = %self, "Request rejected by backend");
            }
            KinderhubError::Network { .. }
            | KinderhubError::Timeout { .. }
            | KinderhubError::Storage { .. } => {
                warn!(error_id = ?error_id, error = %self, "Transient error (may be recoverable)");
            }
            KinderhubError::Config { .. } | KinderhubError::Validation { .. } => {
                error!(error_id = ?error_id, error = %self, "Configuration or validation error");
            }
            _ => {
                error!(error_id = ?error_id, error = %self, "Unexpected error");
            }
        }
    }
}

// Constructors that fill in an `ErrorContext` for the given component.

#[doc(hidden)]
#[macro_export]
macro_rules! __sourced_error {
    ($variant:ident, $msg:expr, $context:expr $(, $source:expr)?) => {{
        // The message may borrow the source, so render it before boxing
        let message = $msg.to_string();
        #[allow(unused_mut, unused_assignments)]
        let mut source: Option<$crate::BoxedSource> = None;
        $(source = Some(Box::new($source));)?
        $crate::KinderhubError::$variant {
            message,
            source,
            context: $context,
        }
    }};
}

#[macro_export]
macro_rules! storage_error {
    ($msg:expr, $component:expr $(, $source:expr)?) => {
        $crate::__sourced_error!(
            Storage,
            $msg,
            $crate::ErrorContext::new($component)
            $(, $source)?
        )
    };
}

#[macro_export]
macro_rules! network_error {
    ($msg:expr, $component:expr $(, $source:expr)?) => {
        $crate::__sourced_error!(
            Network,
            $msg,
            $crate::ErrorContext::new($component)
                .with_suggestion("Check that api.base_url is reachable from this machine")
            $(, $source)?
        )
    };
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr, $component:expr) => {
        $crate::__sourced_error!(
            Config,
            $msg,
            $crate::ErrorContext::new($component)
                .with_suggestion("Run 'kinderhub config --validate' to see every problem")
                .with_suggestion("Run 'kinderhub config --init' to write a fresh default file")
        )
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr, $field:expr, $component:expr) => {
        $crate::KinderhubError::Validation {
            message: $msg.to_string(),
            field: Some($field.to_string()),
            context: $crate::ErrorContext::new($component),
        }
    };
}
