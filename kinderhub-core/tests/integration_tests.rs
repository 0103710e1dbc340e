//! Integration tests for kinderhub-core infrastructure

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use kinderhub_core::{
    config_error, init_logging, network_error, retry_async, retry_async_if, storage_error,
    validation_error, with_timeout, ErrorContext, KinderhubError, LogFormat, LoggingConfig,
    RetryConfig,
};

#[tokio::test]
async fn test_error_handling() {
    let error = storage_error!("Local storage is disabled", "session_store");

    match &error {
        KinderhubError::Storage {
            message, context, ..
        } => {
            assert_eq!(message, "Local storage is disabled");
            assert_eq!(context.component, "session_store");
            assert!(!context.error_id.is_empty());
        }
        _ => panic!("Expected Storage error"),
    }

    // Should not panic without a subscriber
    error.log();

    let network = network_error!("Connection refused", "http_authority");
    assert!(network.is_recoverable());
    assert_eq!(network.retry_delay_ms(), Some(1000));

    let config = config_error!("Invalid config", "test");
    assert!(!config.is_recoverable());
    assert!(config.retry_delay_ms().is_none());

    let validation = validation_error!("must not be empty", "access_token", "accessor");
    match validation {
        KinderhubError::Validation { field, .. } => {
            assert_eq!(field.as_deref(), Some("access_token"))
        }
        _ => panic!("Expected Validation error"),
    }

    let server_error = KinderhubError::Api {
        status: 503,
        message: "maintenance".to_string(),
        context: ErrorContext::new("test"),
    };
    assert!(server_error.is_recoverable());

    let client_error = KinderhubError::Api {
        status: 422,
        message: "bad input".to_string(),
        context: ErrorContext::new("test"),
    };
    assert!(!client_error.is_recoverable());
}

#[tokio::test]
async fn test_logging_initialization() {
    let config = LoggingConfig {
        level: "debug".to_string(),
        format: LogFormat::Compact,
        filter_directives: vec!["kinderhub_core=debug".to_string()],
        ..Default::default()
    };

    // A subscriber can only be installed once per process; a second call must
    // report an error instead of panicking.
    let _ = init_logging(&config);
    assert!(init_logging(&config).is_err());
}

#[tokio::test]
async fn test_logging_to_file_requires_path() {
    let config = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..Default::default()
    };
    assert!(init_logging(&config).is_err());
}

#[tokio::test]
async fn test_retry_mechanism() {
    let attempt_count = Arc::new(AtomicUsize::new(0));

    let operation = {
        let attempt_count = Arc::clone(&attempt_count);
        move || {
            let count = attempt_count.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if count < 3 {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "Temporary failure",
                    ))
                } else {
                    Ok("Success")
                }
            }
        }
    };

    let config = RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 10,
        max_delay_ms: 100,
        backoff_multiplier: 2.0,
        jitter: false,
    };

    let result = retry_async(operation, config, "test_operation").await;
    assert_eq!(result.unwrap(), "Success");
    assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_once_does_not_retry() {
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempt_count);

    let result: Result<(), std::io::Error> = retry_async(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(std::io::Error::new(std::io::ErrorKind::Other, "down")) }
        },
        RetryConfig::once(),
        "single_shot",
    )
    .await;

    assert!(result.is_err());
    assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_mechanism() {
    let quick_operation = async {
        sleep(Duration::from_millis(10)).await;
        "Success"
    };

    let result = with_timeout(quick_operation, 200, "quick_test").await;
    assert_eq!(result.unwrap(), "Success");

    let slow_operation = async {
        sleep(Duration::from_millis(300)).await;
        "Should not reach here"
    };

    let result = with_timeout(slow_operation, 50, "slow_test").await;
    match result {
        Err(KinderhubError::Timeout {
            operation,
            duration_ms,
            ..
        }) => {
            assert_eq!(operation, "slow_test");
            assert_eq!(duration_ms, 50);
        }
        _ => panic!("Expected Timeout error"),
    }
}

#[test]
fn test_refresh_policy_drives_retry_config() {
    let policy = kinderhub_core::RefreshPolicy {
        max_attempts: 0,
        initial_delay_ms: 50,
        invalidate_on_failure: true,
    };

    let retry = RetryConfig::from(&policy);
    // Zero attempts would never call the backend at all
    assert_eq!(retry.max_attempts, 1);
    assert_eq!(retry.initial_delay_ms, 50);
}

#[test]
fn test_rate_limit_and_auth_classification() {
    let throttled = KinderhubError::Api {
        status: 429,
        message: "slow down".to_string(),
        context: ErrorContext::new("http_authority"),
    };
    assert!(throttled.is_recoverable());
    assert_eq!(throttled.retry_delay_ms(), Some(5000));

    let rejected = KinderhubError::Authentication {
        message: "Invalid email or password".to_string(),
        context: ErrorContext::new("http_authority"),
    };
    assert!(rejected.is_auth_failure());
    assert!(!rejected.is_recoverable());
}

#[test]
fn test_backoff_doubles_until_cap() {
    let config = RetryConfig {
        max_attempts: 5,
        initial_delay_ms: 100,
        max_delay_ms: 300,
        backoff_multiplier: 2.0,
        jitter: false,
    };

    assert_eq!(config.delay_for(1), Duration::from_millis(100));
    assert_eq!(config.delay_for(2), Duration::from_millis(200));
    assert_eq!(config.delay_for(3), Duration::from_millis(300));
    assert_eq!(config.delay_for(4), Duration::from_millis(300));
}

#[test]
fn test_storage_error_message_can_format_its_source() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume");

    let error = storage_error!(format!("Failed to write auth_tokens: {}", io), "file_backend", io);

    match error {
        KinderhubError::Storage {
            message, source, ..
        } => {
            assert_eq!(message, "Failed to write auth_tokens: read-only volume");
            assert_eq!(source.unwrap().to_string(), "read-only volume");
        }
        _ => panic!("Expected Storage error"),
    }
}

#[tokio::test]
async fn test_retry_stops_on_rejected_error() {
    let attempt_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempt_count);
    let config = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        jitter: false,
        ..Default::default()
    };

    let result: Result<(), KinderhubError> = retry_async_if(
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(KinderhubError::Authentication {
                    message: "token revoked".to_string(),
                    context: ErrorContext::new("test"),
                })
            }
        },
        config,
        "fetch_profile",
        KinderhubError::is_recoverable,
    )
    .await;

    assert!(matches!(result, Err(KinderhubError::Authentication { .. })));
    assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
}
