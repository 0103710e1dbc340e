//! HTTP client for the backend's auth endpoints

use super::SessionAuthority;
use crate::SessionResult;
use async_trait::async_trait;
use kinderhub_core::{
    ApiConfig, AuthEndpoints, Credentials, ErrorContext, KinderhubError, KinderhubResult,
    Registration, SessionBundle, UserProfile,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// reqwest-based [`SessionAuthority`]
pub struct HttpSessionAuthority {
    client: reqwest::Client,
    base_url: String,
    endpoints: AuthEndpoints,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Error body shape used by the backend
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpSessionAuthority {
    /// Create a new client
    pub fn new(config: &ApiConfig) -> KinderhubResult<Self> {
        let parsed = url::Url::parse(&config.base_url).map_err(|e| KinderhubError::Config {
            message: format!("Invalid api.base_url '{}': {}", config.base_url, e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("http_authority").with_operation("create_client"),
        })?;

        let client = create_http_client(config)?;
        info!("Created session authority client for {}", parsed);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            endpoints: config.endpoints.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    fn user_url(&self, user_id: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(user_id.as_bytes()).collect();
        self.url(&self.endpoints.current_user.replace("{id}", &encoded))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
    ) -> KinderhubResult<reqwest::Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                KinderhubError::Timeout {
                    operation: operation.to_string(),
                    duration_ms: 0,
                    context: ErrorContext::new("http_authority").with_operation(operation),
                }
            } else {
                KinderhubError::Network {
                    message: format!("Failed to send {} request: {}", operation, e),
                    source: Some(Box::new(e)),
                    context: ErrorContext::new("http_authority")
                        .with_operation(operation)
                        .with_suggestion("Check network connectivity and api.base_url"),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(handle_response_error(response, operation).await);
        }

        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
        operation: &str,
    ) -> KinderhubResult<T> {
        let body = response.text().await.map_err(|e| KinderhubError::Network {
            message: format!("Failed to read {} response: {}", operation, e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("http_authority").with_operation(operation),
        })?;

        serde_json::from_str(&body).map_err(|e| KinderhubError::Internal {
            message: format!("Unexpected {} response: {}", operation, e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("http_authority")
                .with_operation(operation)
                .with_suggestion("Check that api.base_url points at the Kinderhub backend"),
        })
    }
}

#[async_trait]
impl SessionAuthority for HttpSessionAuthority {
    #[tracing::instrument(skip(self, credentials), fields(email = %credentials.email))]
    async fn sign_in(&self, credentials: &Credentials) -> SessionResult<SessionBundle> {
        let request = self
            .client
            .post(self.url(&self.endpoints.sign_in))
            .json(credentials);
        let response = self.send(request, "sign_in").await?;
        Ok(Self::decode(response, "sign_in").await?)
    }

    #[tracing::instrument(skip(self, registration), fields(email = %registration.email))]
    async fn sign_up(&self, registration: &Registration) -> SessionResult<SessionBundle> {
        let request = self
            .client
            .post(self.url(&self.endpoints.sign_up))
            .json(registration);
        let response = self.send(request, "sign_up").await?;
        Ok(Self::decode(response, "sign_up").await?)
    }

    #[tracing::instrument(skip_all)]
    async fn refresh(&self, refresh_token: &str) -> SessionResult<SessionBundle> {
        let request = self
            .client
            .post(self.url(&self.endpoints.refresh))
            .json(&RefreshRequest { refresh_token });
        let response = self.send(request, "refresh").await?;
        Ok(Self::decode(response, "refresh").await?)
    }

    #[tracing::instrument(skip_all)]
    async fn logout(&self, access_token: &str) -> SessionResult<()> {
        let request = self
            .client
            .post(self.url(&self.endpoints.logout))
            .bearer_auth(access_token);
        self.send(request, "logout").await?;
        debug!("Remote session invalidated");
        Ok(())
    }

    #[tracing::instrument(skip(self, access_token))]
    async fn get_current_user(
        &self,
        access_token: &str,
        user_id: &str,
    ) -> SessionResult<UserProfile> {
        let request = self
            .client
            .get(self.user_url(user_id))
            .bearer_auth(access_token);
        let response = self.send(request, "get_current_user").await?;
        Ok(Self::decode(response, "get_current_user").await?)
    }
}

/// Build the HTTP client with common configuration
fn create_http_client(config: &ApiConfig) -> KinderhubResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.timeout_seconds))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| KinderhubError::Config {
            message: format!("Failed to create HTTP client: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("http_authority").with_operation("create_client"),
        })
}

/// Map a non-success response to an error, keeping the server's message
async fn handle_response_error(response: reqwest::Response, operation: &str) -> KinderhubError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .and_then(|parsed| parsed.message.or(parsed.error))
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string()
            } else {
                body.clone()
            }
        });

    let context = ErrorContext::new("http_authority")
        .with_operation(operation)
        .with_metadata("status", &status.as_u16().to_string());

    match status.as_u16() {
        401 | 403 => KinderhubError::Authentication {
            message,
            context: context.with_suggestion("Sign in again"),
        },
        404 => KinderhubError::NotFound {
            resource: message,
            context,
        },
        code => KinderhubError::Api {
            status: code,
            message,
            context,
        },
    }
}
