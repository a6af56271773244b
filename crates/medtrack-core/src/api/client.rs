//! API client for the MedTrack REST API.
//!
//! Every request goes through the same two hooks: the stored bearer token is
//! attached on the way out, and the response status is classified on the way
//! back. A 401 from any endpoint broadcasts a session invalidation on
//! `AuthEvents` before the error is handed back to the caller. Nothing here
//! retries; a 401 is terminal for the session.

use std::time::Duration;

use reqwest::{header, Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{AuthEvents, Credentials};
use crate::config::Config;
use crate::models::{AuthResponse, LoginRequest, NewAccount, PushSubscription, UserProfile};

use super::ApiError;

// ============================================================================
// Endpoints
// ============================================================================

const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const LOGOUT_PATH: &str = "/auth/logout";
const PROFILE_PATH: &str = "/auth/me";
const PUSH_SUBSCRIBE_PATH: &str = "/notifications/subscribe";

/// How loudly failures of a request are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    #[default]
    Normal,
    /// Failures are expected (e.g. validating a possibly stale session) and
    /// are logged at debug only. Classification and 401 handling are unchanged.
    Silent,
}

/// API client for MedTrack.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling,
/// and the credential store and event bus are shared handles.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    events: AuthEvents,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(config: &Config, credentials: Credentials, events: AuthEvents) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url().to_string(),
            credentials,
            events,
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn events(&self) -> &AuthEvents {
        &self.events
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Outbound hook: attach the stored token, if any.
    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        let token = match self.credentials.token() {
            Ok(token) => token,
            Err(e) => {
                // Sending unauthenticated lets the server decide
                warn!(error = %e, "Failed to read stored token");
                None
            }
        };
        if let Some(token) = token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::Storage("Stored token is not a valid header value".to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Inbound hook: classify the response status.
    async fn check_response(&self, response: Response, path: &str, mode: RequestMode) -> Result<Response, ApiError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = ApiError::from_status(status, &body);

        match error {
            ApiError::Unauthorized => {
                if mode == RequestMode::Silent {
                    debug!(path, "Token rejected, invalidating session");
                } else {
                    info!(path, "Token rejected, invalidating session");
                }
                self.events.emit_invalidate();
            }
            ref e if e.is_expected() => {
                debug!(path, status = status.as_u16(), error = %e, "Request refused");
            }
            ref e => {
                if mode == RequestMode::Silent {
                    debug!(path, status = status.as_u16(), error = %e, "Request failed");
                } else {
                    warn!(path, status = status.as_u16(), error = %e, "Unexpected response");
                }
            }
        }

        Err(error)
    }

    async fn execute(&self, request: RequestBuilder, path: &str, mode: RequestMode) -> Result<Response, ApiError> {
        let response = match request.headers(self.auth_headers()?).send().await {
            Ok(response) => response,
            Err(e) => {
                if mode == RequestMode::Silent {
                    debug!(path, error = %e, "Request could not be sent");
                } else {
                    warn!(path, error = %e, "Request could not be sent");
                }
                return Err(e.into());
            }
        };
        self.check_response(response, path, mode).await
    }

    async fn parse<T: DeserializeOwned>(response: Response, path: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", path, e)))
    }

    // ===== Generic Helpers =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, mode: RequestMode) -> Result<T, ApiError> {
        let request = self.client.get(self.url(path));
        let response = self.execute(request, path, mode).await?;
        Self::parse(response, path).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        mode: RequestMode,
    ) -> Result<T, ApiError> {
        let request = self.client.post(self.url(path)).json(body);
        let response = self.execute(request, path, mode).await?;
        Self::parse(response, path).await
    }

    /// POST where the response body is irrelevant.
    pub async fn post_empty<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
        mode: RequestMode,
    ) -> Result<(), ApiError> {
        let mut request = self.client.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        self.execute(request, path, mode).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str, mode: RequestMode) -> Result<(), ApiError> {
        let request = self.client.delete(self.url(path));
        self.execute(request, path, mode).await?;
        Ok(())
    }

    // ===== Auth Endpoints =====

    pub async fn login(&self, request: &LoginRequest) -> Result<AuthResponse, ApiError> {
        self.post_json(LOGIN_PATH, request, RequestMode::Normal).await
    }

    pub async fn register(&self, account: &NewAccount) -> Result<(), ApiError> {
        self.post_empty(REGISTER_PATH, Some(account), RequestMode::Normal).await
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.post_empty::<()>(LOGOUT_PATH, None, RequestMode::Normal).await
    }

    pub async fn fetch_profile(&self, mode: RequestMode) -> Result<UserProfile, ApiError> {
        self.get_json(PROFILE_PATH, mode).await
    }

    // ===== Notifications =====

    pub async fn submit_push_subscription(&self, subscription: &PushSubscription) -> Result<(), ApiError> {
        self.post_empty(PUSH_SUBSCRIBE_PATH, Some(subscription), RequestMode::Normal).await
    }
}
