//! Backend HTTP client for auth and pass-through data endpoints.
//!
//! ERROR HANDLING
//! ==============
//! Every call distinguishes a backend that answered "no" (`Rejected`) from a
//! backend that could not be reached (`Transport`). The route guard logs out
//! on the first and keeps the session on the second, so the split must stay
//! exact: a non-2xx status is always `Rejected`, never `Transport`.

#[cfg(test)]
#[path = "api_test.rs"]
mod api_test;

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::types::{AuthResponse, Credentials, Registration, UserProfile, VerifyResponse};

pub const VERIFY_TOKEN_PATH: &str = "/api/auth/verify-token";
pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REGISTER_PATH: &str = "/api/auth/register";

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by backend calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The backend answered with a non-success status.
    #[error("backend rejected request: status {status}")]
    Rejected { status: u16, body: String },

    /// The request never produced a response (DNS, refused, timeout, TLS).
    #[error("backend unreachable: {0}")]
    Transport(String),

    /// The response body did not match the expected shape.
    #[error("backend response parse failed: {0}")]
    Decode(String),

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

impl ApiError {
    /// True when the backend explicitly refused the credentials or token.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// True for failures a later attempt could plausibly get past.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Rejected { status: 429 | 500..=599, .. })
    }
}

// =============================================================================
// AUTH API TRAIT
// =============================================================================

/// Auth operations against the backend. Enables mocking in tests.
#[async_trait::async_trait]
pub trait AuthApi: Send + Sync {
    /// Validate `token` and return the user it belongs to.
    ///
    /// # Errors
    ///
    /// `Rejected` when the backend refuses the token, `Transport` when it
    /// cannot be reached, `Decode` when the body is malformed.
    async fn verify_token(&self, token: &str) -> Result<UserProfile, ApiError>;

    /// Exchange email and password for a session token.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`AuthApi::verify_token`].
    async fn login(&self, credentials: &Credentials) -> Result<AuthResponse, ApiError>;

    /// Create an account and return its first session token.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`AuthApi::verify_token`].
    async fn register(&self, registration: &Registration) -> Result<AuthResponse, ApiError>;

    /// Authenticated `GET` of a pass-through data endpoint.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`AuthApi::verify_token`].
    async fn fetch_json(&self, path: &str, token: &str) -> Result<Value, ApiError>;
}

// =============================================================================
// HTTP BACKEND
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

/// `reqwest`-backed [`AuthApi`].
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    /// Build a client rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `HttpClientBuild` if the TLS backend cannot be initialized.
    pub fn new(base_url: &str, timeouts: HttpTimeouts) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeouts.request_secs))
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .build()
            .map_err(|e| ApiError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_owned() })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        endpoint_url(&self.base_url, path)
    }

    async fn post_json<B, T>(&self, path: &str, bearer: Option<&str>, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.http.post(self.url(path)).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let text = send(request).await?;
        decode(&text)
    }
}

fn endpoint_url(base_url: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<String, ApiError> {
    let response = request
        .send()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ApiError::Transport(e.to_string()))?;
    if !status.is_success() {
        return Err(ApiError::Rejected { status: status.as_u16(), body: text });
    }
    Ok(text)
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T, ApiError> {
    serde_json::from_str(text).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait::async_trait]
impl AuthApi for HttpBackend {
    async fn verify_token(&self, token: &str) -> Result<UserProfile, ApiError> {
        let body: VerifyResponse = self
            .post_json(VERIFY_TOKEN_PATH, Some(token), &serde_json::json!({}))
            .await?;
        tracing::debug!(user_id = %body.user.id, "token verified");
        Ok(body.user)
    }

    async fn login(&self, credentials: &Credentials) -> Result<AuthResponse, ApiError> {
        self.post_json(LOGIN_PATH, None, credentials).await
    }

    async fn register(&self, registration: &Registration) -> Result<AuthResponse, ApiError> {
        self.post_json(REGISTER_PATH, None, registration).await
    }

    async fn fetch_json(&self, path: &str, token: &str) -> Result<Value, ApiError> {
        let request = self.http.get(self.url(path)).bearer_auth(token);
        let text = send(request).await?;
        decode(&text)
    }
}
