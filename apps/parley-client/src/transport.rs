use std::{
    future::Future,
    sync::{Mutex, PoisonError},
};

use reqwest::{
    header::{HeaderMap, COOKIE, SET_COOKIE},
    Method, StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const REFRESH_COOKIE_NAME: &str = "refresh_token";
const MAX_REFRESH_COOKIE_CHARS: usize = 256;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("base url is invalid")]
    InvalidBaseUrl,
    #[error("request failed: {0}")]
    Network(String),
    #[error("response body could not be decoded")]
    Decode,
    #[error("server rejected the request with status {0}")]
    Rejected(u16),
    #[error("no refresh credential is held")]
    MissingRefreshCredential,
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        Self::Network(value.without_url().to_string())
    }
}

/// A replayable API call. Kept owned so the same request can be sent twice.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    #[must_use]
    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
        }
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::DELETE,
            path: path.into(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    /// Decodes the body as JSON.
    ///
    /// # Errors
    /// Returns [`TransportError::Decode`] when the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_str(&self.body).map_err(|_| TransportError::Decode)
    }
}

/// The network seam under the session controller.
pub trait SessionTransport: Send + Sync {
    /// Sends `request`, attaching `token` as a bearer credential when present.
    fn send(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> impl Future<Output = Result<ApiResponse, TransportError>> + Send;

    /// Exchanges the out-of-band refresh credential for a new access token.
    fn renew(&self) -> impl Future<Output = Result<String, TransportError>> + Send;
}

#[derive(Debug, Serialize)]
struct Registration<'a> {
    email: &'a str,
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub email: String,
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub expires_in_secs: i64,
    pub user: AuthenticatedUser,
}

/// reqwest transport that carries the refresh cookie itself instead of
/// relying on a cookie jar.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    refresh_cookie: Mutex<Option<String>>,
}

impl HttpTransport {
    /// # Errors
    /// Returns [`TransportError::InvalidBaseUrl`] when `base_url` does not parse
    /// or cannot carry paths.
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url).map_err(|_| TransportError::InvalidBaseUrl)?;
        if base_url.cannot_be_a_base() {
            return Err(TransportError::InvalidBaseUrl);
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            refresh_cookie: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|_| TransportError::InvalidBaseUrl)
    }

    fn stored_cookie(&self) -> Option<String> {
        self.refresh_cookie
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn capture_cookie(&self, headers: &HeaderMap) {
        let Some(value) = refresh_cookie_from(headers) else {
            return;
        };
        let mut stored = self
            .refresh_cookie
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *stored = (!value.is_empty()).then_some(value);
    }

    #[must_use]
    pub fn has_refresh_credential(&self) -> bool {
        self.stored_cookie().is_some()
    }

    async fn authenticate<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<AuthSession, TransportError> {
        let response = self
            .client
            .post(self.endpoint(path)?)
            .json(body)
            .send()
            .await?;
        self.capture_cookie(response.headers());
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(event = "client.authenticate", outcome = "rejected", status = status.as_u16());
            return Err(TransportError::Rejected(status.as_u16()));
        }
        response.json().await.map_err(|_| TransportError::Decode)
    }

    /// Signs in with the account email.
    ///
    /// # Errors
    /// Returns [`TransportError::Rejected`] for non-success statuses.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, TransportError> {
        self.authenticate("/auth/login", &Credentials { email, password })
            .await
    }

    /// # Errors
    /// Returns [`TransportError::Rejected`] for non-success statuses.
    pub async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<AuthSession, TransportError> {
        self.authenticate(
            "/auth/register",
            &Registration {
                email,
                username,
                password,
            },
        )
        .await
    }

    /// Revokes the held refresh credential and forgets it locally.
    ///
    /// # Errors
    /// Returns [`TransportError::Network`] when the request cannot be sent.
    pub async fn logout(&self) -> Result<(), TransportError> {
        let mut request = self.client.post(self.endpoint("/auth/logout")?);
        if let Some(cookie) = self.stored_cookie() {
            request = request.header(COOKIE, format!("{REFRESH_COOKIE_NAME}={cookie}"));
        }
        let response = request.send().await;
        *self
            .refresh_cookie
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        response?;
        Ok(())
    }
}

fn refresh_cookie_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == REFRESH_COOKIE_NAME)
        .map(|(_, value)| value.to_owned())
        .filter(|value| value.len() <= MAX_REFRESH_COOKIE_CHARS)
}

#[derive(Debug, Deserialize)]
struct RenewedToken {
    access_token: String,
}

impl SessionTransport for HttpTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        token: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), self.endpoint(&request.path)?);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(ApiResponse { status, body })
    }

    async fn renew(&self) -> Result<String, TransportError> {
        let cookie = self
            .stored_cookie()
            .ok_or(TransportError::MissingRefreshCredential)?;
        let response = self
            .client
            .post(self.endpoint("/auth/refresh")?)
            .header(COOKIE, format!("{REFRESH_COOKIE_NAME}={cookie}"))
            .send()
            .await?;
        self.capture_cookie(response.headers());
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected(status.as_u16()));
        }
        let renewed: RenewedToken = response.json().await.map_err(|_| TransportError::Decode)?;
        Ok(renewed.access_token)
    }
}
