//! Strava API client: authenticated activity/stream fetches and OAuth
//! token refresh.
//!
//! Authorization failures (401) surface as a distinct error so the worker
//! can refresh-and-retry exactly once. Rate limiting (429) is absorbed
//! here with a single fixed-delay retry; the worker never sees it unless
//! the retry also fails.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

const STRAVA_API: &str = "https://www.strava.com/api/v3";
const STRAVA_OAUTH: &str = "https://www.strava.com/oauth/token";

/// Stream channels requested for every activity.
const STREAM_KEYS: &str = "time,watts,heartrate,cadence,velocity_smooth,altitude";

/// Fixed wait before the single rate-limit retry.
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StravaError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unauthorized (401): access token rejected")]
    Unauthorized,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Token pair returned by the Strava OAuth refresh endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix timestamp at which `access_token` expires.
    pub expires_at: i64,
}

/// Seam between the worker and the live API, so pipeline behavior can be
/// exercised against a mock.
#[async_trait]
pub trait ActivityApi: Send + Sync {
    async fn fetch_activity(&self, access_token: &str, activity_id: i64)
        -> Result<Value, StravaError>;

    async fn fetch_streams(&self, access_token: &str, activity_id: i64)
        -> Result<Value, StravaError>;

    async fn refresh_access_token(&self, refresh_token: &str)
        -> Result<TokenResponse, StravaError>;
}

pub struct StravaClient {
    http: reqwest::Client,
    client_id: i64,
    client_secret: String,
    api_base: String,
    oauth_url: String,
}

impl StravaClient {
    pub fn new(client_id: i64, client_secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id,
            client_secret,
            api_base: STRAVA_API.to_string(),
            oauth_url: STRAVA_OAUTH.to_string(),
        }
    }

    /// Point the client at a different API host (integration harnesses).
    pub fn with_endpoints(mut self, api_base: String, oauth_url: String) -> Self {
        self.api_base = api_base;
        self.oauth_url = oauth_url;
        self
    }

    /// Authenticated GET with one fixed-delay retry on 429.
    async fn get_json(
        &self,
        url: &str,
        access_token: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, StravaError> {
        let send = || {
            self.http
                .get(url)
                .bearer_auth(access_token)
                .query(query)
                .send()
        };

        let mut resp = send().await?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            log::warn!(
                "Strava rate limit on {}; retrying once in {:?}",
                url,
                RATE_LIMIT_DELAY
            );
            tokio::time::sleep(RATE_LIMIT_DELAY).await;
            resp = send().await?;
        }

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(StravaError::Unauthorized);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(StravaError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.json().await?)
    }
}

#[async_trait]
impl ActivityApi for StravaClient {
    async fn fetch_activity(
        &self,
        access_token: &str,
        activity_id: i64,
    ) -> Result<Value, StravaError> {
        let url = format!("{}/activities/{}", self.api_base, activity_id);
        self.get_json(&url, access_token, &[]).await
    }

    async fn fetch_streams(
        &self,
        access_token: &str,
        activity_id: i64,
    ) -> Result<Value, StravaError> {
        let url = format!("{}/activities/{}/streams", self.api_base, activity_id);
        self.get_json(
            &url,
            access_token,
            &[("keys", STREAM_KEYS), ("key_by_type", "true")],
        )
        .await
    }

    /// Exchange a refresh token for a new pair. No local retry: failure
    /// propagates to the worker, which treats it as a hard failure.
    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenResponse, StravaError> {
        let client_id = self.client_id.to_string();
        let resp = self
            .http
            .post(&self.oauth_url)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StravaError::RefreshFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        Ok(resp.json().await?)
    }
}
