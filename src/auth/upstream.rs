// Upstream token endpoint

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::types::{ApiCredentials, FailureKind, IssuedToken, RefreshFailure, SecretValue};
use crate::clock::parse_expiry;

/// Max chars of an upstream error body kept in failure reasons
const ERROR_BODY_LIMIT: usize = 200;

/// Issues access tokens in exchange for the API key/secret
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn request_token(
        &self,
        credentials: &ApiCredentials,
    ) -> std::result::Result<IssuedToken, RefreshFailure>;
}

/// Form-post token endpoint over HTTP
///
/// Sends `client_id`, `client_secret` and `grant_type` and expects a JSON body
/// with `access_token` plus optional `expires_in` / `expires_at`, either at the
/// top level or under `data`.
#[derive(Debug, Clone)]
pub struct HttpTokenEndpoint {
    client: Client,
    url: String,
    grant_type: String,
}

impl HttpTokenEndpoint {
    pub fn new(
        base_url: &str,
        token_path: &str,
        grant_type: &str,
        request_timeout: std::time::Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: token_url(base_url, token_path),
            grant_type: grant_type.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn token_url(base_url: &str, token_path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        token_path.trim_start_matches('/')
    )
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn request_token(
        &self,
        credentials: &ApiCredentials,
    ) -> std::result::Result<IssuedToken, RefreshFailure> {
        tracing::debug!(url = %self.url, "Requesting access token");

        let form = [
            ("client_id", credentials.api_key.expose()),
            ("client_secret", credentials.api_secret.expose()),
            ("grant_type", self.grant_type.as_str()),
        ];

        let response = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let mut failure = classify_status(status, &body);
            if let Some(retry_after) = retry_after {
                failure = failure.with_retry_after(retry_after);
            }
            return Err(failure);
        }

        let body = response.text().await.map_err(classify_transport_error)?;
        parse_token_response(&body)
    }
}

fn classify_transport_error(e: reqwest::Error) -> RefreshFailure {
    if e.is_timeout() {
        RefreshFailure::new(FailureKind::Timeout, "token request timed out")
    } else if e.is_connect() || e.is_request() || e.is_body() {
        RefreshFailure::new(FailureKind::Network, format!("token request failed: {}", e))
    } else {
        RefreshFailure::new(FailureKind::Unknown, format!("token request error: {}", e))
    }
}

fn classify_status(status: StatusCode, body: &str) -> RefreshFailure {
    let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
    let reason = format!("{} - {}", status.as_u16(), snippet);

    match status.as_u16() {
        401 | 403 => RefreshFailure::new(FailureKind::InvalidCredential, reason),
        429 => RefreshFailure::new(FailureKind::RateLimited, reason),
        500..=599 => RefreshFailure::new(FailureKind::Network, reason),
        _ => RefreshFailure::new(FailureKind::Unknown, reason),
    }
}

/// Parse a token response body
pub fn parse_token_response(body: &str) -> std::result::Result<IssuedToken, RefreshFailure> {
    let json: Value = serde_json::from_str(body).map_err(|e| {
        RefreshFailure::new(
            FailureKind::Unknown,
            format!("unparseable token response: {}", e),
        )
    })?;

    let payload = json
        .get("data")
        .filter(|d| d.is_object())
        .unwrap_or(&json);

    let access_token = payload
        .get("access_token")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| {
            RefreshFailure::new(
                FailureKind::Unknown,
                "token response does not contain access_token",
            )
        })?;

    let mut token = IssuedToken::new(SecretValue::new(access_token));

    if let Some(expires_at) = payload.get("expires_at").and_then(value_to_datetime) {
        token = token.expiring_at(expires_at);
    }
    if let Some(expires_in) = payload.get("expires_in").and_then(Value::as_i64) {
        if expires_in > 0 {
            let lifetime = Duration::try_seconds(expires_in).ok_or_else(|| {
                RefreshFailure::new(
                    FailureKind::Unknown,
                    format!("token response expires_in {} is out of range", expires_in),
                )
            })?;
            token = token.expiring_in(lifetime);
        }
    }

    Ok(token)
}

fn value_to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Value::String(s) => parse_expiry(s),
        _ => None,
    }
}
