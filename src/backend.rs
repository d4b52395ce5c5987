//! Backend REST surface consumed by the uploader and the health probe.

use crate::models::{AccountId, ReportKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, header::RETRY_AFTER};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_with::skip_serializing_none;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response (HTTP {status}): {detail}")]
    Deserialize { status: u16, detail: String },
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Request(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidateRequest {
    pub account: AccountId,
    pub kind: ReportKind,
    pub content: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadMetadata {
    pub filename: String,
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub extension_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadRequest {
    pub account: AccountId,
    pub kind: ReportKind,
    pub content: String,
    pub metadata: UploadMetadata,
}

/// `{success, data?, message?}` as returned by every backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidateData {
    pub valid: bool,
    #[serde(default)]
    pub rows: u64,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UploadData {
    #[serde(default)]
    pub rows_processed: u64,
    #[serde(default)]
    pub rows_skipped: u64,
    #[serde(default)]
    pub import_id: Option<String>,
}

/// HTTP status plus decoded body. Non-2xx replies are data, not errors;
/// the uploader owns the policy for them.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendReply<T> {
    pub status: u16,
    pub body: ApiEnvelope<T>,
    pub retry_after: Option<Duration>,
}

impl<T> BackendReply<T> {
    pub fn new(status: u16, body: ApiEnvelope<T>) -> Self {
        Self {
            status,
            body,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// `GET /health`; returns the HTTP status.
    async fn health(&self) -> Result<u16, BackendError>;
    async fn validate(
        &self,
        request: &ValidateRequest,
    ) -> Result<BackendReply<ValidateData>, BackendError>;
    async fn upload(&self, request: &UploadRequest)
    -> Result<BackendReply<UploadData>, BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, http: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<BackendReply<T>, BackendError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .authorize(self.http.post(url))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| parse_retry_after(raw, Utc::now()));
        let text = response.text().await?;
        let body = decode_envelope(status, &text)?;
        Ok(BackendReply {
            status: status.as_u16(),
            body,
            retry_after,
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn health(&self) -> Result<u16, BackendError> {
        let url = format!("{}/health", self.base_url);
        let response = self.authorize(self.http.get(url)).send().await?;
        Ok(response.status().as_u16())
    }

    async fn validate(
        &self,
        request: &ValidateRequest,
    ) -> Result<BackendReply<ValidateData>, BackendError> {
        self.post_json("/csv/validate", request).await
    }

    async fn upload(
        &self,
        request: &UploadRequest,
    ) -> Result<BackendReply<UploadData>, BackendError> {
        self.post_json("/csv/upload", request).await
    }
}

/// 2xx bodies must decode; error bodies that are not the JSON envelope are
/// kept as the message so the rejection reason is not lost.
fn decode_envelope<T: DeserializeOwned>(
    status: StatusCode,
    text: &str,
) -> Result<ApiEnvelope<T>, BackendError> {
    if text.trim().is_empty() {
        return Ok(if status.is_success() {
            ApiEnvelope {
                success: true,
                data: None,
                message: None,
            }
        } else {
            ApiEnvelope::failed(format!("HTTP {}", status.as_u16()))
        });
    }
    match serde_json::from_str::<ApiEnvelope<T>>(text) {
        Ok(envelope) => Ok(envelope),
        Err(err) if status.is_success() => Err(BackendError::Deserialize {
            status: status.as_u16(),
            detail: err.to_string(),
        }),
        Err(_) => {
            let message = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|value| {
                    value
                        .get("message")
                        .or_else(|| value.get("error"))
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| text.chars().take(200).collect());
            Ok(ApiEnvelope::failed(message))
        }
    }
}

/// `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(raw: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or_default())
}
