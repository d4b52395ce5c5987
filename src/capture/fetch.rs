use async_trait::async_trait;
use reqwest::{Client, header::COOKIE};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty body")]
    Empty,
}

/// Re-issues a report download with the browsing session's cookies.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str, cookies: Option<&str>) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, cookies: Option<&str>) -> Result<Vec<u8>, FetchError> {
        let mut request = self.http.get(url);
        if let Some(cookies) = cookies.filter(|c| !c.trim().is_empty()) {
            request = request.header(COOKIE, cookies);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(bytes.to_vec())
    }
}

/// Completed download on disk.
pub async fn read_local(path: &Path) -> Result<Vec<u8>, FetchError> {
    let bytes = tokio::fs::read(path).await?;
    if bytes.is_empty() {
        return Err(FetchError::Empty);
    }
    Ok(bytes)
}
