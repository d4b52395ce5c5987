use reqwest::Client;
use std::time::Duration;

/// Shared client for backend calls and download refetches. Per-request
/// deadlines (upload timeout, capture deadline) are applied by callers.
pub fn build_client(timeout_secs: u64, connect_timeout_secs: u64, user_agent: &str) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(connect_timeout_secs))
        .user_agent(user_agent)
        .build()
        .unwrap_or_else(|_| Client::new())
}
