use crate::api::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{info, warn};

pub const KEY_HEADER: &str = "X-Extension-Key";

/// Key auth for the control endpoints. With no keys configured the
/// endpoints are open, which is the normal single-machine deployment.
#[derive(Clone)]
pub struct ControlAuth {
    clients: Arc<HashMap<String, ClientContext>>,
    limiter: Arc<RateLimiter>,
}

/// Which configured client made the request; inserted into request
/// extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientContext {
    pub client_id: String,
    pub key_id: String,
}

impl ControlAuth {
    /// `CONTROL_API_KEYS` as `client:key` pairs separated by commas, with
    /// `CONTROL_RATE_PER_SEC` / `CONTROL_RATE_CAPACITY` as the sustained
    /// rate and burst each client gets per route class.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let clients = lookup("CONTROL_API_KEYS")
            .map(|raw| parse_keys(&raw))
            .unwrap_or_default();
        let rate_per_sec = lookup("CONTROL_RATE_PER_SEC")
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(20.0);
        let burst = lookup("CONTROL_RATE_CAPACITY")
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|value| *value >= 1)
            .unwrap_or(40);
        if clients.is_empty() {
            info!(target = "ingest.api", "control endpoints open (no CONTROL_API_KEYS)");
        } else {
            info!(target = "ingest.api", key_count = clients.len(), "loaded control keys");
        }
        Self {
            clients: Arc::new(clients),
            limiter: Arc::new(RateLimiter::new(rate_per_sec, burst)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.clients.is_empty()
    }

    fn authenticate(&self, presented: &str) -> Option<ClientContext> {
        self.clients.get(presented).cloned()
    }
}

pub async fn require_control_auth(
    State(auth): State<ControlAuth>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    if auth.is_open() {
        return Ok(next.run(request).await);
    }

    let Some(presented) = extract_key(request.headers()) else {
        return Ok(reject(
            StatusCode::UNAUTHORIZED,
            "missing_key",
            "Provide X-Extension-Key or Bearer token",
        ));
    };
    let Some(context) = auth.authenticate(&presented) else {
        return Ok(reject(StatusCode::UNAUTHORIZED, "invalid_key", "Key not recognized"));
    };

    let class = RouteClass::of(request.uri().path());
    match auth.limiter.check(&context.client_id, class).await {
        Ok(permit) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            warn!(
                target = "ingest.api",
                client = %context.client_id,
                route_class = class.as_str(),
                retry_after_ms = exceeded.retry_after.as_millis() as u64,
                "control_rate_limited"
            );
            let mut response = reject(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "Too many requests");
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, ClientContext> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let client = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (client, key) {
            (Some(client), Some(secret)) => {
                entries.insert(
                    secret.to_string(),
                    ClientContext {
                        client_id: client.to_string(),
                        key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "ingest.api",
                "ignored malformed CONTROL_API_KEYS entry at position {}",
                idx + 1
            ),
        }
    }
    entries
}

/// Callers are limited per route class so a popup polling `/status` every
/// second never starves the same client's page and download events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RouteClass {
    Poll,
    Events,
    Commands,
}

impl RouteClass {
    fn of(path: &str) -> Self {
        match path {
            "/status" => RouteClass::Poll,
            "/pages" | "/downloads" => RouteClass::Events,
            _ => RouteClass::Commands,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            RouteClass::Poll => "poll",
            RouteClass::Events => "events",
            RouteClass::Commands => "commands",
        }
    }
}

const PRUNE_ABOVE: usize = 256;

/// Generic cell rate limiter: each key stores only its theoretical arrival
/// time. A request is admitted while that time runs at most `tolerance`
/// ahead of now.
struct RateLimiter {
    interval: Duration,
    tolerance: Duration,
    burst: u32,
    arrivals: Mutex<HashMap<(String, RouteClass), Instant>>,
}

impl RateLimiter {
    fn new(rate_per_sec: f64, burst: u32) -> Self {
        let interval = Duration::from_secs_f64(1.0 / rate_per_sec);
        Self {
            interval,
            tolerance: interval * burst.saturating_sub(1),
            burst,
            arrivals: Mutex::new(HashMap::new()),
        }
    }

    async fn check(&self, client: &str, class: RouteClass) -> Result<RatePermit, RateExceeded> {
        let now = Instant::now();
        let mut arrivals = self.arrivals.lock().await;
        if arrivals.len() > PRUNE_ABOVE {
            arrivals.retain(|_, tat| *tat > now);
        }

        let key = (client.to_string(), class);
        let tat = arrivals.get(&key).copied().map_or(now, |tat| tat.max(now));
        let ahead = tat - now;
        if ahead > self.tolerance {
            return Err(RateExceeded {
                retry_after: ahead - self.tolerance,
                limit: self.burst,
            });
        }

        let next = tat + self.interval;
        arrivals.insert(key, next);
        let used = (next - now).as_secs_f64() / self.interval.as_secs_f64();
        Ok(RatePermit {
            limit: self.burst,
            remaining: self.burst.saturating_sub(used.ceil() as u32),
        })
    }
}

#[derive(Debug, Clone)]
struct RatePermit {
    limit: u32,
    remaining: u32,
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        set_number(headers, "X-RateLimit-Limit", self.limit.into());
        set_number(headers, "X-RateLimit-Remaining", self.remaining.into());
    }
}

#[derive(Debug, Clone)]
struct RateExceeded {
    retry_after: Duration,
    limit: u32,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let secs = self.retry_after.as_secs() + u64::from(self.retry_after.subsec_nanos() > 0);
        set_number(headers, "Retry-After", secs.max(1));
        set_number(headers, "X-RateLimit-Limit", self.limit.into());
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
    }
}

fn set_number(headers: &mut http::HeaderMap, name: &'static str, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}
