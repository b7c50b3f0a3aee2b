use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{MigrateConfig, read_secret_file, require};
use crate::error::{ApiError, truncate_body};
use crate::runtime::ResolvedPaths;

const THROTTLE_ERROR_ID: i64 = 502;

/// Suspends the calling thread. Tests substitute a recorder.
pub trait Pacer {
    fn pause(&mut self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPacer;

impl Pacer for ThreadPacer {
    fn pause(&mut self, duration: Duration) {
        if !duration.is_zero() {
            sleep(duration);
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    /// Backoff seconds advertised in response headers, if any.
    pub backoff_header: Option<u64>,
    pub body: String,
}

/// A single blocking GET against the source API.
pub trait SourceTransport {
    fn get(&mut self, url: &str, query: &[(String, String)]) -> Result<TransportResponse>;
}

pub trait SourceApi {
    fn request(&mut self, endpoint: &str, params: &[(&str, String)]) -> Result<Value>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    pub api_url: String,
    pub key: String,
    pub access_token: Option<String>,
    pub filter: String,
    pub site: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub default_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl SourceClientConfig {
    pub fn from_config(config: &MigrateConfig, paths: &ResolvedPaths) -> Result<Self> {
        let api_url = require(config.source_api_url(), "source.api_url")?;
        let key = read_secret_file(&paths.resolve(&config.source.key_file))
            .context("failed to load source API key")?;
        let access_token = match &config.source.access_token_file {
            Some(path) => Some(
                read_secret_file(&paths.resolve(path))
                    .context("failed to load source access token")?,
            ),
            None => None,
        };
        Ok(Self {
            api_url,
            key,
            access_token,
            filter: config.source.filter.clone(),
            site: config.source.site.clone(),
            user_agent: config.user_agent(),
            timeout_ms: config.source.timeout_ms,
            max_retries: config.retry.max_retries,
            default_backoff_secs: config.retry.default_backoff_secs,
            max_backoff_secs: config.retry.max_backoff_secs,
        })
    }
}

pub struct HttpTransport {
    client: Client,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout_ms: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("failed to build source HTTP client")?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }
}

impl SourceTransport for HttpTransport {
    fn get(&mut self, url: &str, query: &[(String, String)]) -> Result<TransportResponse> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.user_agent.clone())
            .query(query)
            .send()
            .with_context(|| format!("failed to call {url}"))?;
        let status = response.status().as_u16();
        let backoff_header = ["Backoff", "Retry-After"].iter().find_map(|name| {
            response
                .headers()
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
        });
        let body = response
            .text()
            .with_context(|| format!("failed to read response body from {url}"))?;
        Ok(TransportResponse {
            status,
            backoff_header,
            body,
        })
    }
}

/// Issues source API calls, injecting credentials and the response filter,
/// and retrying rate-limited calls with server-hinted backoff.
pub struct SourceClient<T: SourceTransport = HttpTransport, P: Pacer = ThreadPacer> {
    transport: T,
    pacer: P,
    config: SourceClientConfig,
    request_count: usize,
    retry_count: usize,
    pending_backoff: Option<Duration>,
}

impl SourceClient {
    pub fn connect(config: SourceClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config.user_agent, config.timeout_ms)?;
        Ok(Self::with_transport(config, transport, ThreadPacer))
    }
}

impl<T: SourceTransport, P: Pacer> SourceClient<T, P> {
    pub fn with_transport(config: SourceClientConfig, transport: T, pacer: P) -> Self {
        Self {
            transport,
            pacer,
            config,
            request_count: 0,
            retry_count: 0,
            pending_backoff: None,
        }
    }

    pub fn retry_count(&self) -> usize {
        self.retry_count
    }

    pub fn pacer(&self) -> &P {
        &self.pacer
    }

    fn build_query(&self, params: &[(&str, String)]) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(params.len() + 4);
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }
        let has = |pairs: &[(String, String)], key: &str| pairs.iter().any(|(k, _)| k == key);
        if let Some(site) = &self.config.site
            && !has(&pairs, "site")
        {
            pairs.push(("site".to_string(), site.clone()));
        }
        pairs.push(("key".to_string(), self.config.key.clone()));
        if let Some(token) = &self.config.access_token {
            pairs.push(("access_token".to_string(), token.clone()));
        }
        pairs.push(("filter".to_string(), self.config.filter.clone()));
        pairs
    }

    /// A server hint is honoured as given; only the exponential default is
    /// capped at `max_backoff_secs`.
    fn backoff_delay(&self, hint: Option<u64>, attempt: usize) -> Duration {
        if let Some(seconds) = hint {
            if seconds > self.config.max_backoff_secs {
                warn!(
                    "server asked for a {seconds}s backoff, above the configured {}s maximum",
                    self.config.max_backoff_secs
                );
            }
            return Duration::from_secs(seconds);
        }
        let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
        let seconds = self
            .config
            .default_backoff_secs
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_secs(seconds.min(self.config.max_backoff_secs))
    }
}

impl<T: SourceTransport, P: Pacer> SourceApi for SourceClient<T, P> {
    fn request(&mut self, endpoint: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!(
            "{}/{}",
            self.config.api_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        );
        let query = self.build_query(params);

        for attempt in 0..=self.config.max_retries {
            if let Some(delay) = self.pending_backoff.take() {
                debug!("honouring API backoff of {}s before {endpoint}", delay.as_secs());
                self.pacer.pause(delay);
            }
            self.request_count += 1;
            let response = self.transport.get(&url, &query)?;
            let payload = serde_json::from_str::<Value>(&response.body).ok();

            if is_rate_limited(response.status, payload.as_ref()) {
                if attempt == self.config.max_retries {
                    break;
                }
                let hint = response
                    .backoff_header
                    .or_else(|| payload.as_ref().and_then(body_backoff));
                let delay = self.backoff_delay(hint, attempt);
                warn!(
                    "rate limited on {endpoint}; waiting {}s (retry {}/{})",
                    delay.as_secs(),
                    attempt + 1,
                    self.config.max_retries
                );
                self.retry_count += 1;
                self.pacer.pause(delay);
                continue;
            }

            if !(200..300).contains(&response.status) {
                return Err(ApiError::Transport {
                    endpoint: endpoint.to_string(),
                    status: response.status,
                    body: truncate_body(&response.body),
                }
                .into());
            }

            let payload = payload.ok_or_else(|| ApiError::InvalidResponse {
                endpoint: endpoint.to_string(),
                detail: "body is not JSON".to_string(),
            })?;
            if let Some(seconds) = body_backoff(&payload) {
                self.pending_backoff = Some(Duration::from_secs(
                    seconds.min(self.config.max_backoff_secs),
                ));
            }
            return Ok(payload);
        }

        Err(ApiError::RetriesExhausted {
            endpoint: endpoint.to_string(),
            attempts: self.config.max_retries + 1,
        }
        .into())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn is_rate_limited(status: u16, payload: Option<&Value>) -> bool {
    if status == 429 {
        return true;
    }
    if (200..300).contains(&status) {
        return false;
    }
    let Some(payload) = payload else {
        return false;
    };
    payload.get("error_id").and_then(Value::as_i64) == Some(THROTTLE_ERROR_ID)
        || payload.get("error_name").and_then(Value::as_str) == Some("throttle_violation")
}

fn body_backoff(payload: &Value) -> Option<u64> {
    payload.get("backoff").and_then(Value::as_u64)
}
