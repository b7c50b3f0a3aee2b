use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::{MigrateConfig, read_secret_file, require};
use crate::error::{ApiError, truncate_body};
use crate::runtime::ResolvedPaths;
use crate::source::{Pacer, ThreadPacer};

pub const SEARCH_PAGE_LIMIT: usize = 25;
const RETRY_BASE_MS: u64 = 1_000;
const HASH_COMMENT_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPage {
    pub id: String,
    pub title: String,
    pub version: u64,
    /// Storage-format body; empty when the response did not expand it.
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub id: String,
    pub filename: String,
    pub comment: Option<String>,
}

impl AttachmentInfo {
    /// Content hash recorded in the attachment comment by a previous upload.
    pub fn content_hash(&self) -> Option<&str> {
        self.comment
            .as_deref()
            .and_then(|comment| comment.trim().strip_prefix(HASH_COMMENT_PREFIX))
    }
}

#[derive(Debug, Clone)]
pub struct AssetUpload {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
    pub content_hash: String,
}

impl AssetUpload {
    pub fn comment(&self) -> String {
        format!("{HASH_COMMENT_PREFIX}{}", self.content_hash)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub pages: Vec<DestinationPage>,
    /// Raw result count before any filtering, used to detect the last page.
    pub returned: usize,
}

pub trait DestinationApi {
    fn search_pages(&mut self, title: &str, start: usize, limit: usize) -> Result<SearchResults>;
    fn get_page(&mut self, page_id: &str) -> Result<DestinationPage>;
    fn create_page(&mut self, title: &str, body: &str) -> Result<DestinationPage>;
    fn update_page(
        &mut self,
        page_id: &str,
        title: &str,
        next_version: u64,
        body: &str,
    ) -> Result<DestinationPage>;
    fn find_attachment(&mut self, page_id: &str, filename: &str) -> Result<Option<AttachmentInfo>>;
    fn create_attachment(&mut self, page_id: &str, upload: &AssetUpload) -> Result<AttachmentInfo>;
    fn update_attachment_data(
        &mut self,
        page_id: &str,
        attachment_id: &str,
        upload: &AssetUpload,
    ) -> Result<AttachmentInfo>;
    /// URL under which the destination serves an attachment of a page.
    fn attachment_url(&self, page_id: &str, filename: &str) -> String;
    fn request_count(&self) -> usize;
}

/// Look up a page by exact title, walking the search results page by page.
pub fn find_page_by_title<A: DestinationApi>(
    api: &mut A,
    title: &str,
) -> Result<Option<DestinationPage>> {
    let mut start = 0usize;
    loop {
        let results = api.search_pages(title, start, SEARCH_PAGE_LIMIT)?;
        if let Some(page) = results.pages.into_iter().find(|page| page.title == title) {
            return Ok(Some(page));
        }
        if results.returned < SEARCH_PAGE_LIMIT {
            return Ok(None);
        }
        start += results.returned;
    }
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub token: String,
    pub space_key: String,
    pub parent_page_id: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub write_interval_ms: u64,
    pub max_retries: usize,
}

impl ConfluenceClientConfig {
    pub fn from_config(config: &MigrateConfig, paths: &ResolvedPaths) -> Result<Self> {
        let base_url = require(config.confluence_url(), "destination.base_url")?;
        let space_key = require(config.space_key(), "destination.space_key")?;
        let token = read_secret_file(&paths.resolve(&config.destination.token_file))
            .context("failed to load destination access token")?;
        Ok(Self {
            base_url,
            token,
            space_key,
            parent_page_id: config.parent_page_id(),
            user_agent: config.user_agent(),
            timeout_ms: config.destination.timeout_ms,
            write_interval_ms: config.destination.write_interval_ms,
            max_retries: config.retry.max_retries,
        })
    }
}

/// Blocking Confluence REST client authenticated with a personal access token.
pub struct ConfluenceClient<P: Pacer = ThreadPacer> {
    client: Client,
    pacer: P,
    config: ConfluenceClientConfig,
    request_count: usize,
    last_write_at: Option<Instant>,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> Result<Self> {
        Self::with_pacer(config, ThreadPacer)
    }
}

impl<P: Pacer> ConfluenceClient<P> {
    pub fn with_pacer(config: ConfluenceClientConfig, pacer: P) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;
        Ok(Self {
            client,
            pacer,
            config,
            request_count: 0,
            last_write_at: None,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/rest/api/{path}", self.config.base_url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.config.token)
            .header("User-Agent", self.config.user_agent.clone())
    }

    fn get_json(&mut self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = self.url(path);
        for attempt in 0..=self.config.max_retries {
            self.request_count += 1;
            let response = self
                .authorized(self.client.get(&url))
                .query(query)
                .send();
            match response {
                Ok(response) => {
                    let status = response.status();
                    if attempt < self.config.max_retries && is_retryable_status(status) {
                        self.wait_before_retry(attempt, path, status.as_u16());
                        continue;
                    }
                    return decode_response(response, path);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, path, 0);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to call {url}"));
                }
            }
        }
        Err(ApiError::RetriesExhausted {
            endpoint: path.to_string(),
            attempts: self.config.max_retries + 1,
        }
        .into())
    }

    fn write_json(&mut self, method: Method, path: &str, payload: &Value) -> Result<Value> {
        self.apply_write_interval();
        let url = self.url(path);
        let response = self
            .authorized(self.client.request(method, &url))
            .json(payload)
            .send()
            .with_context(|| format!("failed to call {url}"))?;
        decode_response(response, path)
    }

    fn post_attachment(&mut self, path: &str, upload: &AssetUpload) -> Result<Value> {
        self.apply_write_interval();
        let url = self.url(path);
        let part = Part::bytes(upload.bytes.clone())
            .file_name(upload.filename.clone())
            .mime_str(upload.content_type)
            .with_context(|| format!("invalid content type for {}", upload.filename))?;
        let form = Form::new()
            .part("file", part)
            .text("comment", upload.comment())
            .text("minorEdit", "true");
        let response = self
            .authorized(self.client.post(&url))
            .header("X-Atlassian-Token", "no-check")
            .multipart(form)
            .send()
            .with_context(|| format!("failed to upload {} to {url}", upload.filename))?;
        decode_response(response, path)
    }

    fn apply_write_interval(&mut self) {
        let interval = Duration::from_millis(self.config.write_interval_ms);
        if let Some(last) = self.last_write_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                self.pacer.pause(interval - elapsed);
            }
        }
        self.last_write_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&mut self, attempt: usize, path: &str, status: u16) {
        let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
        let delay = Duration::from_millis(RETRY_BASE_MS.saturating_mul(2u64.pow(exponent)));
        warn!(
            "Confluence request {path} failed (status {status}); retrying in {}s",
            delay.as_secs_f32()
        );
        self.pacer.pause(delay);
    }

    fn page_payload(&self, title: &str, body: &str) -> Value {
        json!({
            "type": "page",
            "title": title,
            "space": {"key": self.config.space_key},
            "body": {"storage": {"value": body, "representation": "storage"}},
        })
    }
}

impl<P: Pacer> DestinationApi for ConfluenceClient<P> {
    fn search_pages(&mut self, title: &str, start: usize, limit: usize) -> Result<SearchResults> {
        let mut query = vec![
            ("spaceKey", self.config.space_key.clone()),
            ("title", title.to_string()),
            ("type", "page".to_string()),
            ("expand", "version,body.storage".to_string()),
            ("start", start.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(parent) = &self.config.parent_page_id {
            query.push(("ancestorId", parent.clone()));
        }
        let payload = self.get_json("content", &query)?;
        let parsed: ResultList<ContentPayload> =
            serde_json::from_value(payload).context("failed to decode Confluence search response")?;
        let returned = parsed.results.len();
        debug!("search for {title:?} at {start} returned {returned} results");
        Ok(SearchResults {
            pages: parsed.results.into_iter().map(ContentPayload::into_page).collect(),
            returned,
        })
    }

    fn get_page(&mut self, page_id: &str) -> Result<DestinationPage> {
        let payload = self.get_json(
            &format!("content/{page_id}"),
            &[("expand", "version,body.storage".to_string())],
        )?;
        let parsed: ContentPayload = serde_json::from_value(payload)
            .with_context(|| format!("failed to decode Confluence page {page_id}"))?;
        Ok(parsed.into_page())
    }

    fn create_page(&mut self, title: &str, body: &str) -> Result<DestinationPage> {
        let mut payload = self.page_payload(title, body);
        if let Some(parent) = &self.config.parent_page_id {
            payload["ancestors"] = json!([{ "id": parent }]);
        }
        let response = self.write_json(Method::POST, "content", &payload)?;
        let parsed: ContentPayload = serde_json::from_value(response)
            .with_context(|| format!("failed to decode created page {title:?}"))?;
        let mut page = parsed.into_page();
        if page.body.is_empty() {
            page.body = body.to_string();
        }
        Ok(page)
    }

    fn update_page(
        &mut self,
        page_id: &str,
        title: &str,
        next_version: u64,
        body: &str,
    ) -> Result<DestinationPage> {
        let mut payload = self.page_payload(title, body);
        payload["id"] = json!(page_id);
        payload["version"] = json!({ "number": next_version });
        let path = format!("content/{page_id}");
        let response = self.write_json(Method::PUT, &path, &payload)?;
        let parsed: ContentPayload = serde_json::from_value(response)
            .with_context(|| format!("failed to decode updated page {page_id}"))?;
        let mut page = parsed.into_page();
        if page.body.is_empty() {
            page.body = body.to_string();
        }
        Ok(page)
    }

    fn find_attachment(&mut self, page_id: &str, filename: &str) -> Result<Option<AttachmentInfo>> {
        let payload = self.get_json(
            &format!("content/{page_id}/child/attachment"),
            &[
                ("filename", filename.to_string()),
                ("expand", "version".to_string()),
            ],
        )?;
        let parsed: ResultList<AttachmentPayload> = serde_json::from_value(payload)
            .with_context(|| format!("failed to decode attachments of page {page_id}"))?;
        Ok(parsed
            .results
            .into_iter()
            .map(AttachmentPayload::into_info)
            .find(|attachment| attachment.filename == filename))
    }

    fn create_attachment(&mut self, page_id: &str, upload: &AssetUpload) -> Result<AttachmentInfo> {
        let path = format!("content/{page_id}/child/attachment");
        let response = self.post_attachment(&path, upload)?;
        attachment_from_response(response, upload)
    }

    fn update_attachment_data(
        &mut self,
        page_id: &str,
        attachment_id: &str,
        upload: &AssetUpload,
    ) -> Result<AttachmentInfo> {
        let path = format!("content/{page_id}/child/attachment/{attachment_id}/data");
        let response = self.post_attachment(&path, upload)?;
        attachment_from_response(response, upload)
    }

    fn attachment_url(&self, page_id: &str, filename: &str) -> String {
        format!(
            "{}/download/attachments/{page_id}/{filename}",
            self.config.base_url
        )
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

#[derive(Debug, Deserialize)]
struct ResultList<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ContentPayload {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    version: Option<VersionPayload>,
    #[serde(default)]
    body: Option<BodyPayload>,
}

#[derive(Debug, Deserialize)]
struct VersionPayload {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct BodyPayload {
    #[serde(default)]
    storage: Option<StoragePayload>,
}

#[derive(Debug, Deserialize)]
struct StoragePayload {
    #[serde(default)]
    value: String,
}

impl ContentPayload {
    fn into_page(self) -> DestinationPage {
        DestinationPage {
            id: self.id,
            title: self.title,
            version: self.version.map_or(1, |version| version.number),
            body: self
                .body
                .and_then(|body| body.storage)
                .map(|storage| storage.value)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AttachmentPayload {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    metadata: Option<AttachmentMetadata>,
}

#[derive(Debug, Deserialize)]
struct AttachmentMetadata {
    #[serde(default)]
    comment: Option<String>,
}

impl AttachmentPayload {
    fn into_info(self) -> AttachmentInfo {
        AttachmentInfo {
            id: self.id,
            filename: self.title,
            comment: self.metadata.and_then(|metadata| metadata.comment),
        }
    }
}

/// Attachment create answers with a result list, data update with the bare object.
fn attachment_from_response(response: Value, upload: &AssetUpload) -> Result<AttachmentInfo> {
    let item = match response {
        Value::Object(mut map) if map.contains_key("results") => match map.remove("results") {
            Some(Value::Array(items)) => items.into_iter().next(),
            _ => None,
        },
        other => Some(other),
    }
    .ok_or_else(|| ApiError::InvalidResponse {
        endpoint: "attachment".to_string(),
        detail: format!("no attachment returned for {}", upload.filename),
    })?;
    let parsed: AttachmentPayload = serde_json::from_value(item)
        .with_context(|| format!("failed to decode attachment {}", upload.filename))?;
    let mut info = parsed.into_info();
    if info.filename.is_empty() {
        info.filename = upload.filename.clone();
    }
    if info.comment.is_none() {
        info.comment = Some(upload.comment());
    }
    Ok(info)
}

fn decode_response(response: Response, endpoint: &str) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("failed to read Confluence response for {endpoint}"))?;
    if !status.is_success() {
        return Err(ApiError::Transport {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: truncate_body(&body),
        }
        .into());
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str::<Value>(&body).map_err(|error| {
        anyhow::Error::from(ApiError::InvalidResponse {
            endpoint: endpoint.to_string(),
            detail: error.to_string(),
        })
    })
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}
