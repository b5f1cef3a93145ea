//! Confluence REST (v1) collaborator.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult, bail};
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::config::{DEFAULT_USER_AGENT, HelpwikiConfig};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("page {page_id} was modified concurrently (stale version)")]
    VersionConflict { page_id: String },

    #[error("attachment {file_name} already exists on page {page_id}")]
    AttachmentConflict { page_id: String, file_name: String },

    #[error("content property {key} already exists on page {page_id}")]
    PropertyVersionConflict { page_id: String, key: String },

    #[error("Confluence request failed with HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("failed to call Confluence: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode Confluence response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Conflicts that are logged and skipped rather than aborting a run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AttachmentConflict { .. } | Self::PropertyVersionConflict { .. }
        )
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePage {
    pub id: String,
    pub title: String,
    pub space_key: String,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct NewPage {
    pub title: String,
    pub space_key: String,
    pub parent_id: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct PageUpdate {
    pub id: String,
    pub title: String,
    pub version: u64,
    pub body: String,
}

pub trait ConfluenceApi {
    fn get_page(&mut self, page_id: &str) -> ApiResult<RemotePage>;
    fn create_page(&mut self, page: &NewPage) -> ApiResult<RemotePage>;
    fn update_page(&mut self, update: &PageUpdate) -> ApiResult<RemotePage>;
    fn create_property(&mut self, page_id: &str, key: &str, value: &Value) -> ApiResult<()>;
    fn add_attachment(&mut self, page_id: &str, file_name: &str, bytes: &[u8]) -> ApiResult<()>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct ConfluenceClientConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
    pub timeout_ms: u64,
}

impl ConfluenceClientConfig {
    /// Connection settings from the config file; credentials only ever come
    /// from `CONFLUENCE_USER` / `CONFLUENCE_PASSWORD`.
    pub fn from_config(config: &HelpwikiConfig) -> AnyResult<Self> {
        let base_url = config
            .confluence_url()
            .context("Confluence URL is not configured (set [confluence].url or CONFLUENCE_URL)")?;
        let username = env::var("CONFLUENCE_USER")
            .context("CONFLUENCE_USER is required for publishing")?;
        let password = env::var("CONFLUENCE_PASSWORD")
            .context("CONFLUENCE_PASSWORD is required for publishing")?;
        Ok(Self {
            base_url,
            username,
            password,
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
        })
    }
}

impl Default for ConfluenceClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            username: String::new(),
            password: String::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_ms: 30_000,
        }
    }
}

pub struct ConfluenceClient {
    client: Client,
    content_url: Url,
    config: ConfluenceClientConfig,
    request_count: usize,
}

impl ConfluenceClient {
    pub fn new(config: ConfluenceClientConfig) -> AnyResult<Self> {
        let base = Url::parse(config.base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid Confluence URL: {}", config.base_url))?;
        if base.cannot_be_a_base() {
            bail!("invalid Confluence URL: {}", config.base_url);
        }
        let content_url = Url::parse(&format!(
            "{}/rest/api/content",
            base.as_str().trim_end_matches('/')
        ))
        .with_context(|| format!("invalid Confluence URL: {}", config.base_url))?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build Confluence HTTP client")?;

        Ok(Self {
            client,
            content_url,
            config,
            request_count: 0,
        })
    }

    fn content_endpoint(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.content_url.as_str().trim_end_matches('/'))
    }

    fn send(&mut self, request: RequestBuilder) -> ApiResult<(StatusCode, String)> {
        self.request_count += 1;
        let response = request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header("User-Agent", self.config.user_agent.clone())
            .header("Accept", "application/json")
            .send()?;
        let status = response.status();
        let body = response.text()?;
        debug!(%status, "Confluence response");
        Ok((status, body))
    }

    fn send_content(&mut self, request: RequestBuilder) -> ApiResult<RemotePage> {
        let (status, body) = self.send(request)?;
        if !status.is_success() {
            return Err(http_error(status, &body));
        }
        parse_content(&body)
    }
}

impl ConfluenceApi for ConfluenceClient {
    fn get_page(&mut self, page_id: &str) -> ApiResult<RemotePage> {
        let url = self.content_endpoint(&format!("/{page_id}"));
        let request = self
            .client
            .get(url)
            .query(&[("expand", "space,version")]);
        self.send_content(request)
    }

    fn create_page(&mut self, page: &NewPage) -> ApiResult<RemotePage> {
        let url = self.content_endpoint("");
        let request = self.client.post(url).json(&new_page_payload(page));
        self.send_content(request)
    }

    fn update_page(&mut self, update: &PageUpdate) -> ApiResult<RemotePage> {
        let url = self.content_endpoint(&format!("/{}", update.id));
        let request = self.client.put(url).json(&page_update_payload(update));
        let (status, body) = self.send(request)?;
        if status == StatusCode::CONFLICT {
            return Err(ApiError::VersionConflict {
                page_id: update.id.clone(),
            });
        }
        if !status.is_success() {
            return Err(http_error(status, &body));
        }
        parse_content(&body)
    }

    fn create_property(&mut self, page_id: &str, key: &str, value: &Value) -> ApiResult<()> {
        let url = self.content_endpoint(&format!("/{page_id}/property"));
        let request = self
            .client
            .post(url)
            .json(&json!({ "key": key, "value": value }));
        let (status, body) = self.send(request)?;
        if status == StatusCode::CONFLICT {
            return Err(ApiError::PropertyVersionConflict {
                page_id: page_id.to_string(),
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            return Err(http_error(status, &body));
        }
        Ok(())
    }

    fn add_attachment(&mut self, page_id: &str, file_name: &str, bytes: &[u8]) -> ApiResult<()> {
        let url = self.content_endpoint(&format!("/{page_id}/child/attachment"));
        let part = Part::bytes(bytes.to_vec()).file_name(file_name.to_string());
        let request = self
            .client
            .post(url)
            .header("X-Atlassian-Token", "nocheck")
            .multipart(Form::new().part("file", part));
        let (status, body) = self.send(request)?;
        if is_attachment_conflict(status, &body) {
            return Err(ApiError::AttachmentConflict {
                page_id: page_id.to_string(),
                file_name: file_name.to_string(),
            });
        }
        if !status.is_success() {
            return Err(http_error(status, &body));
        }
        Ok(())
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

fn new_page_payload(page: &NewPage) -> Value {
    let mut payload = json!({
        "type": "page",
        "title": page.title,
        "space": { "key": page.space_key },
        "body": storage_body(&page.body),
    });
    if let Some(parent_id) = &page.parent_id {
        payload["ancestors"] = json!([{ "id": parent_id }]);
    }
    payload
}

fn page_update_payload(update: &PageUpdate) -> Value {
    json!({
        "id": update.id,
        "type": "page",
        "title": update.title,
        "version": { "number": update.version },
        "body": storage_body(&update.body),
    })
}

fn storage_body(value: &str) -> Value {
    json!({ "storage": { "value": value, "representation": "storage" } })
}

/// Confluence rejects a duplicate file name with 400 (older servers) or 409.
fn is_attachment_conflict(status: StatusCode, body: &str) -> bool {
    status == StatusCode::CONFLICT
        || (status == StatusCode::BAD_REQUEST
            && error_message(body).to_lowercase().contains("same file name"))
}

fn http_error(status: StatusCode, body: &str) -> ApiError {
    ApiError::Http {
        status: status.as_u16(),
        message: error_message(body),
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorPayload>(body)
        .ok()
        .and_then(|payload| payload.message)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn parse_content(body: &str) -> ApiResult<RemotePage> {
    let payload: ContentPayload = serde_json::from_str(body)?;
    Ok(RemotePage {
        id: payload.id,
        title: payload.title,
        space_key: payload.space.map(|space| space.key).unwrap_or_default(),
        version: payload.version.map(|version| version.number).unwrap_or(1),
    })
}

#[derive(Debug, Deserialize)]
struct ContentPayload {
    id: String,
    title: String,
    space: Option<SpacePayload>,
    version: Option<VersionPayload>,
}

#[derive(Debug, Deserialize)]
struct SpacePayload {
    key: String,
}

#[derive(Debug, Deserialize)]
struct VersionPayload {
    number: u64,
}

#[derive(Debug, Deserialize, Default)]
struct ErrorPayload {
    message: Option<String>,
}
