use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{url_key, Clock, TtlCache, EMBED_TTL, REDIRECT_TTL, SNAPSHOT_TTL};
use crate::model::Snapshot;

const RESOURCE_TYPES: &str = r#"["filters", "items", "labels", "projects", "user"]"#;
const OAUTH_SCOPE: &str = "data:read_write,data:delete,project:delete";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream answered http {0}")]
    Status(u16),
    #[error("upstream returned an error payload: {0}")]
    ErrorPayload(String),
    #[error("malformed upstream payload: {0}")]
    Malformed(String),
}

/// oEmbed response. Only `html` is required; the rest is passed through.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct EmbedFragment {
    pub html: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn fetch_snapshot(&self, token: &str) -> Result<Snapshot, UpstreamError>;
    async fn delete_labels(&self, token: &str, ids: &[i64]) -> Result<(), UpstreamError>;
}

#[async_trait]
pub trait EmbedFetcher: Send + Sync {
    async fn fetch_embed(&self, status_url: &str) -> Result<EmbedFragment, UpstreamError>;
}

#[async_trait]
pub trait RedirectResolver: Send + Sync {
    /// Follows redirects and returns the final URL.
    async fn resolve_redirect(&self, url: &str) -> Result<String, UpstreamError>;
}

#[async_trait]
pub trait OauthProvider: Send + Sync {
    fn authorize_url(&self, state: &str) -> Result<String, UpstreamError>;
    async fn exchange_code(&self, code: &str) -> Result<String, UpstreamError>;
}

async fn read_json(res: reqwest::Response) -> Result<Value, UpstreamError> {
    let status = res.status();
    if !status.is_success() {
        return Err(UpstreamError::Status(status.as_u16()));
    }
    let body: Value = res.json().await?;
    if let Some(err) = body.get("error").or_else(|| body.get("errors")) {
        return Err(UpstreamError::ErrorPayload(err.to_string()));
    }
    Ok(body)
}

pub struct TodoistClient {
    http: Client,
    sync_url: String,
}

impl TodoistClient {
    pub fn new(http: Client, sync_url: impl Into<String>) -> Self {
        Self {
            http,
            sync_url: sync_url.into(),
        }
    }
}

#[async_trait]
impl TaskStore for TodoistClient {
    async fn fetch_snapshot(&self, token: &str) -> Result<Snapshot, UpstreamError> {
        let res = self
            .http
            .post(&self.sync_url)
            .form(&[
                ("token", token),
                ("sync_token", "*"),
                ("resource_types", RESOURCE_TYPES),
            ])
            .send()
            .await?;
        let body = read_json(res).await?;
        serde_json::from_value(body).map_err(|e| UpstreamError::Malformed(e.to_string()))
    }

    async fn delete_labels(&self, token: &str, ids: &[i64]) -> Result<(), UpstreamError> {
        let commands: Vec<Value> = ids
            .iter()
            .map(|id| {
                serde_json::json!({
                    "type": "label_delete",
                    "uuid": uuid::Uuid::new_v4().to_string(),
                    "args": { "id": id },
                })
            })
            .collect();
        let commands = serde_json::to_string(&commands)
            .map_err(|e| UpstreamError::Malformed(e.to_string()))?;

        let res = self
            .http
            .post(&self.sync_url)
            .form(&[("token", token), ("commands", commands.as_str())])
            .send()
            .await?;
        let body = read_json(res).await?;
        check_sync_status(&body)
    }
}

/// Every command in a sync response must report `"ok"`.
fn check_sync_status(body: &Value) -> Result<(), UpstreamError> {
    let Some(statuses) = body.get("sync_status").and_then(Value::as_object) else {
        return Ok(());
    };
    let failed: Vec<String> = statuses
        .iter()
        .filter(|(_, status)| status.as_str() != Some("ok"))
        .map(|(uuid, status)| format!("{uuid}: {status}"))
        .collect();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(UpstreamError::ErrorPayload(failed.join("; ")))
    }
}

pub struct OembedClient {
    http: Client,
    endpoint: String,
}

impl OembedClient {
    pub fn new(http: Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl EmbedFetcher for OembedClient {
    async fn fetch_embed(&self, status_url: &str) -> Result<EmbedFragment, UpstreamError> {
        let res = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("url", status_url),
                ("align", "center"),
                ("omit_script", "true"),
            ])
            .send()
            .await?;
        embed_from_payload(read_json(res).await?)
    }
}

fn embed_from_payload(body: Value) -> Result<EmbedFragment, UpstreamError> {
    if !body.get("html").is_some_and(Value::is_string) {
        return Err(UpstreamError::ErrorPayload(format!("no html in {body}")));
    }
    serde_json::from_value(body).map_err(|e| UpstreamError::Malformed(e.to_string()))
}

pub struct RedirectClient {
    http: Client,
}

impl RedirectClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RedirectResolver for RedirectClient {
    async fn resolve_redirect(&self, url: &str) -> Result<String, UpstreamError> {
        let parsed = Url::parse(url).map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(UpstreamError::Malformed(format!("unsupported scheme in {url}")));
        }
        // Final status is irrelevant; some hosts refuse HEAD but still redirect.
        let res = self.http.head(parsed).send().await?;
        Ok(res.url().to_string())
    }
}

pub struct TodoistOauth {
    http: Client,
    authorize_url: String,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl TodoistOauth {
    pub fn new(
        http: Client,
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            authorize_url: authorize_url.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[async_trait]
impl OauthProvider for TodoistOauth {
    fn authorize_url(&self, state: &str) -> Result<String, UpstreamError> {
        let url = Url::parse_with_params(
            &self.authorize_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("scope", OAUTH_SCOPE),
                ("state", state),
            ],
        )
        .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(url.into())
    }

    async fn exchange_code(&self, code: &str) -> Result<String, UpstreamError> {
        let res = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
            ])
            .send()
            .await?;
        let body = read_json(res).await?;
        let token: TokenResponse =
            serde_json::from_value(body).map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(token.access_token)
    }
}

/// Snapshot access keyed by API token, with invalidation after mutations.
pub struct CachedTaskStore {
    inner: Arc<dyn TaskStore>,
    cache: TtlCache<Arc<Snapshot>>,
}

impl CachedTaskStore {
    pub fn new(inner: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            cache: TtlCache::new("snapshot", clock),
        }
    }

    pub async fn snapshot(&self, token: &str) -> Result<Arc<Snapshot>, UpstreamError> {
        let inner = &self.inner;
        self.cache
            .get_or_compute(token, SNAPSHOT_TTL, move || async move {
                inner.fetch_snapshot(token).await.map(Arc::new)
            })
            .await
    }

    /// Deletes labels upstream, then drops the cached snapshot whatever the
    /// outcome. A crash between the two leaves the entry until it expires.
    pub async fn delete_labels(&self, token: &str, ids: &[i64]) -> Result<(), UpstreamError> {
        let result = self.inner.delete_labels(token, ids).await;
        self.cache.invalidate(token).await;
        match &result {
            Ok(()) => info!(count = ids.len(), "labels deleted"),
            Err(err) => warn!("label deletion failed: {err}"),
        }
        result
    }
}

pub struct CachedEmbeds {
    inner: Arc<dyn EmbedFetcher>,
    cache: TtlCache<EmbedFragment>,
}

impl CachedEmbeds {
    pub fn new(inner: Arc<dyn EmbedFetcher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            cache: TtlCache::new("embed", clock),
        }
    }
}

#[async_trait]
impl EmbedFetcher for CachedEmbeds {
    async fn fetch_embed(&self, status_url: &str) -> Result<EmbedFragment, UpstreamError> {
        let inner = &self.inner;
        self.cache
            .get_or_compute(&url_key(status_url), EMBED_TTL, move || async move {
                inner.fetch_embed(status_url).await
            })
            .await
    }
}

pub struct CachedRedirects {
    inner: Arc<dyn RedirectResolver>,
    cache: TtlCache<String>,
}

impl CachedRedirects {
    pub fn new(inner: Arc<dyn RedirectResolver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner,
            cache: TtlCache::new("redirect", clock),
        }
    }
}

#[async_trait]
impl RedirectResolver for CachedRedirects {
    async fn resolve_redirect(&self, url: &str) -> Result<String, UpstreamError> {
        let inner = &self.inner;
        self.cache
            .get_or_compute(&url_key(url), REDIRECT_TTL, move || async move {
                inner.resolve_redirect(url).await
            })
            .await
    }
}
