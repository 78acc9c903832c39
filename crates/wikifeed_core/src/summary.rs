use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::FeedConfig;
use crate::error::ClientError;
use crate::session::{RequestPriority, Session};

const SUMMARY_API_PREFIX: &str = "api/rest_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSummaryImage {
    pub source: String,
    pub width: u32,
    pub height: u32,
}

impl ArticleSummaryImage {
    pub fn url(&self) -> Option<Url> {
        Url::parse(&self.source).ok()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleSummaryUrls {
    pub page: Option<String>,
    pub revisions: Option<String>,
    pub edit: Option<String>,
    pub talk: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleSummaryContentUrls {
    pub desktop: Option<ArticleSummaryUrls>,
    pub mobile: Option<ArticleSummaryUrls>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArticleSummaryCoordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleSummaryNamespace {
    pub id: Option<i64>,
    pub text: Option<String>,
}

/// Decoded `page/summary` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSummary {
    #[serde(rename = "pageid")]
    pub id: Option<i64>,
    pub revision: Option<String>,
    pub timestamp: Option<String>,
    pub index: Option<i64>,
    pub namespace: Option<ArticleSummaryNamespace>,
    pub title: Option<String>,
    #[serde(rename = "displaytitle")]
    pub display_title: Option<String>,
    pub description: Option<String>,
    pub extract: Option<String>,
    #[serde(rename = "extract_html")]
    pub extract_html: Option<String>,
    pub thumbnail: Option<ArticleSummaryImage>,
    #[serde(rename = "originalimage")]
    pub original: Option<ArticleSummaryImage>,
    pub coordinates: Option<ArticleSummaryCoordinates>,
    #[serde(rename = "content_urls")]
    pub content_urls: ArticleSummaryContentUrls,
}

impl ArticleSummary {
    pub fn article_url(&self) -> Option<Url> {
        let page = self.content_urls.desktop.as_ref()?.page.as_deref()?;
        Url::parse(page).ok()
    }

    /// Stable dedup key; the desktop page URL in database-key form.
    pub fn key(&self) -> Option<String> {
        self.article_url().as_ref().and_then(database_key)
    }
}

/// Canonical form of an article URL: https, lower-case host, no query or
/// fragment, underscores for spaces.
pub fn database_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    let title = page_title(url)?;
    Some(format!("https://{host}/wiki/{}", encode_title(&title)))
}

/// Percent-encodes a title, leaving the characters MediaWiki keeps literal in
/// article paths.
fn encode_title(title: &str) -> String {
    const LITERAL: &[(&str, &str)] = &[
        ("%3A", ":"),
        ("%2F", "/"),
        ("%28", "("),
        ("%29", ")"),
        ("%2C", ","),
    ];
    LITERAL
        .iter()
        .fold(urlencoding::encode(title).into_owned(), |encoded, &(escaped, literal)| {
            encoded.replace(escaped, literal)
        })
}

/// Page title from an article URL path (`/wiki/<title>` or a bare `/<title>`),
/// percent-decoded with spaces folded to underscores.
pub fn page_title(url: &Url) -> Option<String> {
    let path = url.path();
    let raw = match path.strip_prefix("/wiki/") {
        Some(rest) => rest,
        None => {
            let trimmed = path.trim_start_matches('/');
            if trimmed.contains('/') {
                return None;
            }
            trimmed
        }
    };
    let decoded = urlencoding::decode(raw).ok()?;
    let title = decoded.trim().replace(' ', "_");
    if title.is_empty() { None } else { Some(title) }
}

/// Builds `{scheme}://{host}/api/rest_v1/page/summary/{title}` for an article key.
pub fn summary_request_url(page_key: &str, host_override: Option<&str>) -> Result<Url, ClientError> {
    let article_url = Url::parse(page_key).map_err(|error| {
        ClientError::InvalidParameters(format!("invalid page key {page_key}: {error}"))
    })?;
    if !matches!(article_url.scheme(), "http" | "https") {
        return Err(ClientError::InvalidParameters(format!(
            "unsupported page key scheme: {page_key}"
        )));
    }
    let title = page_title(&article_url).ok_or_else(|| {
        ClientError::InvalidParameters(format!("page key has no title: {page_key}"))
    })?;
    let host = match host_override {
        Some(host) => host.to_string(),
        None => match article_url.port() {
            Some(port) => format!("{}:{port}", article_url.host_str().unwrap_or_default()),
            None => article_url.host_str().unwrap_or_default().to_string(),
        },
    };
    if host.is_empty() {
        return Err(ClientError::InvalidParameters(format!(
            "page key has no host: {page_key}"
        )));
    }

    let base = format!("{}://{host}/{SUMMARY_API_PREFIX}/", article_url.scheme());
    let mut url = Url::parse(&base).map_err(|error| {
        ClientError::InvalidParameters(format!("invalid summary host {host}: {error}"))
    })?;
    url.path_segments_mut()
        .map_err(|_| ClientError::InvalidParameters(format!("invalid summary host {host}")))?
        .pop_if_empty()
        .extend(["page", "summary"])
        .push(&title);
    Ok(url)
}

fn fetch_with<S: Session + ?Sized>(
    session: &S,
    host_override: Option<&str>,
    page_key: &str,
    priority: RequestPriority,
) -> Result<ArticleSummary, ClientError> {
    let url = summary_request_url(page_key, host_override)?;
    let payload = session.get_json(&url, priority)?;
    serde_json::from_value(payload).map_err(|error| ClientError::decode("article summary", error))
}

pub struct SummaryClient<S: Session> {
    session: Arc<S>,
    host_override: Option<String>,
}

impl<S: Session + 'static> SummaryClient<S> {
    pub fn new(session: Arc<S>, host_override: Option<String>) -> Self {
        Self {
            session,
            host_override,
        }
    }

    pub fn from_config(session: Arc<S>, config: &FeedConfig) -> Self {
        Self::new(session, config.summary_host())
    }

    pub fn fetch_summary(
        &self,
        page_key: &str,
        priority: RequestPriority,
    ) -> Result<ArticleSummary, ClientError> {
        fetch_with(
            self.session.as_ref(),
            self.host_override.as_deref(),
            page_key,
            priority,
        )
    }

    /// Fetches every key concurrently; failed or cancelled keys map to `None`.
    pub fn fetch_summaries(&self, page_keys: &[String]) -> BTreeMap<String, Option<ArticleSummary>> {
        self.start_summaries(page_keys, RequestPriority::Default)
            .wait()
    }

    /// Starts one worker per distinct key and returns immediately.
    pub fn start_summaries(&self, page_keys: &[String], priority: RequestPriority) -> PendingSummaries {
        let mut workers = Vec::with_capacity(page_keys.len());
        for page_key in page_keys {
            if workers
                .iter()
                .any(|worker: &PendingSummary| worker.page_key == *page_key)
            {
                continue;
            }
            let token = CancellationToken::new();
            let session = Arc::clone(&self.session);
            let host_override = self.host_override.clone();
            let worker_key = page_key.clone();
            let worker_token = token.clone();
            let handle = thread::spawn(move || {
                if worker_token.is_cancelled() {
                    return None;
                }
                match fetch_with(
                    session.as_ref(),
                    host_override.as_deref(),
                    &worker_key,
                    priority,
                ) {
                    Ok(summary) => Some(summary),
                    Err(error) => {
                        tracing::warn!(page_key = %worker_key, %error, "summary fetch failed");
                        None
                    }
                }
            });
            workers.push(PendingSummary {
                page_key: page_key.clone(),
                token,
                handle,
            });
        }
        PendingSummaries { workers }
    }
}

struct PendingSummary {
    page_key: String,
    token: CancellationToken,
    handle: JoinHandle<Option<ArticleSummary>>,
}

/// In-flight bulk summary fetch. Each key carries its own cancellation token.
pub struct PendingSummaries {
    workers: Vec<PendingSummary>,
}

impl PendingSummaries {
    pub fn cancellation(&self, page_key: &str) -> Option<CancellationToken> {
        self.workers
            .iter()
            .find(|worker| worker.page_key == page_key)
            .map(|worker| worker.token.clone())
    }

    pub fn cancellation_tokens(&self) -> Vec<(String, CancellationToken)> {
        self.workers
            .iter()
            .map(|worker| (worker.page_key.clone(), worker.token.clone()))
            .collect()
    }

    /// Blocks until every key resolved. Cancelled keys resolve to `None`.
    pub fn wait(self) -> BTreeMap<String, Option<ArticleSummary>> {
        let mut output = BTreeMap::new();
        for worker in self.workers {
            let result = match worker.handle.join() {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(page_key = %worker.page_key, "summary worker panicked");
                    None
                }
            };
            let result = if worker.token.is_cancelled() {
                None
            } else {
                result
            };
            output.insert(worker.page_key, result);
        }
        output
    }
}
