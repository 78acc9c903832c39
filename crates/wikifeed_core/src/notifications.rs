use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::FeedConfig;
use crate::error::{ClientError, WireError};
use crate::fanout::join_ordered;
use crate::session::{RequestPriority, Session};

/// Upper bound on notifications per mark-as-read request.
pub const MARK_READ_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationFilter {
    Read,
    Unread,
    All,
}

impl NotificationFilter {
    pub fn as_param(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Unread => "!read",
            Self::All => "read|!read",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLimit {
    Max,
    Count(usize),
}

impl NotificationLimit {
    pub fn as_param(self) -> String {
        match self {
            Self::Max => "max".to_string(),
            Self::Count(count) => count.to_string(),
        }
    }
}

/// One server-side notification event, normalized from the wire shape.
///
/// Equality, ordering and hashing cover every field, so two values are
/// duplicates only when all fields match, absent ones included. The
/// serialized form is flat and output-only; decode with [`Notification::from_json`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Notification {
    pub wiki: Option<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub category: Option<String>,
    pub header: Option<String>,
    pub timestamp_iso8601: Option<String>,
    pub agent_name: Option<String>,
    pub affected_page_title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireNotification {
    wiki: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    category: Option<String>,
    id: Option<Value>,
    #[serde(rename = "*")]
    message: Option<WireMessage>,
    timestamp: Option<WireTimestamp>,
    agent: Option<WireAgent>,
    title: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    header: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTimestamp {
    utciso8601: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAgent {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTitle {
    full: Option<String>,
}

impl Notification {
    /// Decodes one list entry in the API's wire shape.
    pub fn from_json(value: Value) -> Result<Self, ClientError> {
        let wire: WireNotification = serde_json::from_value(value)
            .map_err(|error| ClientError::decode("notification", error))?;
        Self::try_from(wire)
    }
}

impl TryFrom<WireNotification> for Notification {
    type Error = ClientError;

    fn try_from(wire: WireNotification) -> Result<Self, Self::Error> {
        let id = wire
            .id
            .as_ref()
            .and_then(decode_id)
            .ok_or_else(|| invalid_notification("notification is missing an integer or string id"))?;
        let wiki = wire
            .wiki
            .filter(|wiki| !wiki.is_empty())
            .ok_or_else(|| invalid_notification("notification is missing its wiki"))?;
        Ok(Self {
            wiki: Some(wiki),
            id,
            kind: wire.kind,
            category: wire.category,
            header: wire.message.and_then(|message| message.header),
            timestamp_iso8601: wire.timestamp.and_then(|timestamp| timestamp.utciso8601),
            agent_name: wire.agent.and_then(|agent| agent.name),
            affected_page_title: wire
                .title
                .and_then(|title| serde_json::from_value::<WireTitle>(title).ok())
                .and_then(|title| title.full),
        })
    }
}

fn invalid_notification(message: &str) -> ClientError {
    ClientError::decode(
        "notification",
        <serde_json::Error as serde::de::Error>::custom(message),
    )
}

/// Integer ids are stringified; string ids are taken as-is. Empty ids are rejected.
fn decode_id(value: &Value) -> Option<String> {
    if let Some(number) = value.as_i64() {
        return Some(number.to_string());
    }
    if let Some(number) = value.as_u64() {
        return Some(number.to_string());
    }
    value
        .as_str()
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
}

#[derive(Debug, Deserialize)]
struct NotificationsEnvelope {
    error: Option<WireError>,
    query: Option<NotificationsQuery>,
}

#[derive(Debug, Deserialize)]
struct NotificationsQuery {
    notifications: Option<NotificationList>,
}

#[derive(Debug, Deserialize)]
struct NotificationList {
    #[serde(default)]
    list: Vec<WireNotification>,
}

#[derive(Debug, Deserialize)]
struct MarkReadEnvelope {
    error: Option<WireError>,
    query: Option<MarkReadQuery>,
}

#[derive(Debug, Deserialize)]
struct MarkReadQuery {
    echomarkread: Option<MarkReadPayload>,
}

#[derive(Debug, Deserialize)]
struct MarkReadPayload {
    result: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NotificationsEndpoint {
    pub api_url: Url,
    pub cookie_domain: String,
}

impl NotificationsEndpoint {
    pub fn new(api_url: &str, cookie_domain: &str) -> Result<Self, ClientError> {
        let mut api_url = Url::parse(api_url).map_err(|error| {
            ClientError::InvalidParameters(format!("invalid action API URL {api_url}: {error}"))
        })?;
        api_url.set_query(None);
        api_url.set_fragment(None);
        Ok(Self {
            api_url,
            cookie_domain: cookie_domain.to_string(),
        })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self, ClientError> {
        Self::new(&config.api_url(), &config.cookie_domain())
    }

    /// The API URL with its query replaced by `params`.
    fn url_with_query(&self, params: &[(String, String)]) -> Url {
        let mut url = self.api_url.clone();
        url.set_query(None);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        url
    }
}

pub struct NotificationClient<S: Session> {
    session: Arc<S>,
    endpoint: NotificationsEndpoint,
}

impl<S: Session> NotificationClient<S> {
    pub fn new(session: Arc<S>, endpoint: NotificationsEndpoint) -> Self {
        Self { session, endpoint }
    }

    pub fn endpoint(&self) -> &NotificationsEndpoint {
        &self.endpoint
    }

    /// True iff the session holds valid session cookies for the endpoint's cookie domain.
    pub fn is_authenticated(&self) -> bool {
        self.session
            .has_valid_session_cookies(&self.endpoint.cookie_domain)
    }

    pub fn list_unread(
        &self,
        wiki_subdomains: &[String],
    ) -> Result<BTreeSet<Notification>, ClientError> {
        self.list(
            wiki_subdomains,
            NotificationLimit::Max,
            NotificationFilter::Unread,
        )
    }

    /// Fetches notifications for the given wikis in one request.
    ///
    /// A response without `query` (or without `query.notifications`) is an
    /// empty set. API errors and malformed payloads are returned as errors.
    pub fn list(
        &self,
        wiki_subdomains: &[String],
        limit: NotificationLimit,
        filter: NotificationFilter,
    ) -> Result<BTreeSet<Notification>, ClientError> {
        let url = self
            .endpoint
            .url_with_query(&list_params(wiki_subdomains, limit, filter));
        let payload = self.session.get_json(&url, RequestPriority::Default)?;
        let envelope: NotificationsEnvelope = serde_json::from_value(payload)
            .map_err(|error| ClientError::decode("notifications response", error))?;
        if let Some(error) = envelope.error {
            return Err(error.into());
        }

        let list = envelope
            .query
            .and_then(|query| query.notifications)
            .map(|notifications| notifications.list)
            .unwrap_or_default();
        list.into_iter().map(Notification::try_from).collect()
    }

    /// Marks notifications read in concurrent batches of [`MARK_READ_BATCH_SIZE`].
    ///
    /// Every batch runs to completion. If any failed, the error is
    /// [`ClientError::Aggregate`] with the failures in batch order.
    pub fn mark_read(&self, notifications: &BTreeSet<Notification>) -> Result<(), ClientError> {
        let ordered = notifications.iter().collect::<Vec<_>>();
        let chunks = ordered.chunks(MARK_READ_BATCH_SIZE).collect::<Vec<_>>();
        let total = chunks.len();

        let outcomes = join_ordered(chunks, |index, chunk| {
            let outcome = self.mark_chunk_read(chunk);
            if let Err(error) = &outcome {
                tracing::debug!(batch = index, size = chunk.len(), %error, "mark as read batch failed");
            }
            outcome
        });

        let errors = outcomes
            .into_iter()
            .filter_map(Result::err)
            .collect::<Vec<_>>();
        if errors.is_empty() {
            return Ok(());
        }
        tracing::error!("{} of {} mark as read requests failed", errors.len(), total);
        Err(ClientError::Aggregate { total, errors })
    }

    fn mark_chunk_read(&self, chunk: &[&Notification]) -> Result<(), ClientError> {
        let mut form = mark_read_params(chunk)?;
        let token = self.session.csrf_token(&self.endpoint.api_url)?;
        form.push(("token".to_string(), token));
        let url = self.endpoint.url_with_query(&[]);
        let payload = self.session.post_form_json(&url, &form)?;
        interpret_mark_read(payload)
    }
}

impl<S: Session> Clone for NotificationClient<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// `en` -> `enwiki`, `zh-min-nan` -> `zh_min_nanwiki`.
pub fn wiki_database_name(subdomain: &str) -> String {
    format!("{}wiki", subdomain.replace('-', "_"))
}

fn list_params(
    wiki_subdomains: &[String],
    limit: NotificationLimit,
    filter: NotificationFilter,
) -> Vec<(String, String)> {
    let mut params = vec![
        ("action".to_string(), "query".to_string()),
        ("format".to_string(), "json".to_string()),
        ("formatversion".to_string(), "2".to_string()),
        ("notformat".to_string(), "model".to_string()),
        ("meta".to_string(), "notifications".to_string()),
        ("notlimit".to_string(), limit.as_param()),
        ("notfilter".to_string(), filter.as_param().to_string()),
    ];
    let wikis = wiki_subdomains
        .iter()
        .map(|subdomain| wiki_database_name(subdomain))
        .collect::<Vec<_>>();
    if !wikis.is_empty() {
        params.push(("notwikis".to_string(), wikis.join("|")));
    }
    params
}

fn mark_read_params(chunk: &[&Notification]) -> Result<Vec<(String, String)>, ClientError> {
    let ids = chunk
        .iter()
        .map(|notification| notification.id.clone())
        .collect::<Vec<_>>();
    let wikis = dedupe(
        chunk
            .iter()
            .filter_map(|notification| notification.wiki.clone())
            .collect(),
    );
    debug_assert!(!ids.is_empty(), "list of notification ids cannot be empty");
    debug_assert!(!wikis.is_empty(), "list of notification wikis cannot be empty");
    if ids.is_empty() || wikis.is_empty() {
        return Err(ClientError::InvalidParameters(
            "mark as read requires at least one id and one wiki".to_string(),
        ));
    }

    Ok(vec![
        ("action".to_string(), "echomarkread".to_string()),
        ("format".to_string(), "json".to_string()),
        ("wikis".to_string(), wikis.join("|")),
        ("list".to_string(), ids.join("|")),
    ])
}

fn interpret_mark_read(payload: Value) -> Result<(), ClientError> {
    let envelope: MarkReadEnvelope = serde_json::from_value(payload)
        .map_err(|error| ClientError::decode("mark as read response", error))?;
    if let Some(error) = envelope.error {
        return Err(error.into());
    }
    let result = envelope
        .query
        .and_then(|query| query.echomarkread)
        .and_then(|payload| payload.result);
    match result.as_deref() {
        Some("success") => Ok(()),
        _ => Err(ClientError::OperationNotConfirmed),
    }
}

fn dedupe(values: Vec<String>) -> Vec<String> {
    let mut output = Vec::new();
    let mut seen = HashSet::new();
    for value in values {
        if seen.insert(value.clone()) {
            output.push(value);
        }
    }
    output
}
