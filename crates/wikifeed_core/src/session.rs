use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::blocking::{Client, Response};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::config::FeedConfig;
use crate::error::{ClientError, WireError};

/// Cookies that together mark a logged-in central-auth session.
pub const SESSION_COOKIE_NAMES: &[&str] = &["centralauth_User", "centralauth_Session"];

const ANONYMOUS_CSRF_TOKEN: &str = "+\\";

/// Scheduling hint for a request. The blocking transport only records it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestPriority {
    Low,
    #[default]
    Default,
    High,
}

impl RequestPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Default => "default",
            Self::High => "high",
        }
    }
}

/// Transport and auth-state capability shared by the clients.
pub trait Session: Send + Sync {
    fn get_json(&self, url: &Url, priority: RequestPriority) -> Result<Value, ClientError>;
    fn post_form_json(&self, url: &Url, form: &[(String, String)]) -> Result<Value, ClientError>;
    fn has_valid_session_cookies(&self, domain: &str) -> bool;
    fn csrf_token(&self, api_url: &Url) -> Result<String, ClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl HttpSessionConfig {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
            max_retries: config.retries(),
            retry_delay_ms: config.retry_delay_ms(),
        }
    }
}

pub struct HttpSession {
    client: Client,
    jar: Arc<Jar>,
    config: HttpSessionConfig,
}

impl HttpSession {
    pub fn new(config: HttpSessionConfig) -> Result<Self, ClientError> {
        let jar = Arc::new(Jar::default());
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_provider(Arc::clone(&jar))
            .build()
            .map_err(|error| {
                ClientError::Transport(format!("failed to build HTTP client: {error}"))
            })?;

        Ok(Self {
            client,
            jar,
            config,
        })
    }

    /// Builds a session and seeds its jar with the cookies listed in `[session]`.
    pub fn from_config(config: &FeedConfig) -> Result<Self, ClientError> {
        let session = Self::new(HttpSessionConfig::from_config(config))?;
        let domain = config.cookie_domain();
        for cookie in &config.session.cookies {
            session.add_cookie(cookie, &domain)?;
        }
        Ok(session)
    }

    pub fn add_cookie(&self, cookie: &str, domain: &str) -> Result<(), ClientError> {
        let url = cookie_domain_url(domain)?;
        self.jar.add_cookie_str(cookie, &url);
        Ok(())
    }

    fn read_json(&self, response: Response) -> Result<Value, ClientError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Transport(format!(
                "request failed with HTTP {status}"
            )));
        }
        let bytes = response
            .bytes()
            .map_err(|error| ClientError::Transport(error.to_string()))?;
        serde_json::from_slice::<Value>(&bytes)
            .map_err(|error| ClientError::decode("JSON response", error))
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl Session for HttpSession {
    fn get_json(&self, url: &Url, priority: RequestPriority) -> Result<Value, ClientError> {
        tracing::debug!(url = %url, priority = priority.as_str(), "GET");
        for attempt in 0..=self.config.max_retries {
            let response = self
                .client
                .get(url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .send();
            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success()
                        && attempt < self.config.max_retries
                        && is_retryable_status(status)
                    {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return self.read_json(response);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(ClientError::Transport(error.to_string()));
                }
            }
        }

        Err(ClientError::Transport(
            "request exhausted retry budget".to_string(),
        ))
    }

    fn post_form_json(&self, url: &Url, form: &[(String, String)]) -> Result<Value, ClientError> {
        tracing::debug!(url = %url, fields = form.len(), "POST");
        let response = self
            .client
            .post(url.clone())
            .header("User-Agent", self.config.user_agent.clone())
            .form(form)
            .send()
            .map_err(|error| ClientError::Transport(error.to_string()))?;
        self.read_json(response)
    }

    fn has_valid_session_cookies(&self, domain: &str) -> bool {
        let Ok(url) = cookie_domain_url(domain) else {
            return false;
        };
        let Some(header) = self.jar.cookies(&url) else {
            return false;
        };
        let Ok(header) = header.to_str() else {
            return false;
        };
        cookie_header_has_session(header)
    }

    fn csrf_token(&self, api_url: &Url) -> Result<String, ClientError> {
        let mut url = api_url.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("action", "query")
            .append_pair("meta", "tokens")
            .append_pair("type", "csrf")
            .append_pair("format", "json")
            .append_pair("formatversion", "2");
        let payload = self.get_json(&url, RequestPriority::High)?;
        parse_csrf_token(payload)
    }
}

pub(crate) fn parse_csrf_token(payload: Value) -> Result<String, ClientError> {
    let parsed: TokenQueryResponse = serde_json::from_value(payload)
        .map_err(|error| ClientError::decode("csrf token response", error))?;
    if let Some(error) = parsed.error {
        return Err(error.into());
    }
    let token = parsed
        .query
        .tokens
        .and_then(|tokens| tokens.csrftoken)
        .ok_or_else(|| ClientError::TokenUnavailable("missing csrf token".to_string()))?;
    if token.is_empty() || token == ANONYMOUS_CSRF_TOKEN {
        return Err(ClientError::TokenUnavailable(
            "session is not authenticated".to_string(),
        ));
    }
    Ok(token)
}

fn cookie_domain_url(domain: &str) -> Result<Url, ClientError> {
    let host = domain.trim().trim_start_matches('.');
    if host.is_empty() {
        return Err(ClientError::InvalidParameters(
            "cookie domain is empty".to_string(),
        ));
    }
    Url::parse(&format!("https://{host}/")).map_err(|error| {
        ClientError::InvalidParameters(format!("invalid cookie domain {domain}: {error}"))
    })
}

fn cookie_header_has_session(header: &str) -> bool {
    SESSION_COOKIE_NAMES.iter().all(|name| {
        header.split(';').any(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next().unwrap_or("");
            let value = parts.next().unwrap_or("");
            key == *name && !value.is_empty()
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
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryResponse {
    error: Option<WireError>,
    #[serde(default)]
    query: TokenQueryPayload,
}

#[derive(Debug, Deserialize, Default)]
struct TokenQueryPayload {
    tokens: Option<TokenPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenPayload {
    csrftoken: Option<String>,
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use reqwest::Url;
    use serde_json::{Value, json};

    use super::{RequestPriority, Session};
    use crate::error::ClientError;

    type GetHandler = Box<dyn Fn(&Url) -> Result<Value, ClientError> + Send + Sync>;
    type PostHandler =
        Box<dyn Fn(&Url, &[(String, String)]) -> Result<Value, ClientError> + Send + Sync>;
    type TokenHandler = Box<dyn Fn() -> Result<String, ClientError> + Send + Sync>;

    pub(crate) struct MockSession {
        get_handler: GetHandler,
        post_handler: PostHandler,
        token_handler: TokenHandler,
        authenticated_domains: Mutex<BTreeSet<String>>,
        pub gets: Mutex<Vec<String>>,
        pub posts: Mutex<Vec<Vec<(String, String)>>>,
        pub token_requests: AtomicUsize,
    }

    impl Default for MockSession {
        fn default() -> Self {
            Self {
                get_handler: Box::new(|_| Ok(json!({}))),
                post_handler: Box::new(|_, _| {
                    Ok(json!({"query": {"echomarkread": {"result": "success"}}}))
                }),
                token_handler: Box::new(|| Ok("token+\\".to_string())),
                authenticated_domains: Mutex::new(BTreeSet::new()),
                gets: Mutex::new(Vec::new()),
                posts: Mutex::new(Vec::new()),
                token_requests: AtomicUsize::new(0),
            }
        }
    }

    impl MockSession {
        pub fn with_get(
            mut self,
            handler: impl Fn(&Url) -> Result<Value, ClientError> + Send + Sync + 'static,
        ) -> Self {
            self.get_handler = Box::new(handler);
            self
        }

        pub fn with_post(
            mut self,
            handler: impl Fn(&Url, &[(String, String)]) -> Result<Value, ClientError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            self.post_handler = Box::new(handler);
            self
        }

        pub fn with_token(
            mut self,
            handler: impl Fn() -> Result<String, ClientError> + Send + Sync + 'static,
        ) -> Self {
            self.token_handler = Box::new(handler);
            self
        }

        pub fn set_authenticated(&self, domain: &str, value: bool) {
            let mut domains = self.authenticated_domains.lock().expect("lock domains");
            if value {
                domains.insert(domain.to_string());
            } else {
                domains.remove(domain);
            }
        }

        pub fn get_urls(&self) -> Vec<String> {
            self.gets.lock().expect("lock gets").clone()
        }

        pub fn post_forms(&self) -> Vec<Vec<(String, String)>> {
            self.posts.lock().expect("lock posts").clone()
        }
    }

    impl Session for MockSession {
        fn get_json(&self, url: &Url, _priority: RequestPriority) -> Result<Value, ClientError> {
            self.gets.lock().expect("lock gets").push(url.to_string());
            (self.get_handler)(url)
        }

        fn post_form_json(
            &self,
            url: &Url,
            form: &[(String, String)],
        ) -> Result<Value, ClientError> {
            self.posts.lock().expect("lock posts").push(form.to_vec());
            (self.post_handler)(url, form)
        }

        fn has_valid_session_cookies(&self, domain: &str) -> bool {
            self.authenticated_domains
                .lock()
                .expect("lock domains")
                .contains(domain)
        }

        fn csrf_token(&self, _api_url: &Url) -> Result<String, ClientError> {
            self.token_requests.fetch_add(1, Ordering::SeqCst);
            (self.token_handler)()
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        HttpSession, HttpSessionConfig, Session, cookie_header_has_session, parse_csrf_token,
    };
    use crate::error::ClientError;

    fn session() -> HttpSession {
        HttpSession::new(HttpSessionConfig {
            user_agent: "wikifeed-test/0.1".to_string(),
            timeout_ms: 1_000,
            max_retries: 0,
            retry_delay_ms: 0,
        })
        .expect("build session")
    }

    #[test]
    fn session_cookies_require_both_names() {
        assert!(cookie_header_has_session(
            "centralauth_User=Alice; centralauth_Session=abc123"
        ));
        assert!(!cookie_header_has_session("centralauth_User=Alice"));
        assert!(!cookie_header_has_session(
            "centralauth_User=Alice; centralauth_Session="
        ));
    }

    #[test]
    fn jar_cookies_drive_authentication_state() {
        let session = session();
        assert!(!session.has_valid_session_cookies(".wikipedia.org"));

        session
            .add_cookie(
                "centralauth_User=Alice; Domain=.wikipedia.org; Path=/",
                ".wikipedia.org",
            )
            .expect("add user cookie");
        assert!(!session.has_valid_session_cookies(".wikipedia.org"));

        session
            .add_cookie(
                "centralauth_Session=abc123; Domain=.wikipedia.org; Path=/",
                ".wikipedia.org",
            )
            .expect("add session cookie");
        assert!(session.has_valid_session_cookies(".wikipedia.org"));
        assert!(!session.has_valid_session_cookies(".wiktionary.org"));
    }

    #[test]
    fn expired_cookie_is_not_a_valid_session() {
        let session = session();
        session
            .add_cookie("centralauth_User=Alice; Path=/", "wikipedia.org")
            .expect("add user cookie");
        session
            .add_cookie(
                "centralauth_Session=abc; Path=/; Expires=Thu, 01 Jan 1970 00:00:00 GMT",
                "wikipedia.org",
            )
            .expect("add expired cookie");
        assert!(!session.has_valid_session_cookies("wikipedia.org"));
    }

    #[test]
    fn empty_cookie_domain_is_rejected() {
        let session = session();
        assert!(matches!(
            session.add_cookie("a=b", "  "),
            Err(ClientError::InvalidParameters(_))
        ));
        assert!(!session.has_valid_session_cookies(""));
    }

    #[test]
    fn csrf_token_parsing_rejects_anonymous_token() {
        let token = parse_csrf_token(json!({"query": {"tokens": {"csrftoken": "abc+\\"}}}))
            .expect("token");
        assert_eq!(token, "abc+\\");

        let anonymous = parse_csrf_token(json!({"query": {"tokens": {"csrftoken": "+\\"}}}));
        assert!(matches!(anonymous, Err(ClientError::TokenUnavailable(_))));

        let missing = parse_csrf_token(json!({"batchcomplete": true}));
        assert!(matches!(missing, Err(ClientError::TokenUnavailable(_))));

        let api_error = parse_csrf_token(json!({"error": {"code": "readapidenied", "info": "no"}}));
        assert_eq!(
            api_error.expect_err("api error").api_code(),
            Some("readapidenied")
        );
    }
}
