use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikifeed/0.1";
pub const DEFAULT_API_URL: &str = "https://www.mediawiki.org/w/api.php";
pub const DEFAULT_COOKIE_DOMAIN: &str = ".wikipedia.org";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FeedConfig {
    #[serde(default)]
    pub notifications: NotificationsSection,
    #[serde(default)]
    pub summary: SummarySection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub session: SessionSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct NotificationsSection {
    pub api_url: Option<String>,
    pub cookie_domain: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SummarySection {
    pub host: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SessionSection {
    /// `Set-Cookie` style strings seeded into the session cookie jar.
    #[serde(default)]
    pub cookies: Vec<String>,
}

impl FeedConfig {
    /// Resolve the action API URL: env WIKIFEED_API_URL > config > DEFAULT_API_URL.
    pub fn api_url(&self) -> String {
        env_string("WIKIFEED_API_URL")
            .or_else(|| self.notifications.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    /// Resolve the session cookie domain: env WIKIFEED_COOKIE_DOMAIN > config > default.
    pub fn cookie_domain(&self) -> String {
        env_string("WIKIFEED_COOKIE_DOMAIN")
            .or_else(|| self.notifications.cookie_domain.clone())
            .unwrap_or_else(|| DEFAULT_COOKIE_DOMAIN.to_string())
    }

    /// Summary host override; `None` means the host of each article URL is used.
    pub fn summary_host(&self) -> Option<String> {
        env_string("WIKIFEED_SUMMARY_HOST").or_else(|| self.summary.host.clone())
    }

    pub fn user_agent(&self) -> String {
        env_string("WIKIFEED_USER_AGENT")
            .or_else(|| self.http.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        env_parsed("WIKIFEED_HTTP_TIMEOUT_MS")
            .or(self.http.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn retries(&self) -> usize {
        env_parsed("WIKIFEED_HTTP_RETRIES")
            .or(self.http.retries)
            .unwrap_or(DEFAULT_RETRIES)
    }

    pub fn retry_delay_ms(&self) -> u64 {
        env_parsed("WIKIFEED_HTTP_RETRY_DELAY_MS")
            .or(self.http.retry_delay_ms)
            .unwrap_or(DEFAULT_RETRY_DELAY_MS)
    }
}

/// Load and parse a FeedConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<FeedConfig> {
    if !config_path.exists() {
        return Ok(FeedConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: FeedConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_string(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_uses_builtin_endpoints() {
        let config = FeedConfig::default();
        assert!(config.notifications.api_url.is_none());
        assert!(config.summary.host.is_none());
        assert!(config.session.cookies.is_empty());
        assert_eq!(config.http.timeout_ms, None);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/wikifeed.toml")).expect("load config");
        assert_eq!(config, FeedConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wikifeed.toml");
        fs::write(
            &config_path,
            r#"
[notifications]
api_url = "https://meta.example.org/w/api.php"
cookie_domain = ".example.org"

[summary]
host = "en.example.org"

[http]
user_agent = "test-agent/1.0"
timeout_ms = 1500
retries = 0

[session]
cookies = ["centralauth_User=Alice; Domain=.example.org; Path=/"]
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.notifications.api_url.as_deref(),
            Some("https://meta.example.org/w/api.php")
        );
        assert_eq!(
            config.notifications.cookie_domain.as_deref(),
            Some(".example.org")
        );
        assert_eq!(config.summary.host.as_deref(), Some("en.example.org"));
        assert_eq!(config.http.user_agent.as_deref(), Some("test-agent/1.0"));
        assert_eq!(config.http.timeout_ms, Some(1500));
        assert_eq!(config.http.retries, Some(0));
        assert_eq!(config.http.retry_delay_ms, None);
        assert_eq!(config.session.cookies.len(), 1);
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wikifeed.toml");
        fs::write(&config_path, "[summary]\nhost = \"de.example.org\"\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.notifications.api_url.is_none());
        assert_eq!(config.summary.host.as_deref(), Some("de.example.org"));
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wikifeed.toml");
        fs::write(&config_path, "[http\ntimeout_ms = 1").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn config_values_take_precedence_over_defaults() {
        let config = FeedConfig {
            notifications: NotificationsSection {
                api_url: Some("https://wiki.example.org/w/api.php".to_string()),
                cookie_domain: None,
            },
            http: HttpSection {
                retries: Some(5),
                ..HttpSection::default()
            },
            ..FeedConfig::default()
        };
        if env::var("WIKIFEED_API_URL").is_err() {
            assert_eq!(config.api_url(), "https://wiki.example.org/w/api.php");
        }
        if env::var("WIKIFEED_HTTP_RETRIES").is_err() {
            assert_eq!(config.retries(), 5);
        }
        if env::var("WIKIFEED_COOKIE_DOMAIN").is_err() {
            assert_eq!(config.cookie_domain(), DEFAULT_COOKIE_DOMAIN);
        }
    }
}
