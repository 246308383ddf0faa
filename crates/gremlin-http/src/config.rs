//! Connection settings shared by every client

use std::time::Duration;

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a collaborator lives and how to authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Base URL, always with a scheme and without a trailing slash
    pub base_url: String,
    /// Bearer token; never empty when set
    pub token: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl HttpConfig {
    /// Settings for `base_url`; a missing scheme defaults to `http://`
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: normalize_base(base_url),
            token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Authenticate with `token`; empty tokens are ignored
    #[must_use]
    pub fn with_token(mut self, token: Option<impl Into<String>>) -> Self {
        self.token = token.map(Into::into).filter(|t| !t.is_empty());
        self
    }

    /// Override the per-request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Add `http://` to scheme-less hosts and drop trailing slashes
#[must_use]
pub fn normalize_base(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_is_added_when_missing() {
        assert_eq!(normalize_base("es.local:9200"), "http://es.local:9200");
        assert_eq!(normalize_base("https://a8.example/"), "https://a8.example");
        assert_eq!(normalize_base(" http://10.0.0.1:8080// "), "http://10.0.0.1:8080");
    }

    #[test]
    fn test_empty_token_means_no_auth() {
        let config = HttpConfig::new("controller").with_token(Some(""));
        assert_eq!(config.token, None);
        let config = HttpConfig::new("controller").with_token(Some("s3cret"));
        assert_eq!(config.token.as_deref(), Some("s3cret"));
        let config = HttpConfig::new("controller").with_token(None::<String>);
        assert_eq!(config.token, None);
    }
}
