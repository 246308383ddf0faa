//! Service settings read from the environment

/// Bind address used when `GREMLIN_BIND` is unset
pub const DEFAULT_BIND: &str = "0.0.0.0:5000";

/// Where the service listens and which collaborators it talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,
    /// Mesh controller URL
    pub controller_url: String,
    /// Controller bearer token, empty for none
    pub controller_token: String,
    /// Default log server; checklists may override it
    pub log_server: String,
    /// Log every outgoing request
    pub debug: bool,
    /// Emit diagnostics as JSON lines
    pub log_json: bool,
}

impl ServerConfig {
    /// Read settings from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        Self {
            bind: lookup("GREMLIN_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            controller_url: lookup("A8_CONTROLLER_URL").unwrap_or_else(|| "http://localhost:31200".to_string()),
            controller_token: lookup("A8_CONTROLLER_TOKEN").unwrap_or_default(),
            log_server: lookup("A8_LOG_SERVER").unwrap_or_else(|| "localhost:30200".to_string()),
            debug: flag("A8_DEBUG"),
            log_json: flag("GREMLIN_LOG_JSON"),
        }
    }
}
