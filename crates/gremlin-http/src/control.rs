//! Control-plane client
//!
//! Rules live under `{base}/v1/rules`, version routing under
//! `{base}/v1/versions/<service>`.

use crate::config::HttpConfig;
use crate::endpoint::{expect_success, read_json, Endpoint};
use gremlin_core::routing::ServiceVersions;
use gremlin_core::{ControlPlane, FaultRule, RoutingControl, StoredRule, TransportError};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct PushBody<'a> {
    rules: &'a [FaultRule],
}

#[derive(Deserialize)]
struct PushResponse {
    ids: Vec<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    rules: Vec<StoredRule>,
}

/// Blocking client for the mesh controller
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    endpoint: Endpoint,
}

impl HttpControlPlane {
    /// Client for the controller described by `config`
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(config: &HttpConfig) -> Result<Self, TransportError> {
        Ok(Self {
            endpoint: Endpoint::new(config)?,
        })
    }

    /// Base URL of the controller
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.endpoint.base()
    }

    fn rules_url(&self) -> String {
        self.endpoint.url("/v1/rules")
    }

    fn versions_url(&self, service: &str) -> String {
        self.endpoint.url(&format!("/v1/versions/{service}"))
    }

    fn delete_where(&self, key: &str, value: &str) -> Result<(), TransportError> {
        let url = self.rules_url();
        let request = self.endpoint.request(Method::DELETE, &url).query(&[(key, value)]);
        expect_success(&url, self.endpoint.send(&url, request)?)?;
        Ok(())
    }
}

impl ControlPlane for HttpControlPlane {
    fn push_rules(&self, rules: &[FaultRule]) -> Result<Vec<String>, TransportError> {
        let url = self.rules_url();
        let request = self
            .endpoint
            .request(Method::POST, &url)
            .json(&PushBody { rules });
        let response = self.endpoint.send(&url, request)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(TransportError::PushFailed { status, body });
        }
        let pushed: PushResponse = read_json(&url, response)?;
        tracing::debug!(count = pushed.ids.len(), "controller accepted rules");
        Ok(pushed.ids)
    }

    fn delete_rule(&self, id: &str) -> Result<(), TransportError> {
        self.delete_where("id", id)
    }

    fn delete_rules_by_tag(&self, tag: &str) -> Result<(), TransportError> {
        self.delete_where("tag", tag)
    }

    fn list_rules(&self) -> Result<Vec<StoredRule>, TransportError> {
        let url = self.rules_url();
        let request = self.endpoint.request(Method::GET, &url);
        let response = expect_success(&url, self.endpoint.send(&url, request)?)?;
        Ok(read_json::<ListResponse>(&url, response)?.rules)
    }

    fn clear_rules(&self) -> Result<(), TransportError> {
        let url = self.rules_url();
        let request = self.endpoint.request(Method::DELETE, &url);
        expect_success(&url, self.endpoint.send(&url, request)?)?;
        Ok(())
    }
}

impl RoutingControl for HttpControlPlane {
    fn get_versions(&self, service: &str) -> Result<Option<ServiceVersions>, TransportError> {
        let url = self.versions_url(service);
        let request = self.endpoint.request(Method::GET, &url);
        let response = self.endpoint.send(&url, request)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = expect_success(&url, response)?;
        read_json(&url, response).map(Some)
    }

    fn set_versions(&self, service: &str, versions: &ServiceVersions) -> Result<(), TransportError> {
        let url = self.versions_url(service);
        let request = self.endpoint.request(Method::PUT, &url).json(versions);
        expect_success(&url, self.endpoint.send(&url, request)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_built_on_the_normalized_base() {
        let control = HttpControlPlane::new(&HttpConfig::new("controller:6379/")).unwrap();
        assert_eq!(control.rules_url(), "http://controller:6379/v1/rules");
        assert_eq!(control.versions_url("reviews"), "http://controller:6379/v1/versions/reviews");
    }

    #[test]
    fn test_list_response_tolerates_missing_rules() {
        let parsed: ListResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.rules.is_empty());
    }
}
