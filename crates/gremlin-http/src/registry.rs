//! Service-registry client

use crate::config::HttpConfig;
use crate::endpoint::{expect_success, read_json, Endpoint};
use gremlin_core::routing::ServiceInstance;
use gremlin_core::{ServiceRegistry, TransportError};
use reqwest::Method;
use serde::Deserialize;

#[derive(Deserialize)]
struct ServiceList {
    #[serde(default)]
    services: Vec<String>,
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<ServiceInstance>,
}

/// Blocking client for `{base}/api/v1/services`
#[derive(Debug, Clone)]
pub struct HttpServiceRegistry {
    endpoint: Endpoint,
}

impl HttpServiceRegistry {
    /// Client for the registry described by `config`
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(config: &HttpConfig) -> Result<Self, TransportError> {
        Ok(Self {
            endpoint: Endpoint::new(config)?,
        })
    }

    fn get<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, TransportError> {
        let url = self.endpoint.url(path);
        let request = self.endpoint.request(Method::GET, &url);
        let response = expect_success(&url, self.endpoint.send(&url, request)?)?;
        read_json(&url, response)
    }
}

impl ServiceRegistry for HttpServiceRegistry {
    fn list_services(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.get::<ServiceList>("/api/v1/services")?.services)
    }

    fn instances(&self, service: &str) -> Result<Vec<ServiceInstance>, TransportError> {
        Ok(self
            .get::<InstanceList>(&format!("/api/v1/services/{service}"))?
            .instances)
    }
}
