use crate::config::HttpConfig;
use gremlin_core::TransportError;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Method;
use serde::de::DeserializeOwned;

/// One remote base URL with its client and credentials
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    client: Client,
    base: String,
    token: Option<String>,
}

impl Endpoint {
    pub(crate) fn new(config: &HttpConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::unreachable(&config.base_url, e))?;
        Ok(Self {
            client,
            base: config.base_url.clone(),
            token: config.token.clone(),
        })
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub(crate) fn send(&self, url: &str, builder: RequestBuilder) -> Result<Response, TransportError> {
        tracing::debug!(url, "sending request");
        builder.send().map_err(|e| TransportError::unreachable(url, e))
    }
}

/// Pass 2xx responses through, turn anything else into `UnexpectedStatus`
pub(crate) fn expect_success(url: &str, response: Response) -> Result<Response, TransportError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().unwrap_or_default();
    tracing::debug!(url, status, "request refused");
    Err(TransportError::UnexpectedStatus {
        endpoint: url.to_string(),
        status,
        body,
    })
}

pub(crate) fn read_json<T: DeserializeOwned>(url: &str, response: Response) -> Result<T, TransportError> {
    response.json::<T>().map_err(|e| TransportError::malformed(url, e))
}
