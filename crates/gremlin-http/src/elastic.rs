//! Elasticsearch-compatible log store

use crate::config::HttpConfig;
use crate::endpoint::{expect_success, read_json, Endpoint};
use gremlin_core::query::{LogQuery, SearchResult};
use gremlin_core::{LogStore, TransportError};
use reqwest::Method;
use serde_json::Value;

/// Index searched when none is configured
pub const ALL_INDICES: &str = "_all";

/// Searches request logs through `POST {host}/{index}/_search`
#[derive(Debug, Clone)]
pub struct ElasticLogStore {
    endpoint: Endpoint,
    index: String,
}

impl ElasticLogStore {
    /// Store at `config`, searching `index` (every index when `None`)
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(config: &HttpConfig, index: Option<&str>) -> Result<Self, TransportError> {
        Ok(Self {
            endpoint: Endpoint::new(config)?,
            index: index.filter(|i| !i.is_empty()).unwrap_or(ALL_INDICES).to_string(),
        })
    }

    fn search_url(&self) -> String {
        self.endpoint.url(&format!("/{}/_search", self.index))
    }
}

impl LogStore for ElasticLogStore {
    fn search(&self, query: &LogQuery) -> Result<SearchResult, TransportError> {
        let url = self.search_url();
        let body = query.to_search_body();
        tracing::debug!(url = %url, query = %body, "searching request logs");
        let request = self.endpoint.request(Method::POST, &url).json(&body);
        let response = expect_success(&url, self.endpoint.send(&url, request)?)?;
        let raw: Value = read_json(&url, response)?;
        SearchResult::from_es_response(&url, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_defaults_to_all() {
        let store = ElasticLogStore::new(&HttpConfig::new("es:9200"), None).unwrap();
        assert_eq!(store.search_url(), "http://es:9200/_all/_search");
        let store = ElasticLogStore::new(&HttpConfig::new("es:9200"), Some("")).unwrap();
        assert_eq!(store.search_url(), "http://es:9200/_all/_search");
        let store = ElasticLogStore::new(&HttpConfig::new("es:9200"), Some("logstash-*")).unwrap();
        assert_eq!(store.search_url(), "http://es:9200/logstash-*/_search");
    }
}
