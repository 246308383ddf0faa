//! Topology documents and input document loading
//!
//! A topology lists services and who calls whom:
//!
//! ```json
//! {
//!   "services": ["gateway", {"name": "reviews", "tags": ["v2"]}],
//!   "dependencies": {"gateway": ["productpage"], "productpage": ["reviews", "details"]}
//! }
//! ```

use crate::error::{DocumentError, ValidationError};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One entry of the `services` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceDecl {
    /// Bare `name` or `name:tags` string
    Name(String),
    /// Object form with explicit tags and proxy addresses
    Detailed {
        /// Service name, may carry `:tags`
        #[serde(default)]
        name: String,
        /// Version tags for this service
        #[serde(default)]
        tags: Vec<String>,
        /// Sidecar proxy addresses; informational only
        #[serde(default)]
        service_proxies: Vec<String>,
    },
}

impl ServiceDecl {
    /// Reference string for this declaration, tags folded in
    #[must_use]
    pub fn reference(&self) -> String {
        match self {
            Self::Name(name) => name.clone(),
            Self::Detailed { name, tags, .. } if tags.is_empty() => name.clone(),
            Self::Detailed { name, tags, .. } => format!("{name}:{}", tags.join(",")),
        }
    }
}

/// Declared service topology, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Declared services
    #[serde(default)]
    pub services: Vec<ServiceDecl>,
    /// Caller name → callee references
    #[serde(default)]
    pub dependencies: IndexMap<String, Vec<String>>,
}

impl Topology {
    /// Parse a topology from a JSON value
    ///
    /// Object keys keep their document order, so `dependencies` is walked in
    /// the order it was written.
    ///
    /// # Errors
    /// [`ValidationError::MalformedTopology`] if the value does not have the
    /// topology shape.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::MalformedTopology(e.to_string()))
    }

    /// Load a topology from a JSON or YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        Ok(load_document(path)?)
    }
}

/// Read a JSON or YAML document, choosing the format by file extension
///
/// # Errors
/// Returns [`DocumentError`] on IO or syntax errors.
pub fn load_document<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, DocumentError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| DocumentError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    tracing::debug!(path = %path.display(), yaml = is_yaml, "loading document");

    if is_yaml {
        serde_yaml::from_str(&text).map_err(|source| DocumentError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_json::from_str(&text).map_err(|source| DocumentError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn parses_mixed_service_declarations() {
        let topo = Topology::from_value(json!({
            "services": ["gateway", {"name": "reviews", "tags": ["v2"], "service_proxies": ["10.0.0.1:9877"]}],
            "dependencies": {"gateway": ["reviews"]}
        }))
        .unwrap();
        assert_eq!(topo.services[0].reference(), "gateway");
        assert_eq!(topo.services[1].reference(), "reviews:v2");
        assert_eq!(topo.dependencies["gateway"], vec!["reviews"]);
    }

    #[test]
    fn keeps_dependency_declaration_order() {
        let topo = Topology::from_value(json!({
            "dependencies": {"zeta": ["a"], "alpha": ["b"], "mid": ["c"]}
        }))
        .unwrap();
        let keys: Vec<&str> = topo.dependencies.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn load_keeps_dependency_declaration_order() {
        for (suffix, body) in [
            (".json", r#"{"dependencies": {"zeta": ["a"], "alpha": ["b"], "mid": ["c"]}}"#),
            (".yaml", "dependencies:\n  zeta: [a]\n  alpha: [b]\n  mid: [c]\n"),
        ] {
            let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
            write!(file, "{body}").unwrap();
            let topo = Topology::load(file.path()).unwrap();
            let keys: Vec<&str> = topo.dependencies.keys().map(String::as_str).collect();
            assert_eq!(keys, vec!["zeta", "alpha", "mid"], "{suffix}");
        }
    }

    #[test]
    fn rejects_wrong_shape() {
        let err = Topology::from_value(json!({"dependencies": ["not", "a", "map"]})).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedTopology(_)));
    }

    #[test]
    fn loads_yaml_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "services: [a, b]\ndependencies:\n  a: [b]").unwrap();
        let topo = Topology::load(file.path()).unwrap();
        assert_eq!(topo.services.len(), 2);
        assert_eq!(topo.dependencies["a"], vec!["b"]);
    }

    #[test]
    fn reports_json_syntax_errors_with_path() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = Topology::load(file.path()).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("invalid JSON"));
    }
}
