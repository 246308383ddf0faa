//! Gremlin HTTP - blocking clients for the remote collaborators
//!
//! - [`HttpControlPlane`]: fault rules and version routing
//! - [`ElasticLogStore`]: Elasticsearch-compatible request-log search
//! - [`HttpServiceRegistry`]: live service instances
//!
//! All clients are blocking. Do not call them from inside an async runtime;
//! the recipe service moves core calls onto tokio's blocking pool.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod control;
pub mod elastic;
mod endpoint;
pub mod registry;

pub use config::{normalize_base, HttpConfig};
pub use control::HttpControlPlane;
pub use elastic::ElasticLogStore;
pub use registry::HttpServiceRegistry;
