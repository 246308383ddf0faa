//! Gremlin Server - the recipe service
//!
//! - `POST /api/v1/recipes` installs a recipe's rules and answers its id
//! - `POST /api/v1/recipes/:id` checks a checklist against that recipe's traces
//! - `DELETE /api/v1/recipes/:id` removes every rule tagged with the recipe
//!
//! Core calls block, so handlers run them on tokio's blocking pool.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod config;
pub mod error;
mod handlers;

use axum::routing::{get, post};
use axum::Router;
use gremlin_core::{ControlPlane, LogStore, TransportError};
use std::sync::Arc;

pub use config::ServerConfig;
pub use error::ApiError;

/// Opens the log store for a checklist, honoring its `log_server` override
pub type StoreFactory = dyn Fn(Option<&str>) -> Result<Arc<dyn LogStore>, TransportError> + Send + Sync;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    control: Arc<dyn ControlPlane>,
    stores: Arc<StoreFactory>,
}

impl AppState {
    /// State over `control`, opening log stores through `stores`
    pub fn new(
        control: Arc<dyn ControlPlane>,
        stores: impl Fn(Option<&str>) -> Result<Arc<dyn LogStore>, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            control,
            stores: Arc::new(stores),
        }
    }

    /// State whose checks always use `store`
    #[must_use]
    pub fn with_store(control: Arc<dyn ControlPlane>, store: Arc<dyn LogStore>) -> Self {
        Self::new(control, move |_| Ok(store.clone()))
    }

    pub(crate) fn control(&self) -> Arc<dyn ControlPlane> {
        self.control.clone()
    }

    pub(crate) fn log_store(&self, server: Option<&str>) -> Result<Arc<dyn LogStore>, TransportError> {
        (self.stores)(server)
    }
}

/// Routes of the recipe service
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/api/v1/recipes", post(handlers::create_recipe))
        .route(
            "/api/v1/recipes/:recipe_id",
            post(handlers::check_recipe).delete(handlers::delete_recipe),
        )
        .with_state(state)
}
