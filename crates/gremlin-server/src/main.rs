//! `gremlin-server` - the recipe service over HTTP

use anyhow::Context;
use gremlin_core::{ControlPlane, LogStore};
use gremlin_http::{ElasticLogStore, HttpConfig, HttpControlPlane};
use gremlin_server::{build_router, AppState, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_tracing(config: &ServerConfig) {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

// Blocking HTTP clients must be built outside the async runtime, so the
// control plane is created here and log stores on the blocking pool.
fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    init_tracing(&config);

    let controller = HttpConfig::new(&config.controller_url).with_token(Some(config.controller_token.clone()));
    let control: Arc<dyn ControlPlane> =
        Arc::new(HttpControlPlane::new(&controller).context("failed to create controller client")?);
    let default_log_server = config.log_server.clone();
    let state = AppState::new(control, move |server| {
        let server = server.unwrap_or(&default_log_server);
        let store: Arc<dyn LogStore> = Arc::new(ElasticLogStore::new(&HttpConfig::new(server), None)?);
        Ok(store)
    });

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("failed to bind {}", config.bind))?;
        tracing::info!(
            bind = %config.bind,
            controller = %config.controller_url,
            log_server = %config.log_server,
            "gremlin server listening"
        );
        axum::serve(listener, build_router(state))
            .await
            .context("server failed")
    })
}
