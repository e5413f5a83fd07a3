//! HTTP application wiring (axum router + service wiring).
//!
//! - `services.rs`: event store, bus, projections, worker and gateway
//! - `routes/`: one file per sample (bikes, conferences)
//! - `dto.rs`: query-string parameters and JSON bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::config::Config;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub async fn build_app(config: &Config) -> anyhow::Result<Router> {
    let services = Arc::new(services::build_services(config).await?);
    Ok(router(services))
}

/// Router over already-built services.
pub fn router(services: Arc<services::AppServices>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
