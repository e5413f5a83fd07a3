use axum::{Router, routing::get};

pub mod bikes;
pub mod common;
pub mod conferences;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .nest("/bikes", bikes::router())
        .nest("/conferences", conferences::router())
        .route("/speakers", get(conferences::list_speakers))
}
