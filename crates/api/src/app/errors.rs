use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use tally_infra::command_dispatcher::DispatchError;
use tally_infra::event_store::EventStoreError;
use tally_infra::query_bus::{QueryError, QueryResponse};
use tally_infra::read_model::ReadModelError;

pub fn dispatch_error_to_response(err: DispatchError) -> Response {
    match err {
        DispatchError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DispatchError::Rejected(msg) => json_error(StatusCode::CONFLICT, "rejected", msg),
        DispatchError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DispatchError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DispatchError::AlreadyExists(msg) => json_error(StatusCode::CONFLICT, "already_exists", msg),
        DispatchError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DispatchError::Timeout(after) => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            format!("command did not complete within {}ms; its outcome is unknown", after.as_millis()),
        ),
        DispatchError::Store(EventStoreError::Unavailable(msg)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        DispatchError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
        DispatchError::Deserialize(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "deserialize_error", msg),
        DispatchError::Replay(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "replay_error", e.to_string()),
        DispatchError::Publish(msg) => json_error(StatusCode::BAD_GATEWAY, "publish_error", msg),
        DispatchError::Worker(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "worker_error", msg),
    }
}

pub fn query_error_to_response(err: QueryError) -> Response {
    match err {
        QueryError::InvalidArgument { message, .. } => json_error(StatusCode::BAD_REQUEST, "invalid_argument", message),
        QueryError::Store(ReadModelError::Unavailable(msg)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "read_model_unavailable", msg)
        }
        other => json_error(StatusCode::INTERNAL_SERVER_ERROR, "query_error", other.to_string()),
    }
}

/// `Single` and `Many` are 200s; `NotFound` is a 404, never an empty body.
pub fn query_response(result: Result<QueryResponse, QueryError>) -> Response {
    match result {
        Ok(QueryResponse::Single(value)) => Json(value).into_response(),
        Ok(QueryResponse::Many(values)) => Json(values).into_response(),
        Ok(QueryResponse::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        Err(e) => query_error_to_response(e),
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
