use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use tally_core::AggregateId;
use tally_infra::projections::bike_status::{FIND_ALL, FIND_AVAILABLE, FIND_ONE};
use tally_infra::query_bus::QueryResponse;
use tally_rental::{ApproveRequest, BikeCommand, RegisterBike, RejectRequest, RequestBike, ReturnBike};

use crate::app::dto;
use crate::app::errors;
use crate::app::routes::common::{ApiQuery, parse_id};
use crate::app::services::AppServices;

pub const LOCATIONS: [&str; 11] = [
    "Amsterdam",
    "Paris",
    "Vilnius",
    "Barcelona",
    "London",
    "New York",
    "Toronto",
    "Berlin",
    "Milan",
    "Rome",
    "Belgrade",
];

const MAX_GENERATED_BIKES: usize = 1000;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_bikes).post(generate_bikes))
        .route("/available", get(available_bikes))
        .route("/:id", get(get_bike))
        .route("/:id/request", post(request_bike))
        .route("/:id/approve", post(approve_request))
        .route("/:id/reject", post(reject_request))
        .route("/:id/return", post(return_bike))
        .route("/:id/watch", get(watch_bike))
}

/// Uniform pick from `LOCATIONS`, using the random tail of a v7 UUID.
fn random_location() -> &'static str {
    let bytes = Uuid::now_v7().into_bytes();
    let n = u16::from_be_bytes([bytes[14], bytes[15]]) as usize;
    LOCATIONS[n % LOCATIONS.len()]
}

/// POST /bikes?bikes=N&bikeType=T
pub async fn generate_bikes(
    Extension(services): Extension<Arc<AppServices>>,
    ApiQuery(params): ApiQuery<dto::GenerateBikesParams>,
) -> Response {
    if params.bikes == 0 || params.bikes > MAX_GENERATED_BIKES {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("bikes must be between 1 and {MAX_GENERATED_BIKES}"),
        );
    }

    let mut bike_ids = Vec::with_capacity(params.bikes);
    for _ in 0..params.bikes {
        let bike_id = AggregateId::new();
        let command = BikeCommand::RegisterBike(RegisterBike {
            bike_id: bike_id.clone(),
            bike_type: params.bike_type.clone(),
            location: random_location().to_string(),
        });
        if let Err(e) = services.send_bike(command).await {
            return errors::dispatch_error_to_response(e);
        }
        bike_ids.push(bike_id.to_string());
    }

    (StatusCode::CREATED, Json(dto::BikesRegistered { bike_ids })).into_response()
}

/// GET /bikes
pub async fn list_bikes(Extension(services): Extension<Arc<AppServices>>) -> Response {
    errors::query_response(services.query(FIND_ALL, JsonValue::Null).await)
}

/// GET /bikes/available?bikeType=T
pub async fn available_bikes(
    Extension(services): Extension<Arc<AppServices>>,
    ApiQuery(params): ApiQuery<dto::AvailableBikesParams>,
) -> Response {
    let argument = params.bike_type.map(JsonValue::String).unwrap_or(JsonValue::Null);
    errors::query_response(services.query(FIND_AVAILABLE, argument).await)
}

/// GET /bikes/:id
pub async fn get_bike(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let bike_id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    errors::query_response(services.query(FIND_ONE, json!(bike_id.as_str())).await)
}

/// POST /bikes/:id/request?renter=R
///
/// Answers with the rental reference assigned to the request.
pub async fn request_bike(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<dto::RenterParams>,
) -> Response {
    let bike_id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let rental_reference = Uuid::now_v7();
    let command = BikeCommand::RequestBike(RequestBike {
        bike_id,
        renter: params.renter,
        rental_reference,
    });

    match services.send_bike(command).await {
        Ok(_) => (StatusCode::OK, Json(dto::RentalRequested { rental_reference })).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// POST /bikes/:id/approve?renter=R
pub async fn approve_request(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<dto::RenterParams>,
) -> Response {
    let bike_id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let command = BikeCommand::ApproveRequest(ApproveRequest {
        bike_id: bike_id.clone(),
        renter: params.renter,
    });
    lifecycle_response(&services, bike_id, command).await
}

/// POST /bikes/:id/reject?renter=R
pub async fn reject_request(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<dto::RenterParams>,
) -> Response {
    let bike_id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let command = BikeCommand::RejectRequest(RejectRequest {
        bike_id: bike_id.clone(),
        renter: params.renter,
    });
    lifecycle_response(&services, bike_id, command).await
}

/// POST /bikes/:id/return?location=L
pub async fn return_bike(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<dto::LocationParams>,
) -> Response {
    let bike_id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let command = BikeCommand::ReturnBike(ReturnBike {
        bike_id: bike_id.clone(),
        location: params.location,
    });
    lifecycle_response(&services, bike_id, command).await
}

async fn lifecycle_response(services: &AppServices, bike_id: AggregateId, command: BikeCommand) -> Response {
    match services.send_bike(command).await {
        Ok(committed) => Json(dto::Accepted {
            id: bike_id.to_string(),
            events_committed: committed.len(),
        })
        .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// GET /bikes/:id/watch
///
/// Server-sent events: the current status as a `status` event, then one
/// `status` event per change. A bike the projection has not seen yet is 404.
pub async fn watch_bike(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let bike_id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let (initial, updates) = match services.subscribe(FIND_ONE, json!(bike_id.as_str())).await {
        Ok((QueryResponse::Single(initial), updates)) => (initial, updates),
        Ok(_) => return errors::json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        Err(e) => return errors::query_error_to_response(e),
    };

    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();
    let _ = tx.send(Ok(status_event(&initial)));

    // Bridge the blocking subscription into the async response stream.
    tokio::task::spawn_blocking(move || {
        loop {
            match updates.recv_timeout(Duration::from_secs(1)) {
                Ok(update) => {
                    if tx.send(Ok(status_event(&update))).is_err() {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    if tx.is_closed() {
                        break;
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

fn status_event(status: &JsonValue) -> SseEvent {
    SseEvent::default().event("status").data(status.to_string())
}
