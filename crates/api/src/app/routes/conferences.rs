use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value as JsonValue;

use tally_conference::{AnnounceSpeaker, ConferenceCommand, CreateConference};
use tally_infra::projections::conferences::ALL_CONFERENCES;
use tally_infra::projections::speakers::ALL_SPEAKERS;

use crate::app::dto;
use crate::app::errors;
use crate::app::routes::common::{ApiQuery, parse_id};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_conferences).post(create_conference))
        .route("/:id/speakers", post(announce_speaker))
}

/// POST /conferences?conferenceId=&conferenceName=
pub async fn create_conference(
    Extension(services): Extension<Arc<AppServices>>,
    ApiQuery(params): ApiQuery<dto::CreateConferenceParams>,
) -> Response {
    let conference_id = match parse_id(&params.conference_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let command = ConferenceCommand::CreateConference(CreateConference {
        conference_id: conference_id.clone(),
        name: params.conference_name,
    });

    match services.send_conference(command).await {
        Ok(committed) => (
            StatusCode::CREATED,
            Json(dto::Accepted {
                id: conference_id.to_string(),
                events_committed: committed.len(),
            }),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// GET /conferences
pub async fn list_conferences(Extension(services): Extension<Arc<AppServices>>) -> Response {
    errors::query_response(services.query(ALL_CONFERENCES, JsonValue::Null).await)
}

/// POST /conferences/:id/speakers?speakerName=
pub async fn announce_speaker(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    ApiQuery(params): ApiQuery<dto::AnnounceSpeakerParams>,
) -> Response {
    let conference_id = match parse_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let command = ConferenceCommand::AnnounceSpeaker(AnnounceSpeaker {
        conference_id: conference_id.clone(),
        speaker: params.speaker_name,
    });

    match services.send_conference(command).await {
        Ok(committed) => Json(dto::Accepted {
            id: conference_id.to_string(),
            events_committed: committed.len(),
        })
        .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

/// GET /speakers
pub async fn list_speakers(Extension(services): Extension<Arc<AppServices>>) -> Response {
    errors::query_response(services.query(ALL_SPEAKERS, JsonValue::Null).await)
}
