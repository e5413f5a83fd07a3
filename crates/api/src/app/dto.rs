//! Query-string parameters and response bodies.
//!
//! Parameter names follow the camelCase used by the original HTTP clients.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBikesParams {
    pub bikes: usize,
    pub bike_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableBikesParams {
    pub bike_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenterParams {
    pub renter: String,
}

#[derive(Debug, Deserialize)]
pub struct LocationParams {
    pub location: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConferenceParams {
    pub conference_id: String,
    pub conference_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceSpeakerParams {
    pub speaker_name: String,
}

#[derive(Debug, Serialize)]
pub struct BikesRegistered {
    pub bike_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RentalRequested {
    pub rental_reference: Uuid,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub id: String,
    pub events_committed: usize,
}
