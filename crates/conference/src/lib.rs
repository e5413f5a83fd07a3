//! Conference domain module (event-sourced): conference creation and speaker
//! announcements.

pub mod conference;

pub use conference::{
    AnnounceSpeaker, Conference, ConferenceCommand, ConferenceCreated, ConferenceEvent,
    CreateConference, SpeakerAnnounced,
};
