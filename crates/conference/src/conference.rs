use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use tally_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use tally_events::{Command, Event};

/// Aggregate root: Conference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conference {
    id: AggregateId,
    name: String,
    speakers: BTreeSet<String>,
    version: u64,
    created: bool,
}

impl Conference {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn speakers(&self) -> impl Iterator<Item = &str> {
        self.speakers.iter().map(String::as_str)
    }
}

impl AggregateRoot for Conference {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConference {
    pub conference_id: AggregateId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceSpeaker {
    pub conference_id: AggregateId,
    pub speaker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ConferenceCommand {
    CreateConference(CreateConference),
    AnnounceSpeaker(AnnounceSpeaker),
}

impl Command for ConferenceCommand {
    fn target_aggregate_id(&self) -> &AggregateId {
        match self {
            ConferenceCommand::CreateConference(c) => &c.conference_id,
            ConferenceCommand::AnnounceSpeaker(c) => &c.conference_id,
        }
    }

    fn is_creation(&self) -> bool {
        matches!(self, ConferenceCommand::CreateConference(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceCreated {
    pub conference_id: AggregateId,
    pub name: String,
}

/// Carries the conference name so read models need no lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakerAnnounced {
    pub conference_id: AggregateId,
    pub conference_name: String,
    pub speaker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ConferenceEvent {
    ConferenceCreated(ConferenceCreated),
    SpeakerAnnounced(SpeakerAnnounced),
}

impl Event for ConferenceEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ConferenceEvent::ConferenceCreated(_) => "conference.created",
            ConferenceEvent::SpeakerAnnounced(_) => "conference.speaker_announced",
        }
    }
}

impl Aggregate for Conference {
    const AGGREGATE_TYPE: &'static str = "conference";

    type Command = ConferenceCommand;
    type Event = ConferenceEvent;
    type Error = DomainError;

    fn empty(id: AggregateId) -> Self {
        Self {
            id,
            name: String::new(),
            speakers: BTreeSet::new(),
            version: 0,
            created: false,
        }
    }

    fn exists(&self) -> bool {
        self.created
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ConferenceEvent::ConferenceCreated(e) => {
                self.id = e.conference_id.clone();
                self.name = e.name.clone();
                self.created = true;
            }
            ConferenceEvent::SpeakerAnnounced(e) => {
                self.speakers.insert(e.speaker.clone());
            }
        }
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.target_aggregate_id() != &self.id {
            return Err(DomainError::invariant("conference_id mismatch"));
        }

        match command {
            ConferenceCommand::CreateConference(cmd) => {
                if self.created {
                    return Err(DomainError::already_exists(format!("conference {}", self.id)));
                }
                let name = cmd.name.trim();
                if name.is_empty() {
                    return Err(DomainError::validation("conference name cannot be empty"));
                }
                Ok(vec![ConferenceEvent::ConferenceCreated(ConferenceCreated {
                    conference_id: cmd.conference_id.clone(),
                    name: name.to_string(),
                })])
            }
            ConferenceCommand::AnnounceSpeaker(cmd) => {
                if !self.created {
                    return Err(DomainError::not_found());
                }
                let speaker = cmd.speaker.trim();
                if speaker.is_empty() {
                    return Err(DomainError::validation("speaker cannot be empty"));
                }
                if self.speakers.contains(speaker) {
                    return Err(DomainError::rejected("speaker already announced"));
                }
                Ok(vec![ConferenceEvent::SpeakerAnnounced(SpeakerAnnounced {
                    conference_id: self.id.clone(),
                    conference_name: self.name.clone(),
                    speaker: speaker.to_string(),
                })])
            }
        }
    }
}
