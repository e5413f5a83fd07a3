use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tally_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use tally_events::{Command, Event};

/// Where a bike is in the rental lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RentalStatus {
    #[default]
    Available,
    Requested,
    Rented,
}

impl core::fmt::Display for RentalStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            RentalStatus::Available => "AVAILABLE",
            RentalStatus::Requested => "REQUESTED",
            RentalStatus::Rented => "RENTED",
        })
    }
}

/// Aggregate root: Bike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bike {
    id: AggregateId,
    bike_type: String,
    location: String,
    status: RentalStatus,
    renter: Option<String>,
    rental_reference: Option<Uuid>,
    version: u64,
    registered: bool,
}

impl Bike {
    pub fn bike_type(&self) -> &str {
        &self.bike_type
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn status(&self) -> RentalStatus {
        self.status
    }

    /// Renter holding the current request or rental.
    pub fn renter(&self) -> Option<&str> {
        self.renter.as_deref()
    }

    pub fn rental_reference(&self) -> Option<Uuid> {
        self.rental_reference
    }

    pub fn is_available(&self) -> bool {
        self.registered && self.status == RentalStatus::Available
    }
}

impl AggregateRoot for Bike {
    type Id = AggregateId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBike {
    pub bike_id: AggregateId,
    pub bike_type: String,
    pub location: String,
}

/// Ask to rent a bike. `rental_reference` is chosen by the caller and echoed
/// back in `BikeRequested`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBike {
    pub bike_id: AggregateId,
    pub renter: String,
    pub rental_reference: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub bike_id: AggregateId,
    pub renter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectRequest {
    pub bike_id: AggregateId,
    pub renter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnBike {
    pub bike_id: AggregateId,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BikeCommand {
    RegisterBike(RegisterBike),
    RequestBike(RequestBike),
    ApproveRequest(ApproveRequest),
    RejectRequest(RejectRequest),
    ReturnBike(ReturnBike),
}

impl Command for BikeCommand {
    fn target_aggregate_id(&self) -> &AggregateId {
        match self {
            BikeCommand::RegisterBike(c) => &c.bike_id,
            BikeCommand::RequestBike(c) => &c.bike_id,
            BikeCommand::ApproveRequest(c) => &c.bike_id,
            BikeCommand::RejectRequest(c) => &c.bike_id,
            BikeCommand::ReturnBike(c) => &c.bike_id,
        }
    }

    fn is_creation(&self) -> bool {
        matches!(self, BikeCommand::RegisterBike(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BikeRegistered {
    pub bike_id: AggregateId,
    pub bike_type: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BikeRequested {
    pub bike_id: AggregateId,
    pub renter: String,
    pub rental_reference: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BikeInUse {
    pub bike_id: AggregateId,
    pub renter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRejected {
    pub bike_id: AggregateId,
    pub renter: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BikeReturned {
    pub bike_id: AggregateId,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum BikeEvent {
    BikeRegistered(BikeRegistered),
    BikeRequested(BikeRequested),
    BikeInUse(BikeInUse),
    RequestRejected(RequestRejected),
    BikeReturned(BikeReturned),
}

impl BikeEvent {
    pub fn bike_id(&self) -> &AggregateId {
        match self {
            BikeEvent::BikeRegistered(e) => &e.bike_id,
            BikeEvent::BikeRequested(e) => &e.bike_id,
            BikeEvent::BikeInUse(e) => &e.bike_id,
            BikeEvent::RequestRejected(e) => &e.bike_id,
            BikeEvent::BikeReturned(e) => &e.bike_id,
        }
    }
}

impl Event for BikeEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BikeEvent::BikeRegistered(_) => "rental.bike.registered",
            BikeEvent::BikeRequested(_) => "rental.bike.requested",
            BikeEvent::BikeInUse(_) => "rental.bike.in_use",
            BikeEvent::RequestRejected(_) => "rental.bike.request_rejected",
            BikeEvent::BikeReturned(_) => "rental.bike.returned",
        }
    }
}

impl Aggregate for Bike {
    const AGGREGATE_TYPE: &'static str = "rental.bike";

    type Command = BikeCommand;
    type Event = BikeEvent;
    type Error = DomainError;

    fn empty(id: AggregateId) -> Self {
        Self {
            id,
            bike_type: String::new(),
            location: String::new(),
            status: RentalStatus::Available,
            renter: None,
            rental_reference: None,
            version: 0,
            registered: false,
        }
    }

    fn exists(&self) -> bool {
        self.registered
    }

    fn apply(&mut self, event: &Self::Event) {
        match event {
            BikeEvent::BikeRegistered(e) => {
                self.id = e.bike_id.clone();
                self.bike_type = e.bike_type.clone();
                self.location = e.location.clone();
                self.status = RentalStatus::Available;
                self.registered = true;
            }
            BikeEvent::BikeRequested(e) => {
                self.status = RentalStatus::Requested;
                self.renter = Some(e.renter.clone());
                self.rental_reference = Some(e.rental_reference);
            }
            BikeEvent::BikeInUse(_) => {
                self.status = RentalStatus::Rented;
            }
            BikeEvent::RequestRejected(_) => self.release(),
            BikeEvent::BikeReturned(e) => {
                self.location = e.location.clone();
                self.release();
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.target_aggregate_id() != &self.id {
            return Err(DomainError::invariant("bike_id mismatch"));
        }
        if !self.registered && !command.is_creation() {
            return Err(DomainError::not_found());
        }

        match command {
            BikeCommand::RegisterBike(cmd) => self.handle_register(cmd),
            BikeCommand::RequestBike(cmd) => self.handle_request(cmd),
            BikeCommand::ApproveRequest(cmd) => {
                self.ensure_pending_for(cmd.renter.trim())?;
                Ok(vec![BikeEvent::BikeInUse(BikeInUse {
                    bike_id: self.id.clone(),
                    renter: cmd.renter.trim().to_string(),
                })])
            }
            BikeCommand::RejectRequest(cmd) => {
                self.ensure_pending_for(cmd.renter.trim())?;
                Ok(vec![BikeEvent::RequestRejected(RequestRejected {
                    bike_id: self.id.clone(),
                    renter: cmd.renter.trim().to_string(),
                })])
            }
            BikeCommand::ReturnBike(cmd) => self.handle_return(cmd),
        }
    }
}

impl Bike {
    fn release(&mut self) {
        self.status = RentalStatus::Available;
        self.renter = None;
        self.rental_reference = None;
    }

    fn handle_register(&self, cmd: &RegisterBike) -> Result<Vec<BikeEvent>, DomainError> {
        if self.registered {
            return Err(DomainError::already_exists(format!("bike {}", self.id)));
        }
        if cmd.bike_type.trim().is_empty() {
            return Err(DomainError::validation("bike_type cannot be empty"));
        }
        if cmd.location.trim().is_empty() {
            return Err(DomainError::validation("location cannot be empty"));
        }
        Ok(vec![BikeEvent::BikeRegistered(BikeRegistered {
            bike_id: cmd.bike_id.clone(),
            bike_type: cmd.bike_type.trim().to_string(),
            location: cmd.location.trim().to_string(),
        })])
    }

    fn handle_request(&self, cmd: &RequestBike) -> Result<Vec<BikeEvent>, DomainError> {
        if cmd.renter.trim().is_empty() {
            return Err(DomainError::validation("renter cannot be empty"));
        }
        if self.status != RentalStatus::Available {
            return Err(DomainError::rejected("bike is already rented"));
        }
        Ok(vec![BikeEvent::BikeRequested(BikeRequested {
            bike_id: self.id.clone(),
            renter: cmd.renter.trim().to_string(),
            rental_reference: cmd.rental_reference,
        })])
    }

    /// Approve and reject both require an unconfirmed request from `renter`.
    fn ensure_pending_for(&self, renter: &str) -> Result<(), DomainError> {
        match self.status {
            RentalStatus::Available => Err(DomainError::rejected("bike has no pending request")),
            RentalStatus::Rented => Err(DomainError::rejected("rental is already confirmed")),
            RentalStatus::Requested if self.renter.as_deref() != Some(renter) => {
                Err(DomainError::rejected("bike is requested by another renter"))
            }
            RentalStatus::Requested => Ok(()),
        }
    }

    fn handle_return(&self, cmd: &ReturnBike) -> Result<Vec<BikeEvent>, DomainError> {
        if self.status == RentalStatus::Available {
            return Err(DomainError::rejected("bike was already returned"));
        }
        if cmd.location.trim().is_empty() {
            return Err(DomainError::validation("location cannot be empty"));
        }
        Ok(vec![BikeEvent::BikeReturned(BikeReturned {
            bike_id: self.id.clone(),
            location: cmd.location.trim().to_string(),
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use tally_events::{EventEnvelope, execute, replay};

    fn test_bike_id() -> AggregateId {
        "B1".parse().unwrap()
    }

    fn registered_bike() -> Bike {
        let mut bike = Bike::empty(test_bike_id());
        execute(
            &mut bike,
            &BikeCommand::RegisterBike(RegisterBike {
                bike_id: test_bike_id(),
                bike_type: "city".to_string(),
                location: "Paris".to_string(),
            }),
        )
        .unwrap();
        bike
    }

    fn request(renter: &str) -> BikeCommand {
        BikeCommand::RequestBike(RequestBike {
            bike_id: test_bike_id(),
            renter: renter.to_string(),
            rental_reference: Uuid::now_v7(),
        })
    }

    fn approve(renter: &str) -> BikeCommand {
        BikeCommand::ApproveRequest(ApproveRequest {
            bike_id: test_bike_id(),
            renter: renter.to_string(),
        })
    }

    fn reject(renter: &str) -> BikeCommand {
        BikeCommand::RejectRequest(RejectRequest {
            bike_id: test_bike_id(),
            renter: renter.to_string(),
        })
    }

    fn return_to(location: &str) -> BikeCommand {
        BikeCommand::ReturnBike(ReturnBike {
            bike_id: test_bike_id(),
            location: location.to_string(),
        })
    }

    fn expect_rejected(bike: &Bike, cmd: &BikeCommand, needle: &str) {
        match bike.handle(cmd).unwrap_err() {
            DomainError::Rejected(msg) => assert!(msg.contains(needle), "unexpected message: {msg}"),
            other => panic!("Expected Rejected error, got {other:?}"),
        }
    }

    #[test]
    fn register_makes_bike_available() {
        let bike = registered_bike();
        assert!(bike.exists());
        assert!(bike.is_available());
        assert_eq!(bike.location(), "Paris");
        assert_eq!(bike.version(), 1);
    }

    #[test]
    fn register_rejects_blank_fields_and_duplicates() {
        let bike = Bike::empty(test_bike_id());
        let err = bike
            .handle(&BikeCommand::RegisterBike(RegisterBike {
                bike_id: test_bike_id(),
                bike_type: "city".to_string(),
                location: "  ".to_string(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let bike = registered_bike();
        let err = bike
            .handle(&BikeCommand::RegisterBike(RegisterBike {
                bike_id: test_bike_id(),
                bike_type: "city".to_string(),
                location: "Rome".to_string(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::AlreadyExists(_)));
    }

    #[test]
    fn commands_against_unregistered_bike_are_not_found() {
        let bike = Bike::empty(test_bike_id());
        let err = bike.handle(&request("alice")).unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn request_approve_then_second_request_is_rejected() {
        let mut bike = registered_bike();

        let events = execute(&mut bike, &request("alice")).unwrap();
        match &events[0] {
            BikeEvent::BikeRequested(e) => assert_eq!(e.renter, "alice"),
            _ => panic!("Expected BikeRequested event"),
        }
        assert_eq!(bike.status(), RentalStatus::Requested);

        let events = execute(&mut bike, &approve("alice")).unwrap();
        assert!(matches!(events[0], BikeEvent::BikeInUse(_)));
        assert_eq!(bike.status(), RentalStatus::Rented);
        assert_eq!(bike.renter(), Some("alice"));

        let before = bike.clone();
        expect_rejected(&bike, &request("bob"), "already rented");
        assert_eq!(bike, before);
    }

    #[test]
    fn renter_names_are_matched_after_trimming() {
        let mut bike = registered_bike();

        let events = execute(&mut bike, &request(" alice ")).unwrap();
        match &events[0] {
            BikeEvent::BikeRequested(e) => assert_eq!(e.renter, "alice"),
            _ => panic!("Expected BikeRequested event"),
        }
        assert_eq!(bike.renter(), Some("alice"));

        let events = execute(&mut bike, &approve("alice")).unwrap();
        assert!(matches!(events[0], BikeEvent::BikeInUse(_)));
        assert_eq!(bike.status(), RentalStatus::Rented);
    }

    #[test]
    fn approve_and_reject_require_matching_pending_request() {
        let mut bike = registered_bike();
        expect_rejected(&bike, &approve("alice"), "no pending request");

        execute(&mut bike, &request("alice")).unwrap();
        expect_rejected(&bike, &approve("bob"), "another renter");
        expect_rejected(&bike, &reject("bob"), "another renter");

        execute(&mut bike, &approve("alice")).unwrap();
        expect_rejected(&bike, &approve("alice"), "already confirmed");
        expect_rejected(&bike, &reject("alice"), "already confirmed");
    }

    #[test]
    fn rejecting_a_request_frees_the_bike() {
        let mut bike = registered_bike();
        execute(&mut bike, &request("alice")).unwrap();
        execute(&mut bike, &reject("alice")).unwrap();

        assert!(bike.is_available());
        assert_eq!(bike.renter(), None);
        assert_eq!(bike.rental_reference(), None);
    }

    #[test]
    fn return_moves_bike_and_cannot_happen_twice() {
        let mut bike = registered_bike();
        execute(&mut bike, &request("alice")).unwrap();
        execute(&mut bike, &approve("alice")).unwrap();
        execute(&mut bike, &return_to("Berlin")).unwrap();

        assert!(bike.is_available());
        assert_eq!(bike.location(), "Berlin");
        expect_rejected(&bike, &return_to("Berlin"), "already returned");
    }

    #[test]
    fn events_use_closed_tagged_encoding() {
        let ev = BikeEvent::BikeInUse(BikeInUse {
            bike_id: test_bike_id(),
            renter: "alice".to_string(),
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "BikeInUse");
        assert_eq!(json["data"]["renter"], "alice");

        let unknown = serde_json::json!({ "type": "BikeStolen", "data": { "bike_id": "B1" } });
        assert!(serde_json::from_value::<BikeEvent>(unknown).is_err());
    }

    fn arb_command() -> impl Strategy<Value = BikeCommand> {
        let renter = prop_oneof![Just("alice"), Just("bob")];
        prop_oneof![
            Just(BikeCommand::RegisterBike(RegisterBike {
                bike_id: "B1".parse().unwrap(),
                bike_type: "city".to_string(),
                location: "Paris".to_string(),
            })),
            renter.clone().prop_map(request),
            renter.clone().prop_map(approve),
            renter.prop_map(reject),
            prop_oneof![Just("Rome"), Just("Milan")].prop_map(return_to),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: replaying the emitted history reproduces the state reached by
        /// sequential command execution, and rejected commands leave state untouched.
        #[test]
        fn replay_reproduces_sequential_state(commands in prop::collection::vec(arb_command(), 1..30)) {
            let mut live = Bike::empty(test_bike_id());
            let mut history = Vec::new();

            for cmd in &commands {
                let before = live.clone();
                match execute(&mut live, cmd) {
                    Ok(events) => {
                        for ev in events {
                            let seq = history.len() as u64 + 1;
                            history.push(EventEnvelope::new(
                                Uuid::now_v7(),
                                test_bike_id(),
                                Bike::AGGREGATE_TYPE,
                                seq,
                                Utc::now(),
                                ev,
                            ));
                        }
                    }
                    Err(_) => prop_assert_eq!(&live, &before),
                }
            }

            let mut rebuilt = Bike::empty(test_bike_id());
            replay(&mut rebuilt, &history).unwrap();
            prop_assert_eq!(rebuilt, live);
        }
    }
}
