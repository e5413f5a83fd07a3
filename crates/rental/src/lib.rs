//! Bike rental domain module (event-sourced).
//!
//! Business rules for renting bikes, implemented purely as deterministic
//! domain logic (no IO, no HTTP, no storage).

pub mod bike;

pub use bike::{
    ApproveRequest, Bike, BikeCommand, BikeEvent, BikeInUse, BikeRegistered, BikeRequested,
    BikeReturned, RegisterBike, RejectRequest, RentalStatus, RequestBike, RequestRejected,
    ReturnBike,
};
