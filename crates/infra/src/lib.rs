//! Infrastructure layer: event store, command dispatch, projections and the
//! query side.

pub mod command_dispatcher;
pub mod event_store;
pub mod gateway;
pub mod projections;
pub mod query_bus;
pub mod read_model;
pub mod repository;
pub mod workers;

#[cfg(test)]
mod integration_tests;
