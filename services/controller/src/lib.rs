//! fleetplane controller manager.
//!
//! The crate ships the `controller` binary; the library surface exists so
//! integration tests can drive the controllers against the in-memory store.

pub mod allocation;
pub mod api;
pub mod autoscaler;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod fleets;
pub mod gameservers;
pub mod gameserversets;
pub mod leader;
pub mod manager;
pub mod portalloc;
pub mod runtime;
pub mod sdk;
pub mod state;
pub mod store;
