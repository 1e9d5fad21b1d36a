//! # fleetplane-events
//!
//! Event records attached to the objects the controllers manage.
//!
//! ## Design Principles
//!
//! - Events are observational; nothing reads them to make decisions
//! - Repeats of the same reason and message on one object fold into a
//!   single record with a count
//! - Reasons are stable CamelCase identifiers from [`reasons`]
//!
//! Events are grouped by the object they describe:
//! - Game server lifecycle (`Creating`, `Scheduled`, `Ready`, ...)
//! - Set and fleet scaling (`SuccessfulCreate`, `ScalingGameServerSet`, ...)
//! - Autoscaler decisions (`AutoScalingFleet`, `FleetAutoscaler`)
//! - Allocation bookkeeping (`AllocationLost`)

mod error;
mod event;

pub use error::EventError;
pub use event::*;
