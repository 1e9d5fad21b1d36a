//! # fleetplane-id
//!
//! Identifiers for objects managed by the fleetplane control plane.
//!
//! Every stored object has two identities:
//!
//! - a user-visible `name`, unique within a namespace and kind, and
//! - a system-assigned `uid`, unique across time, in the format
//!   `{prefix}_{ulid}` (for example `gs_01HV4Z4NYPLTRS0JTUA8XDME5F`).
//!
//! The prefix encodes the object kind so a uid copied into an owner
//! reference can never be confused with a uid of another kind. Uids sort by
//! creation time, which the port allocator relies on when it has to decide
//! which of two colliding game servers is older.
//!
//! [`ResourceVersion`] is the optimistic-concurrency token carried by every
//! stored object.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
