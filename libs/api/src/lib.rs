//! # fleetplane-api
//!
//! The persisted object model of the fleetplane control plane.
//!
//! ## Kinds
//!
//! - [`GameServer`]: one dedicated server process and its lifecycle state.
//! - [`GameServerSet`]: game servers sharing one template revision.
//! - [`Fleet`]: the user-facing group, rolled across revisions.
//! - [`GameServerAllocation`]: an ephemeral request to claim a ready server.
//! - [`FleetAutoscaler`]: a scaling policy bound to a fleet.
//! - [`AllocationPolicy`]: a peer cluster entry for multi-cluster allocation.
//! - [`Pod`], [`Node`], [`Secret`], [`Lease`]: orchestrator objects the
//!   controllers read or write.
//!
//! Every kind implements [`Resource`]; ownership is expressed with
//! [`OwnerReference`] plus store indexes, never with pointers.

mod allocation;
mod autoscaler;
mod common;
mod fleet;
mod gameserver;
mod gameserverset;
mod meta;
mod orchestrator;
mod policy;
mod selector;

pub use allocation::*;
pub use autoscaler::*;
pub use common::*;
pub use fleet::*;
pub use gameserver::*;
pub use gameserverset::*;
pub use meta::*;
pub use orchestrator::*;
pub use policy::*;
pub use selector::*;

/// Well-known label and annotation keys.
pub mod labels {
    /// Marks pods that back a game server.
    pub const ROLE: &str = "fleetplane.dev/role";

    /// Value of [`ROLE`] on game server pods.
    pub const ROLE_GAME_SERVER: &str = "gameserver";

    /// Name of the game server a pod belongs to.
    pub const GAME_SERVER: &str = "fleetplane.dev/gameserver";

    /// Name of the set a game server belongs to.
    pub const GAME_SERVER_SET: &str = "fleetplane.dev/gameserverset";

    /// Name of the fleet a set or game server belongs to.
    pub const FLEET: &str = "fleetplane.dev/fleet";

    /// Template revision a set runs.
    pub const REVISION: &str = "fleetplane.dev/revision";

    /// Prefix for labels and annotations written by the in-pod SDK agent.
    pub const SDK_PREFIX: &str = "sdk.fleetplane.dev/";
}

/// Environment variables stamped into every game server container.
pub mod env {
    pub const GAME_SERVER_NAME: &str = "FLEETPLANE_GAMESERVER_NAME";
    pub const GAME_SERVER_NAMESPACE: &str = "FLEETPLANE_GAMESERVER_NAMESPACE";
    pub const SDK_SOCKET: &str = "FLEETPLANE_SDK_SOCKET";
}
