//! Reconciliation loop primitives.
//!
//! Controllers in fleetplane are level-triggered: a change to any object
//! enqueues the key of the object that owns the decision, and a reconciler
//! recomputes the whole desired state for that key from the store. This
//! crate holds the pieces every controller shares:
//!
//! - [`WorkQueue`]: keyed queue with per-key single flight and rate-limited
//!   requeue.
//! - [`Reconciler`] and [`run_workers`]: the worker loop with bounded drain.
//! - [`BackoffPolicy`] and [`RetryTracker`]: exponential backoff with jitter.
//! - [`SpecHash`]: template revision digest over canonical JSON.
//! - [`RollingStrategy`]: surge and unavailability math for rollouts.
//! - [`select_for_drain`]: deterministic ordering of surplus instances.
//! - [`Clock`]: injectable wall clock so deadlines can be tested.
//!
//! # Invariants
//!
//! - A key is never reconciled by two workers at once.
//! - Decisions are deterministic given the same inputs.
//! - Timers live in object status as deadlines, never only in memory.

mod backoff;
mod clock;
mod controller;
mod drain;
mod hash;
mod queue;
mod rollout;

use std::time::Duration;

pub use backoff::{BackoffPolicy, RetryTracker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{run_workers, Action, ReconcileFailure, Reconciler};
pub use drain::{select_for_drain, DrainKey, DrainPriority, NodePreference};
pub use hash::SpecHash;
pub use queue::{QueueKey, WorkQueue};
pub use rollout::{RolloutPlan, RollingStrategy, SetSnapshot};

/// Default retry limit within [`DEFAULT_RETRY_WINDOW`].
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60);
