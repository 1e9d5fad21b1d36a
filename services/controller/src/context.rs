//! Shared handles threaded into every controller.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetplane_reconcile::{Action, Clock};

use crate::config::Config;
use crate::events::EventRecorder;
use crate::portalloc::PortAllocator;
use crate::runtime::{PodRuntime, SimulatedPodRuntime};
use crate::store::ResourceStore;

/// Process-wide singletons, constructed once at start and cloned by value.
#[derive(Clone)]
pub struct Context {
    pub store: ResourceStore,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<Config>,
    pub ports: Arc<PortAllocator>,
    pub runtime: Arc<dyn PodRuntime>,
    pub recorder: EventRecorder,
}

impl Context {
    /// A context backed by the in-process pod runtime. The runtime handle is
    /// returned too so callers can steer scheduling.
    pub fn simulated(config: Config, clock: Arc<dyn Clock>) -> (Self, Arc<SimulatedPodRuntime>) {
        let store = ResourceStore::new(clock.clone());
        let runtime = Arc::new(SimulatedPodRuntime::new(store.clone(), clock.clone()));
        let ctx = Self {
            recorder: EventRecorder::new(store.events.clone(), clock.clone()),
            ports: Arc::new(PortAllocator::new(config.port_range)),
            config: Arc::new(config),
            runtime: runtime.clone(),
            clock,
            store,
        };
        (ctx, runtime)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> Context {
    let clock = Arc::new(fleetplane_reconcile::ManualClock::default());
    Context::simulated(Config::default(), clock).0
}

/// Requeue at a wall-clock deadline. A deadline already past requeues
/// immediately.
pub fn requeue_at(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Action {
    let wait = (deadline - now).to_std().unwrap_or(Duration::ZERO);
    Action::requeue(wait)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_at_clamps_past_deadlines() {
        let now = Utc::now();
        assert_eq!(
            requeue_at(now + chrono::Duration::seconds(3), now).requeue_after(),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            requeue_at(now - chrono::Duration::seconds(3), now).requeue_after(),
            Some(Duration::ZERO)
        );
    }
}
