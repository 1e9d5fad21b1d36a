//! Fleet autoscaler controller.
//!
//! Each autoscaler is evaluated once per sync period, and again when its
//! fleet changes (at most once per kick interval). An evaluation computes a
//! replica target from the policy and writes it to the fleet spec, unless it
//! is unchanged or the last write is still inside the debounce window.

mod policy;
mod webhook;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fleetplane_api::{
    AutoscalerPolicy, ChainEntry, Fleet, FleetAutoscaler, FleetAutoscalerStatus, ObjectKey, Resource,
};
use fleetplane_events::reasons;
use fleetplane_reconcile::{Action, Reconciler, RetryTracker, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::context::{requeue_at, Context};
use crate::error::{ControllerError, Result};
use crate::store::ResourceStore;

pub use policy::{buffer, capacity, from_webhook, CapacityKind, Decision};
pub use webhook::{WebhookClient, WebhookError};

const KIND: &str = "FleetAutoscaler";

/// Deadline for one webhook review.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of evaluating an autoscaler's policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    /// Chain entry id, or policy kind, that produced the decision.
    pub applied: String,
}

/// Autoscalers that target the fleet at `fleet`.
pub fn autoscalers_for(store: &ResourceStore, fleet: &ObjectKey) -> Vec<ObjectKey> {
    store
        .autoscalers
        .list_namespace(&fleet.namespace)
        .into_iter()
        .filter(|fas| fas.spec.fleet_name == fleet.name)
        .map(|fas| fas.key())
        .collect()
}

/// Spaces out event-driven evaluations of the same autoscaler.
pub struct KickLimiter {
    min_interval: Duration,
    last: Mutex<HashMap<ObjectKey, Instant>>,
}

impl KickLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `key` may be kicked now; records the kick if so. Kicks older
    /// than the interval no longer matter and are dropped.
    pub fn admit(&self, key: &ObjectKey) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        last.retain(|_, at| now.duration_since(*at) < self.min_interval);
        match last.get(key) {
            Some(at) if now.duration_since(*at) < self.min_interval => false,
            _ => {
                last.insert(key.clone(), now);
                true
            }
        }
    }

    /// Drop the record of a deleted autoscaler.
    pub fn forget(&self, key: &ObjectKey) {
        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub struct FleetAutoscalerController {
    ctx: Context,
    webhooks: WebhookClient,
    webhook_failures: Mutex<RetryTracker<ObjectKey>>,
}

impl FleetAutoscalerController {
    pub fn new(ctx: Context) -> Self {
        let recorder = ctx.recorder.for_component("fleetautoscaler-controller");
        Self {
            ctx: Context { recorder, ..ctx },
            webhooks: WebhookClient::new(WEBHOOK_TIMEOUT),
            webhook_failures: Mutex::new(RetryTracker::new(DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW)),
        }
    }

    fn sync_period(&self, fas: &FleetAutoscaler) -> Duration {
        match fas.spec.sync {
            Some(sync) if sync.period_seconds > 0 => {
                Duration::from_secs(u64::from(sync.period_seconds))
            }
            _ => self.ctx.config.autoscaler.sync_period(),
        }
    }

    /// Evaluate a policy that is not a chain.
    async fn decide(
        &self,
        key: &ObjectKey,
        policy: &AutoscalerPolicy,
        fleet: &Fleet,
    ) -> Result<Decision> {
        let invalid = |reason: String| ControllerError::invalid(KIND, key.clone(), reason);
        match policy {
            AutoscalerPolicy::Buffer(p) => Ok(buffer(p, fleet)),
            AutoscalerPolicy::Counter(p) => capacity(CapacityKind::Counter, p, fleet).map_err(invalid),
            AutoscalerPolicy::List(p) => capacity(CapacityKind::List, p, fleet).map_err(invalid),
            AutoscalerPolicy::Webhook(p) => {
                let answer = self.webhooks.review(p, fleet).await?;
                Ok(from_webhook(p, &answer, fleet.spec.replicas))
            }
            AutoscalerPolicy::Chain { .. } => Err(invalid("chains cannot nest".to_string())),
        }
    }

    /// The first chain entry that wants a change wins. Failing entries are
    /// skipped; if every entry fails the last error is returned.
    async fn decide_chain(
        &self,
        key: &ObjectKey,
        entries: &[ChainEntry],
        fleet: &Fleet,
    ) -> Result<Evaluation> {
        let current = fleet.spec.replicas;
        let mut settled = None;
        let mut last_error = None;
        for entry in entries {
            match self.decide(key, &entry.policy, fleet).await {
                Ok(decision) if decision.replicas != current => {
                    return Ok(Evaluation {
                        decision,
                        applied: entry.id.clone(),
                    });
                }
                Ok(decision) => {
                    settled.get_or_insert(Evaluation {
                        decision,
                        applied: entry.id.clone(),
                    });
                }
                Err(e) => {
                    warn!(entry = %entry.id, error = %e, "Chain entry failed, trying the next");
                    last_error = Some(e);
                }
            }
        }
        match (settled, last_error) {
            (Some(evaluation), _) => Ok(evaluation),
            (None, Some(e)) => Err(e),
            (None, None) => Err(ControllerError::invalid(KIND, key.clone(), "empty chain")),
        }
    }

    pub async fn evaluate(&self, fas: &FleetAutoscaler, fleet: &Fleet) -> Result<Evaluation> {
        let key = fas.key();
        match &fas.spec.policy {
            AutoscalerPolicy::Chain { entries } => self.decide_chain(&key, entries, fleet).await,
            policy => Ok(Evaluation {
                decision: self.decide(&key, policy, fleet).await?,
                applied: policy.kind().to_string(),
            }),
        }
    }

    /// Record that the autoscaler cannot act, and why.
    fn unable(&self, fas: &FleetAutoscaler, message: String) -> Result<()> {
        if fas.status.able_to_scale || fas.status.last_applied_policy.is_none() {
            self.ctx
                .recorder
                .warning(fas, reasons::FLEET_AUTOSCALER, message.clone());
        }
        warn!(reason = %message, "Autoscaler cannot scale");
        let status = FleetAutoscalerStatus {
            able_to_scale: false,
            scaling_limited: false,
            ..fas.status.clone()
        };
        self.update_status(fas, status)
    }

    fn scale_fleet(&self, fleet: &Fleet, replicas: u32) -> Result<()> {
        let from = fleet.spec.replicas;
        let updated = self
            .ctx
            .store
            .fleets
            .mutate::<ControllerError, _>(&fleet.key(), |current| {
                if current.spec.replicas == replicas {
                    return Ok(false);
                }
                current.spec.replicas = replicas;
                Ok(true)
            })?;
        if updated.is_some() {
            info!(fleet = %fleet.key(), from, to = replicas, "Scaling fleet");
            self.ctx.recorder.normal(
                fleet,
                reasons::AUTO_SCALING_FLEET,
                format!(
                    "Scaling fleet {} from {from} to {replicas}",
                    fleet.metadata.name
                ),
            );
        }
        Ok(())
    }

    fn update_status(&self, fas: &FleetAutoscaler, status: FleetAutoscalerStatus) -> Result<()> {
        if fas.status == status {
            return Ok(());
        }
        self.ctx
            .store
            .autoscalers
            .mutate::<ControllerError, _>(&fas.key(), |current| {
                if current.status == status {
                    return Ok(false);
                }
                current.status = status.clone();
                Ok(true)
            })?;
        Ok(())
    }

    fn note_webhook_failure(&self, key: &ObjectKey) -> bool {
        let mut tracker = self
            .webhook_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        tracker.record_failure(key);
        tracker.is_exhausted(key)
    }

    fn clear_webhook_failures(&self, key: &ObjectKey) {
        let mut tracker = self
            .webhook_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        tracker.clear(key);
        tracker.prune();
    }
}

#[async_trait]
impl Reconciler for FleetAutoscalerController {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &'static str {
        "fleetautoscaler"
    }

    #[instrument(skip(self), fields(autoscaler = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(fas) = self.ctx.store.autoscalers.get(key) else {
            self.clear_webhook_failures(key);
            return Ok(Action::await_change());
        };
        let period = self.sync_period(&fas);

        if let Err(reason) = fas.spec.policy.validate() {
            self.unable(&fas, format!("Invalid policy: {reason}"))?;
            return Ok(Action::await_change());
        }

        let fleet_key = ObjectKey::new(&key.namespace, &fas.spec.fleet_name);
        let Some(fleet) = self.ctx.store.fleets.get(&fleet_key) else {
            self.unable(&fas, format!("Fleet {} does not exist", fas.spec.fleet_name))?;
            return Ok(Action::requeue(period));
        };

        let evaluation = match self.evaluate(&fas, &fleet).await {
            Ok(evaluation) => {
                self.clear_webhook_failures(key);
                evaluation
            }
            Err(e @ ControllerError::Webhook(_)) => {
                if self.note_webhook_failure(key) {
                    self.unable(&fas, format!("Webhook keeps failing: {e}"))?;
                    return Ok(Action::requeue(period));
                }
                return Err(e);
            }
            Err(e) => {
                self.unable(&fas, e.to_string())?;
                return Ok(Action::requeue(period));
            }
        };

        let now = self.ctx.now();
        let current = fleet.spec.replicas;
        let target = evaluation.decision.replicas;
        let mut last_scale_time = fas.status.last_scale_time;
        let mut next = Action::requeue(period);

        if target != current {
            let debounce = chrono::Duration::seconds(
                i64::try_from(self.ctx.config.autoscaler.debounce_secs).unwrap_or(i64::MAX),
            );
            match fas.status.last_scale_time {
                Some(last) if now < last + debounce => {
                    debug!(current, target, "Inside the debounce window, holding");
                    next = next.min(requeue_at(last + debounce, now));
                }
                _ => {
                    self.scale_fleet(&fleet, target)?;
                    last_scale_time = Some(now);
                }
            }
        } else {
            debug!(replicas = current, policy = %evaluation.applied, "Fleet already at target");
        }

        if evaluation.decision.limited && !fas.status.scaling_limited {
            self.ctx.recorder.warning(
                &fas,
                reasons::FLEET_AUTOSCALER,
                format!("Scaling limited to {target} by the policy bounds"),
            );
        }

        self.update_status(
            &fas,
            FleetAutoscalerStatus {
                current_replicas: fleet.status.replicas,
                desired_replicas: target,
                last_scale_time,
                able_to_scale: true,
                scaling_limited: evaluation.decision.limited,
                last_applied_policy: Some(evaluation.applied),
            },
        )?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use fleetplane_api::{BufferPolicy, IntOrPercent, SyncPolicy, WebhookPolicy};
    use fleetplane_testing::{buffer_autoscaler, fleet};

    fn seeded(ctx: &Context, allocated: u32, ready: u32) -> Fleet {
        let mut f = fleet("f", allocated + ready);
        f.status.allocated_replicas = allocated;
        f.status.ready_replicas = ready;
        f.status.replicas = allocated + ready;
        ctx.store.fleets.create(f).unwrap()
    }

    #[tokio::test]
    async fn test_buffer_scales_fleet_once() {
        let ctx = test_context();
        let f = seeded(&ctx, 4, 3);
        let fas = ctx
            .store
            .autoscalers
            .create(buffer_autoscaler("f", IntOrPercent::Int(5), 0, 20))
            .unwrap();
        let controller = FleetAutoscalerController::new(ctx.clone());

        let action = controller.reconcile(&fas.key()).await.unwrap();
        assert_eq!(action.requeue_after(), Some(Duration::from_secs(30)));
        let scaled = ctx.store.fleets.get(&f.key()).unwrap();
        assert_eq!(scaled.spec.replicas, 9);

        let status = ctx.store.autoscalers.get(&fas.key()).unwrap().status;
        assert!(status.able_to_scale);
        assert_eq!(status.desired_replicas, 9);
        assert_eq!(status.last_applied_policy.as_deref(), Some("Buffer"));

        // Already satisfied: no further writes to the fleet.
        let version = scaled.metadata.resource_version;
        controller.reconcile(&fas.key()).await.unwrap();
        let again = ctx.store.fleets.get(&f.key()).unwrap();
        assert_eq!(again.metadata.resource_version, version);
    }

    #[tokio::test]
    async fn test_missing_fleet_marks_unable() {
        let ctx = test_context();
        let mut fas = buffer_autoscaler("ghost", IntOrPercent::Int(2), 0, 10);
        fas.spec.sync = Some(SyncPolicy { period_seconds: 7 });
        let fas = ctx.store.autoscalers.create(fas).unwrap();
        let controller = FleetAutoscalerController::new(ctx.clone());

        let action = controller.reconcile(&fas.key()).await.unwrap();
        assert_eq!(action.requeue_after(), Some(Duration::from_secs(7)));
        let status = ctx.store.autoscalers.get(&fas.key()).unwrap().status;
        assert!(!status.able_to_scale);
        assert_eq!(ctx.recorder.events_for(&fas).len(), 1);
    }

    #[tokio::test]
    async fn test_chain_skips_failing_entry() {
        let ctx = test_context();
        let f = seeded(&ctx, 2, 0);
        let mut fas = buffer_autoscaler("f", IntOrPercent::Int(1), 0, 10);
        fas.spec.policy = AutoscalerPolicy::Chain {
            entries: vec![
                ChainEntry {
                    id: "broken-hook".into(),
                    policy: AutoscalerPolicy::Webhook(WebhookPolicy {
                        url: "http://127.0.0.1:1/scale".into(),
                        ca_bundle: None,
                        min_replicas: None,
                        max_replicas: None,
                    }),
                },
                ChainEntry {
                    id: "fallback".into(),
                    policy: AutoscalerPolicy::Buffer(BufferPolicy {
                        buffer_size: IntOrPercent::Int(3),
                        min_replicas: 0,
                        max_replicas: 10,
                    }),
                },
            ],
        };
        let fas = ctx.store.autoscalers.create(fas).unwrap();
        let controller = FleetAutoscalerController::new(ctx.clone());

        controller.reconcile(&fas.key()).await.unwrap();
        assert_eq!(ctx.store.fleets.get(&f.key()).unwrap().spec.replicas, 5);
        let status = ctx.store.autoscalers.get(&fas.key()).unwrap().status;
        assert_eq!(status.last_applied_policy.as_deref(), Some("fallback"));
    }

    #[test]
    fn test_kick_limiter() {
        let limiter = KickLimiter::new(Duration::from_secs(60));
        let key = ObjectKey::new("default", "f-autoscaler");
        assert!(limiter.admit(&key));
        assert!(!limiter.admit(&key));
        assert!(limiter.admit(&ObjectKey::new("default", "other")));

        limiter.forget(&key);
        assert_eq!(limiter.tracked(), 1);
        assert!(limiter.admit(&key));
    }

    #[test]
    fn test_kick_limiter_drops_expired_kicks() {
        let limiter = KickLimiter::new(Duration::ZERO);
        for i in 0..10 {
            assert!(limiter.admit(&ObjectKey::new("default", format!("fas-{i}"))));
        }
        assert_eq!(limiter.tracked(), 1);
    }
}
