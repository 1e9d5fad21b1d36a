//! Game server controller.
//!
//! Drives one game server through its lifecycle:
//!
//! ```text
//! PortAllocation -> Creating -> Starting -> Scheduled -> RequestReady -> Ready
//!                                                                        |
//!                                             Reserved <-----------------+
//!                                             Allocated <----------------+
//! any running state -> Unhealthy -> Shutdown -> (object removed)
//! Creating -> Error -> PortAllocation (retry) | Unhealthy (gave up)
//! ```
//!
//! Decisions come from [`plan`]; this module carries them out. Every status
//! write is compare-and-swap against the version the decision was made on,
//! so a concurrent write (an allocation, an SDK call) makes the step fail
//! with a conflict and the key is reconciled again from fresh state.

mod plan;
mod pod;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetplane_api::{GameServer, GameServerState, ObjectKey, Resource, StatusPort};
use fleetplane_events::reasons;
use fleetplane_reconcile::{Action, Reconciler};
use tracing::{debug, info, instrument, warn};

use crate::context::{requeue_at, Context};
use crate::error::{ControllerError, Result};
use crate::portalloc::allocator_ports;

pub use plan::{
    plan, Step, HEALTH_CHECK_FAILED, INVALID_TEMPLATE, POD_CREATE_EXHAUSTED, POD_EXITED,
    POD_MISSING,
};
pub use pod::build_pod;

pub struct GameServerController {
    ctx: Context,
}

impl GameServerController {
    pub fn new(ctx: Context) -> Self {
        let recorder = ctx.recorder.for_component("gameserver-controller");
        Self {
            ctx: Context { recorder, ..ctx },
        }
    }

    fn write(&self, gs: GameServer) -> Result<GameServer> {
        Ok(self.ctx.store.game_servers.update(gs)?)
    }

    /// Move to `to`, recording a condition when given one.
    fn transition(
        &self,
        mut gs: GameServer,
        to: GameServerState,
        condition: Option<(&str, String)>,
        now: DateTime<Utc>,
    ) -> Result<GameServer> {
        let from = gs.state();
        gs.status.state = to;
        if let Some((reason, message)) = condition {
            gs.set_condition(reason, message, now);
        }
        let gs = self.write(gs)?;
        info!(game_server = %gs.key(), %from, %to, "State changed");
        Ok(gs)
    }

    /// Reserve dynamic ports and write them with the move to `Creating`.
    fn reserve_ports(&self, mut gs: GameServer, now: DateTime<Utc>) -> Result<Action> {
        let uid = gs.metadata.uid.clone();
        let count = gs.spec.dynamic_port_count();
        for lost in self.ctx.ports.sync_nodes(&self.ctx.store) {
            debug!(uid = %lost, "Dropped ports held on a removed node");
        }
        let mut dynamic = match self.ctx.ports.reserve(&uid, count) {
            Ok(ports) => ports.into_iter(),
            Err(e) => {
                let err = ControllerError::from(e);
                warn!(game_server = %gs.key(), error = %err, "Port reservation failed");
                let recorded = gs
                    .status
                    .condition
                    .as_ref()
                    .is_some_and(|c| c.reason == err.reason());
                if !recorded {
                    gs.set_condition(err.reason(), err.to_string(), now);
                    self.write(gs)?;
                }
                return Ok(Action::requeue(self.ctx.config.resync_interval()));
            }
        };

        gs.status.ports = gs
            .spec
            .ports
            .iter()
            .filter_map(|p| {
                let port = if p.port_policy.uses_allocator() {
                    dynamic.next()?
                } else {
                    p.host_port?
                };
                Some(StatusPort {
                    name: p.name.clone(),
                    port,
                })
            })
            .collect();
        gs.status.condition = None;

        match self.transition(gs, GameServerState::Creating, None, now) {
            Ok(gs) => {
                self.ctx
                    .recorder
                    .normal(&gs, reasons::CREATING, "Ports reserved, creating pod");
                Ok(Action::await_change())
            }
            Err(e) => {
                // The write lost; keep the table in step with the store.
                self.ctx.ports.release(&uid);
                Err(e)
            }
        }
    }

    async fn create_pod(&self, mut gs: GameServer, now: DateTime<Utc>) -> Result<Action> {
        let pod = build_pod(&gs, &self.ctx.config.sdk.socket_path);
        match self.ctx.runtime.create_pod(pod).await {
            Ok(_) => {
                let gs = self.transition(gs, GameServerState::Starting, None, now)?;
                debug!(game_server = %gs.key(), "Pod created");
                Ok(Action::await_change())
            }
            Err(e) => {
                let err = ControllerError::from(e);
                gs.status.pod_failures += 1;
                let delay = self
                    .ctx
                    .config
                    .pod_create_backoff()
                    .delay(gs.status.pod_failures - 1);
                let retry_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                gs.status.retry_at = Some(retry_at);
                warn!(
                    game_server = %gs.key(),
                    error = %err,
                    failures = gs.status.pod_failures,
                    "Pod creation failed"
                );
                let message = err.to_string();
                let gs = self.transition(
                    gs,
                    GameServerState::Error,
                    Some((err.reason(), message.clone())),
                    now,
                )?;
                self.ctx.recorder.warning(&gs, reasons::ERROR, message);
                Ok(requeue_at(retry_at, now))
            }
        }
    }

    async fn apply(&self, gs: GameServer, step: Step, now: DateTime<Utc>) -> Result<Action> {
        use GameServerState as S;

        let key = gs.key();
        match step {
            Step::Idle { until } => Ok(until.map_or_else(Action::await_change, |at| requeue_at(at, now))),

            Step::Invalid(reason) => {
                warn!(game_server = %key, %reason, "Template invalid");
                let mut gs = gs;
                gs.set_condition(INVALID_TEMPLATE, reason.clone(), now);
                let gs = self.write(gs)?;
                self.ctx.recorder.warning(&gs, reasons::ERROR, reason);
                Ok(Action::await_change())
            }

            Step::ReservePorts => self.reserve_ports(gs, now),

            Step::CreatePod => self.create_pod(gs, now).await,

            Step::Starting => {
                self.transition(gs, S::Starting, None, now)?;
                Ok(Action::await_change())
            }

            Step::Scheduled { node, address } => {
                let mut gs = gs;
                match self
                    .ctx
                    .ports
                    .bind(&gs.metadata.uid, &node, &allocator_ports(&gs))
                {
                    Ok(dropped) => {
                        for uid in dropped {
                            warn!(game_server = %key, %uid, "Parked port reservation dropped");
                        }
                    }
                    Err(e) => {
                        warn!(game_server = %key, %node, error = %e, "Ports not tracked on node");
                    }
                }
                gs.status.node_name = node.clone();
                gs.status.address = address;
                gs.status.health.scheduled_at = Some(now);
                gs.status.pod_failures = 0;
                gs.status.retry_at = None;
                if gs.state() == S::Starting {
                    gs.status.state = S::Scheduled;
                }
                let gs = self.write(gs)?;
                self.ctx
                    .recorder
                    .normal(&gs, reasons::SCHEDULED, format!("Address and ports populated on {node}"));
                Ok(Action::await_change())
            }

            Step::Ready => {
                let mut gs = gs;
                gs.status.condition = None;
                let gs = self.transition(gs, S::Ready, None, now)?;
                self.ctx.recorder.normal(&gs, reasons::READY, "Game server is ready");
                Ok(gs
                    .health_deadline()
                    .map_or_else(Action::await_change, |at| requeue_at(at, now)))
            }

            Step::ReservationExpired => {
                let mut gs = gs;
                gs.status.reserved_until = None;
                let gs = self.transition(gs, S::Ready, None, now)?;
                self.ctx
                    .recorder
                    .normal(&gs, reasons::READY, "Reservation expired");
                Ok(Action::await_change())
            }

            Step::HealthFailed => {
                let message = "Missed health pings past the failure threshold".to_string();
                let gs = self.transition(
                    gs,
                    S::Unhealthy,
                    Some((HEALTH_CHECK_FAILED, message.clone())),
                    now,
                )?;
                self.ctx.recorder.warning(&gs, reasons::UNHEALTHY, message);
                Ok(Action::await_change())
            }

            Step::PodLost => {
                let was_allocated = gs.state() == S::Allocated;
                let message = "Pod is missing".to_string();
                let gs = self.transition(gs, S::Unhealthy, Some((POD_MISSING, message.clone())), now)?;
                if was_allocated {
                    warn!(game_server = %key, "Allocated game server lost its pod");
                    self.ctx.recorder.warning(
                        &gs,
                        reasons::ALLOCATION_LOST,
                        "Pod disappeared while allocated",
                    );
                }
                self.ctx.recorder.warning(&gs, reasons::UNHEALTHY, message);
                Ok(Action::await_change())
            }

            Step::PodExited => {
                let message = "Pod exited".to_string();
                let gs = self.transition(gs, S::Unhealthy, Some((POD_EXITED, message.clone())), now)?;
                self.ctx.recorder.warning(&gs, reasons::UNHEALTHY, message);
                Ok(Action::await_change())
            }

            Step::Shutdown => {
                let gs = self.transition(gs, S::Shutdown, None, now)?;
                self.ctx
                    .recorder
                    .normal(&gs, reasons::SHUTDOWN, "Deleting unhealthy game server");
                Ok(Action::await_change())
            }

            Step::DeletePod => {
                self.ctx.runtime.delete_pod(&key).await?;
                Ok(Action::await_change())
            }

            Step::Finalize => {
                let freed = self.ctx.ports.release(&gs.metadata.uid);
                match self
                    .ctx
                    .store
                    .game_servers
                    .delete(&key, Some(gs.metadata.resource_version))
                {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
                info!(game_server = %key, ports_freed = freed.len(), "Game server removed");
                Ok(Action::await_change())
            }

            Step::RetryCreate => {
                self.ctx.runtime.delete_pod(&key).await?;
                let mut gs = gs;
                gs.status.retry_at = None;
                // The next pod may land elsewhere.
                gs.status.node_name.clear();
                gs.status.address.clear();
                gs.status.health.scheduled_at = None;
                self.transition(gs, S::PortAllocation, None, now)?;
                Ok(Action::await_change())
            }

            Step::GiveUp => {
                let message = format!(
                    "Pod creation failed {} times",
                    gs.status.pod_failures
                );
                self.ctx.ports.release(&gs.metadata.uid);
                let mut gs = gs;
                gs.status.ports.clear();
                let gs = self.transition(
                    gs,
                    S::Unhealthy,
                    Some((POD_CREATE_EXHAUSTED, message.clone())),
                    now,
                )?;
                self.ctx.recorder.warning(&gs, reasons::UNHEALTHY, message);
                Ok(Action::await_change())
            }
        }
    }
}

#[async_trait]
impl Reconciler for GameServerController {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &'static str {
        "gameserver"
    }

    #[instrument(skip(self), fields(game_server = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(gs) = self.ctx.store.game_servers.get(key) else {
            return Ok(Action::await_change());
        };
        let pod = self.ctx.store.pods.get(key);
        let now = self.ctx.now();
        let step = plan(&gs, pod.as_ref(), now, self.ctx.config.pod_create_retry_cap);
        debug!(state = %gs.state(), ?step, "Planned");
        self.apply(gs, step, now).await
    }
}
