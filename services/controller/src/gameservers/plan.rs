//! Pure transition rules of the game server state machine.
//!
//! [`plan`] looks at the stored game server, its pod (if any) and the time,
//! and names the one step the controller should take next. It never
//! performs I/O; the controller carries the step out and writes status.

use chrono::{DateTime, Utc};
use fleetplane_api::{GameServer, GameServerState, Pod, PodPhase, UnhealthyAction};

/// Condition reason recorded for templates that cannot be realised.
pub const INVALID_TEMPLATE: &str = "InvalidTemplate";

/// Condition reason recorded when the pod disappears underneath a server.
pub const POD_MISSING: &str = "PodMissing";

/// Condition reason recorded when the pod exits.
pub const POD_EXITED: &str = "PodExited";

/// Condition reason recorded when heartbeats stop.
pub const HEALTH_CHECK_FAILED: &str = "HealthCheckFailed";

/// Condition reason recorded when pod creation keeps failing.
pub const POD_CREATE_EXHAUSTED: &str = "PodCreateRetriesExhausted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing to do until `until`, or until the next change if `None`.
    Idle { until: Option<DateTime<Utc>> },

    /// The spec fails validation; record it and stop.
    Invalid(String),

    /// Reserve host ports and move to `Creating`.
    ReservePorts,

    /// Create the pod and move to `Starting`.
    CreatePod,

    /// The pod exists but is not bound yet.
    Starting,

    /// The pod is bound; record node and address.
    Scheduled { node: String, address: String },

    /// Confirm the agent's ready request.
    Ready,

    /// The reservation deadline passed.
    ReservationExpired,

    /// Heartbeats stopped.
    HealthFailed,

    /// The pod vanished while one was expected.
    PodLost,

    /// The pod ran to completion or crashed.
    PodExited,

    /// Unhealthy with the default action: begin shutdown.
    Shutdown,

    /// Shutting down and the pod still exists.
    DeletePod,

    /// Pod gone: release ports and remove the object.
    Finalize,

    /// Creation failed earlier and the backoff elapsed.
    RetryCreate,

    /// Creation failed too many times.
    GiveUp,
}

fn pod_is_bound(pod: &Pod) -> Option<(String, String)> {
    let node = pod.status.node_name.clone()?;
    Some((node, pod.status.host_ip.clone().unwrap_or_default()))
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Decide the next step for `gs`.
///
/// `retry_cap` bounds consecutive failed pod creations before the server is
/// given up on.
pub fn plan(gs: &GameServer, pod: Option<&Pod>, now: DateTime<Utc>, retry_cap: u32) -> Step {
    use GameServerState as S;

    let state = gs.state();
    let invalid_recorded = gs
        .status
        .condition
        .as_ref()
        .is_some_and(|c| c.reason == INVALID_TEMPLATE);

    match state {
        S::PortAllocation | S::Creating => {
            if let Err(reason) = gs.spec.validate() {
                return if invalid_recorded {
                    Step::Idle { until: None }
                } else {
                    Step::Invalid(reason)
                };
            }
        }
        S::Terminal => return Step::Finalize,
        S::Shutdown => {
            return if pod.is_some() {
                Step::DeletePod
            } else {
                Step::Finalize
            };
        }
        S::Unhealthy => {
            return match gs.spec.health.on_failure {
                UnhealthyAction::Shutdown => Step::Shutdown,
                UnhealthyAction::Retain => Step::Idle { until: None },
            };
        }
        S::Error => {
            if gs.status.pod_failures >= retry_cap {
                return Step::GiveUp;
            }
            return match gs.status.retry_at {
                Some(at) if at > now => Step::Idle { until: Some(at) },
                _ => Step::RetryCreate,
            };
        }
        _ => {}
    }

    match state {
        S::PortAllocation => return Step::ReservePorts,
        S::Creating => {
            return match pod {
                None => Step::CreatePod,
                Some(_) => Step::Starting,
            };
        }
        _ => {}
    }

    // From here on a pod is expected.
    let Some(pod) = pod else {
        return Step::PodLost;
    };
    if matches!(pod.status.phase, PodPhase::Failed | PodPhase::Succeeded) {
        return Step::PodExited;
    }
    if gs.status.node_name.is_empty() {
        if let Some((node, address)) = pod_is_bound(pod) {
            return Step::Scheduled { node, address };
        }
        return Step::Idle { until: None };
    }

    let health_deadline = gs.health_deadline();
    if health_deadline.is_some_and(|deadline| deadline <= now) {
        return Step::HealthFailed;
    }

    match state {
        S::RequestReady => Step::Ready,
        S::Reserved => match gs.status.reserved_until {
            Some(until) if until <= now => Step::ReservationExpired,
            until => Step::Idle {
                until: earliest(until, health_deadline),
            },
        },
        _ => Step::Idle {
            until: health_deadline,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fleetplane_api::{Health, ObjectMeta, PodSpec, PodStatus};
    use fleetplane_testing::GameServerBuilder;
    use rstest::rstest;

    fn pod(node: Option<&str>, phase: PodPhase) -> Pod {
        Pod {
            metadata: ObjectMeta::named("default", "gs"),
            spec: PodSpec::default(),
            status: PodStatus {
                phase,
                node_name: node.map(str::to_string),
                host_ip: node.map(|_| "10.0.0.9".to_string()),
                start_time: None,
            },
        }
    }

    fn running() -> Pod {
        pod(Some("node-a"), PodPhase::Running)
    }

    fn checked() -> Health {
        Health {
            disabled: false,
            initial_delay_seconds: 5,
            period_seconds: 5,
            failure_threshold: 3,
            ..Default::default()
        }
    }

    #[rstest]
    #[case(GameServerState::PortAllocation, None, Step::ReservePorts)]
    #[case(GameServerState::Creating, None, Step::CreatePod)]
    #[case(GameServerState::Creating, Some(pod(None, PodPhase::Pending)), Step::Starting)]
    #[case(GameServerState::Shutdown, Some(pod(None, PodPhase::Pending)), Step::DeletePod)]
    #[case(GameServerState::Shutdown, None, Step::Finalize)]
    #[case(GameServerState::Terminal, None, Step::Finalize)]
    #[case(GameServerState::Ready, None, Step::PodLost)]
    #[case(GameServerState::Allocated, Some(pod(Some("n"), PodPhase::Failed)), Step::PodExited)]
    #[case(GameServerState::Unhealthy, None, Step::Shutdown)]
    fn test_basic_transitions(
        #[case] state: GameServerState,
        #[case] pod: Option<Pod>,
        #[case] expected: Step,
    ) {
        let gs = GameServerBuilder::new("gs").state(state).node("node-a").build();
        assert_eq!(plan(&gs, pod.as_ref(), Utc::now(), 5), expected);
    }

    #[test]
    fn test_bound_pod_is_captured_once() {
        let gs = GameServerBuilder::new("gs")
            .state(GameServerState::Starting)
            .build();
        assert_eq!(
            plan(&gs, Some(&running()), Utc::now(), 5),
            Step::Scheduled {
                node: "node-a".into(),
                address: "10.0.0.9".into()
            }
        );
        assert_eq!(
            plan(&gs, Some(&pod(None, PodPhase::Pending)), Utc::now(), 5),
            Step::Idle { until: None }
        );
    }

    #[test]
    fn test_request_ready_confirms() {
        let gs = GameServerBuilder::new("gs")
            .state(GameServerState::RequestReady)
            .node("node-a")
            .build();
        assert_eq!(plan(&gs, Some(&running()), Utc::now(), 5), Step::Ready);
    }

    #[test]
    fn test_reservation_expiry_and_deadline() {
        let now = Utc::now();
        let until = now + Duration::seconds(5);
        let gs = GameServerBuilder::new("gs")
            .node("node-a")
            .reserved_until(until)
            .build();
        assert_eq!(
            plan(&gs, Some(&running()), now, 5),
            Step::Idle { until: Some(until) }
        );
        assert_eq!(
            plan(&gs, Some(&running()), until, 5),
            Step::ReservationExpired
        );

        let forever = GameServerBuilder::new("gs")
            .node("node-a")
            .state(GameServerState::Reserved)
            .build();
        assert_eq!(
            plan(&forever, Some(&running()), now, 5),
            Step::Idle { until: None }
        );
    }

    #[test]
    fn test_missed_heartbeats() {
        let t0 = Utc::now();
        let mut gs = GameServerBuilder::new("gs")
            .node("node-a")
            .state(GameServerState::Ready)
            .health(checked())
            .build();
        gs.status.health.scheduled_at = Some(t0);
        let deadline = t0 + Duration::seconds(20);

        assert_eq!(
            plan(&gs, Some(&running()), t0, 5),
            Step::Idle {
                until: Some(deadline)
            }
        );
        assert_eq!(plan(&gs, Some(&running()), deadline, 5), Step::HealthFailed);

        gs.status.health.last_ping = Some(t0 + Duration::seconds(18));
        assert!(matches!(
            plan(&gs, Some(&running()), deadline, 5),
            Step::Idle { .. }
        ));
    }

    #[test]
    fn test_error_backoff_and_cap() {
        let now = Utc::now();
        let mut gs = GameServerBuilder::new("gs")
            .state(GameServerState::Error)
            .build();
        gs.status.pod_failures = 2;
        gs.status.retry_at = Some(now + Duration::seconds(2));
        assert_eq!(
            plan(&gs, None, now, 5),
            Step::Idle {
                until: gs.status.retry_at
            }
        );
        assert_eq!(plan(&gs, None, now + Duration::seconds(2), 5), Step::RetryCreate);

        gs.status.pod_failures = 5;
        assert_eq!(plan(&gs, None, now, 5), Step::GiveUp);
    }

    #[test]
    fn test_invalid_template_recorded_once() {
        let now = Utc::now();
        let mut gs = GameServerBuilder::new("gs").build();
        gs.spec.container.image.clear();
        assert!(matches!(plan(&gs, None, now, 5), Step::Invalid(_)));

        gs.set_condition(INVALID_TEMPLATE, "container image is required", now);
        assert_eq!(plan(&gs, None, now, 5), Step::Idle { until: None });
    }

    #[test]
    fn test_retain_keeps_unhealthy() {
        let gs = GameServerBuilder::new("gs")
            .state(GameServerState::Unhealthy)
            .health(Health {
                on_failure: UnhealthyAction::Retain,
                ..checked()
            })
            .build();
        assert_eq!(plan(&gs, None, Utc::now(), 5), Step::Idle { until: None });
    }
}
