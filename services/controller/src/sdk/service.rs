//! Applies agent requests to game server objects.

use chrono::{DateTime, Duration, Utc};
use fleetplane_api::{
    append_list_value, decrement_counter, delete_list_value, increment_counter, labels,
    set_counter_capacity, set_counter_count, set_list_capacity, GameServer, GameServerState,
    MutationError, ObjectKey,
};
use fleetplane_events::reasons;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::protocol::{CounterAction, ListAction, Op, Reply};
use crate::context::Context;
use crate::store::{StoreError, WatchEvent};

/// Minimum spacing of heartbeat writes to one game server.
const PING_WRITE_INTERVAL: Duration = Duration::seconds(1);

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("game server {0} not found")]
    NotFound(ObjectKey),

    #[error("cannot {op} from state {state}")]
    InvalidTransition { op: &'static str, state: GameServerState },

    #[error("connection has not said hello")]
    NotConnected,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SdkError {
    /// Stable code sent to the agent.
    pub fn code(&self) -> &'static str {
        match self {
            SdkError::NotFound(_) => "not_found",
            SdkError::InvalidTransition { .. } => "invalid_transition",
            SdkError::NotConnected => "not_connected",
            SdkError::Invalid(_) => "invalid_request",
            SdkError::Mutation(MutationError::CounterOverflow { .. }) => "counter_overflow",
            SdkError::Mutation(MutationError::CounterUnderflow { .. }) => "counter_underflow",
            SdkError::Mutation(MutationError::ListFull { .. }) => "list_full",
            SdkError::Mutation(_) => "mutation_rejected",
            SdkError::Store(StoreError::Conflict { .. }) => "conflict",
            SdkError::Store(_) => "store_error",
        }
    }
}

/// What a request does to the stored object.
enum Outcome {
    /// Write the modified object.
    Write,
    /// Leave it alone.
    Keep,
}

/// Serves requests from agents, one game server per connection.
#[derive(Clone)]
pub struct SdkService {
    ctx: Context,
}

impl SdkService {
    pub fn new(ctx: Context) -> Self {
        let recorder = ctx.recorder.for_component("sdk");
        Self {
            ctx: Context { recorder, ..ctx },
        }
    }

    /// Apply one request on behalf of the agent of `key`.
    pub fn handle(&self, key: &ObjectKey, op: &Op) -> Result<Reply, SdkError> {
        if let Op::GetGameServer | Op::Watch | Op::Hello { .. } = op {
            let gs = self
                .ctx
                .store
                .game_servers
                .get(key)
                .ok_or_else(|| SdkError::NotFound(key.clone()))?;
            return Ok(match op {
                Op::GetGameServer | Op::Watch => Reply::GameServer {
                    game_server: Box::new(gs),
                },
                _ => Reply::Ack { state: gs.state() },
            });
        }

        let now = self.ctx.now();
        let before = self.ctx.store.game_servers.get(key).map(|gs| gs.state());
        let stored = self
            .ctx
            .store
            .game_servers
            .mutate::<SdkError, _>(key, |gs| match apply(gs, op, now)? {
                Outcome::Write => Ok(true),
                Outcome::Keep => Ok(false),
            })?
            .ok_or_else(|| SdkError::NotFound(key.clone()))?;

        if before != Some(stored.state()) {
            info!(game_server = %key, op = op.name(), state = %stored.state(), "Agent changed state");
            self.announce(&stored);
        } else {
            debug!(game_server = %key, op = op.name(), "Agent request applied");
        }
        Ok(Reply::Ack {
            state: stored.state(),
        })
    }

    /// Changes to every game server, from now on.
    pub fn changes(&self) -> broadcast::Receiver<WatchEvent<GameServer>> {
        self.ctx.store.game_servers.watch()
    }

    fn announce(&self, gs: &GameServer) {
        let recorder = &self.ctx.recorder;
        match gs.state() {
            GameServerState::RequestReady => {
                recorder.normal(gs, reasons::REQUEST_READY, "SDK ready request received")
            }
            GameServerState::Reserved => match gs.status.reserved_until {
                Some(until) => recorder.normal(gs, reasons::RESERVED, format!("Reserved until {until}")),
                None => recorder.normal(gs, reasons::RESERVED, "Reserved"),
            },
            GameServerState::Allocated => {
                recorder.normal(gs, reasons::ALLOCATED, "Allocated by the SDK")
            }
            GameServerState::Shutdown => {
                recorder.normal(gs, reasons::SHUTDOWN, "SDK shutdown request received")
            }
            _ => {}
        }
    }
}

/// Apply `op` to `gs` in place.
fn apply(gs: &mut GameServer, op: &Op, now: DateTime<Utc>) -> Result<Outcome, SdkError> {
    use GameServerState as S;

    let state = gs.state();
    match op {
        Op::Hello { .. } | Op::GetGameServer | Op::Watch => Ok(Outcome::Keep),

        Op::Ready => match state {
            S::Ready | S::RequestReady => Ok(Outcome::Keep),
            S::Creating | S::Starting | S::Scheduled | S::Reserved => {
                gs.status.state = S::RequestReady;
                gs.status.reserved_until = None;
                Ok(Outcome::Write)
            }
            _ => Err(SdkError::InvalidTransition { op: "ready", state }),
        },

        Op::Shutdown => {
            if state.is_terminating() {
                return Ok(Outcome::Keep);
            }
            gs.status.state = S::Shutdown;
            Ok(Outcome::Write)
        }

        Op::Reserve { seconds } => match state {
            S::Scheduled | S::RequestReady | S::Ready | S::Reserved => {
                gs.status.state = S::Reserved;
                gs.status.reserved_until = match *seconds {
                    0 => None,
                    s => {
                        let s = i64::try_from(s)
                            .map_err(|_| SdkError::Invalid(format!("reserve for {s}s")))?;
                        Some(now + Duration::seconds(s))
                    }
                };
                Ok(Outcome::Write)
            }
            _ => Err(SdkError::InvalidTransition { op: "reserve", state }),
        },

        Op::Allocate => match state {
            S::Allocated => Ok(Outcome::Keep),
            // Only a server that has reported ready can take players.
            S::Ready | S::Reserved => {
                gs.status.state = S::Allocated;
                gs.status.reserved_until = None;
                Ok(Outcome::Write)
            }
            _ => Err(SdkError::InvalidTransition { op: "allocate", state }),
        },

        Op::Health => {
            if state.is_terminating() {
                return Ok(Outcome::Keep);
            }
            let recent = gs
                .status
                .health
                .last_ping
                .is_some_and(|last| now - last < PING_WRITE_INTERVAL);
            if recent {
                return Ok(Outcome::Keep);
            }
            gs.status.health.last_ping = Some(now);
            Ok(Outcome::Write)
        }

        Op::SetLabel { key, value } => {
            let key = sdk_key(key)?;
            if gs.metadata.labels.get(&key) == Some(value) {
                return Ok(Outcome::Keep);
            }
            gs.metadata.labels.insert(key, value.clone());
            Ok(Outcome::Write)
        }

        Op::SetAnnotation { key, value } => {
            let key = sdk_key(key)?;
            if gs.metadata.annotations.get(&key) == Some(value) {
                return Ok(Outcome::Keep);
            }
            gs.metadata.annotations.insert(key, value.clone());
            Ok(Outcome::Write)
        }

        Op::Counter { name, action } => {
            let counters = &mut gs.status.counters;
            match *action {
                CounterAction::Increment { amount } => increment_counter(counters, name, amount)?,
                CounterAction::Decrement { amount } => decrement_counter(counters, name, amount)?,
                CounterAction::SetCount { count } => set_counter_count(counters, name, count)?,
                CounterAction::SetCapacity { capacity } => {
                    set_counter_capacity(counters, name, capacity)?
                }
            }
            Ok(Outcome::Write)
        }

        Op::List { name, action } => {
            let lists = &mut gs.status.lists;
            match action {
                ListAction::Add { value } => append_list_value(lists, name, value, true)?,
                ListAction::Remove { value } => delete_list_value(lists, name, value)?,
                ListAction::SetCapacity { capacity } => set_list_capacity(lists, name, *capacity)?,
            }
            Ok(Outcome::Write)
        }
    }
}

fn sdk_key(key: &str) -> Result<String, SdkError> {
    let valid = !key.is_empty()
        && key.len() <= 63
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(SdkError::Invalid(format!("invalid key '{key}'")));
    }
    Ok(format!("{}{key}", labels::SDK_PREFIX))
}
