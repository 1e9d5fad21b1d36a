//! Wire messages between the in-pod agent and the controller.
//!
//! One JSON object per line in each direction. The agent opens with a
//! `hello` naming its game server; every later request carries an `id` that
//! the matching response echoes.
//!
//! ```text
//! -> {"id":1,"type":"hello","namespace":"default","name":"f-abc-x1"}
//! <- {"id":1,"type":"ack","state":"Scheduled"}
//! -> {"id":2,"type":"ready"}
//! <- {"id":2,"type":"ack","state":"RequestReady"}
//! -> {"id":3,"type":"counter","name":"rooms","action":"increment","amount":1}
//! <- {"id":3,"type":"error","code":"counter_overflow","message":"..."}
//! -> {"id":4,"type":"watch"}
//! <- {"id":4,"type":"game_server","game_server":{...}}
//! <- {"id":4,"type":"game_server","game_server":{...}}
//! ```
//!
//! After `watch`, every later change to the game server is pushed with the
//! watch request's `id`, interleaved with replies to other requests.

use fleetplane_api::{GameServer, GameServerState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Bind the connection to a game server. Must come first.
    Hello { namespace: String, name: String },

    Ready,

    Shutdown,

    /// Hold the server off the ready pool for `seconds`; zero means until
    /// told otherwise.
    Reserve { seconds: u64 },

    /// Self-allocate.
    Allocate,

    /// Heartbeat.
    Health,

    SetLabel { key: String, value: String },

    SetAnnotation { key: String, value: String },

    GetGameServer,

    /// Reply with the game server now and again on every change.
    Watch,

    Counter {
        name: String,
        #[serde(flatten)]
        action: CounterAction,
    },

    List {
        name: String,
        #[serde(flatten)]
        action: ListAction,
    },
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Hello { .. } => "hello",
            Op::Ready => "ready",
            Op::Shutdown => "shutdown",
            Op::Reserve { .. } => "reserve",
            Op::Allocate => "allocate",
            Op::Health => "health",
            Op::SetLabel { .. } => "set_label",
            Op::SetAnnotation { .. } => "set_annotation",
            Op::GetGameServer => "get_game_server",
            Op::Watch => "watch",
            Op::Counter { .. } => "counter",
            Op::List { .. } => "list",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CounterAction {
    Increment { amount: i64 },
    Decrement { amount: i64 },
    SetCount { count: i64 },
    SetCapacity { capacity: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ListAction {
    Add { value: String },
    Remove { value: String },
    SetCapacity { capacity: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(flatten)]
    pub reply: Reply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ack { state: GameServerState },
    GameServer { game_server: Box<GameServer> },
    Error { code: String, message: String },
}
