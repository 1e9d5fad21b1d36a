//! Agent-facing SDK.
//!
//! The process inside each game server pod talks to the controller over a
//! local socket using the line protocol in [`protocol`]. Requests become
//! compare-and-swap writes on the game server object; the game server
//! controller reacts to those writes like any other change. An agent that
//! sends `watch` is pushed a fresh snapshot on every change.

mod protocol;
mod server;
mod service;

pub use protocol::{CounterAction, ListAction, Op, Reply, Request, Response};
pub use server::{serve_connection, serve_unix};
pub use service::{SdkError, SdkService};
