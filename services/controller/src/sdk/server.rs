//! Socket front end for the agent protocol.

use std::io;
use std::path::{Path, PathBuf};

use fleetplane_api::{GameServer, ObjectKey, Resource};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::protocol::{Op, Reply, Request, Response};
use super::service::{SdkError, SdkService};
use crate::store::WatchEvent;

/// An agent's subscription to its own game server.
struct Watch {
    id: u64,
    key: ObjectKey,
    changes: broadcast::Receiver<WatchEvent<GameServer>>,
}

/// Serve one agent connection until it closes.
///
/// The first request must be `hello`; everything after it acts on the game
/// server the hello named. A malformed line is answered with an error and
/// does not end the connection.
pub async fn serve_connection<S>(service: SdkService, stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut bound: Option<ObjectKey> = None;
    let mut watching: Option<Watch> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if let Some(response) = handle_line(&service, &mut bound, &mut watching, &line) {
                    send(&mut write, &response).await?;
                }
            }
            Some(update) = next_update(&service, &mut watching) => {
                send(&mut write, &update).await?;
            }
        }
    }

    if let Some(key) = bound {
        debug!(game_server = %key, "Agent disconnected");
    }
    Ok(())
}

fn handle_line(
    service: &SdkService,
    bound: &mut Option<ObjectKey>,
    watching: &mut Option<Watch>,
    line: &str,
) -> Option<Response> {
    if line.trim().is_empty() {
        return None;
    }
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Malformed agent request");
            let reply = error_reply("invalid_request", e.to_string());
            return Some(Response { id: 0, reply });
        }
    };

    let current = bound.clone();
    let reply = match (&request.op, current.as_ref()) {
        (Op::Hello { namespace, name }, _) => {
            let key = ObjectKey::new(namespace, name);
            let reply = service.handle(&key, &request.op);
            if reply.is_ok() {
                info!(game_server = %key, "Agent connected");
                if watching.as_ref().is_some_and(|w| w.key != key) {
                    *watching = None;
                }
                *bound = Some(key);
            }
            reply
        }
        (Op::Watch, Some(key)) => {
            // Subscribe before reading so no change slips in between.
            let changes = service.changes();
            let reply = service.handle(key, &request.op);
            if reply.is_ok() {
                debug!(game_server = %key, "Agent watching");
                *watching = Some(Watch {
                    id: request.id,
                    key: key.clone(),
                    changes,
                });
            }
            reply
        }
        (op, Some(key)) => service.handle(key, op),
        (_, None) => Err(SdkError::NotConnected),
    };

    let reply = reply.unwrap_or_else(|e| {
        debug!(op = request.op.name(), error = %e, "Agent request rejected");
        error_reply(e.code(), e.to_string())
    });
    Some(Response {
        id: request.id,
        reply,
    })
}

/// The next snapshot for a watching agent. Never resolves while nothing is
/// watched; yields `None` when the watch ends without one.
async fn next_update(service: &SdkService, watching: &mut Option<Watch>) -> Option<Response> {
    let Some(current) = watching.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        let (gs, last) = match current.changes.recv().await {
            Ok(WatchEvent::Applied(gs)) => (gs, false),
            Ok(WatchEvent::Deleted(gs)) => (gs, true),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                debug!(game_server = %current.key, missed, "Watch lagged, sending current state");
                let id = current.id;
                return match service.handle(&current.key, &Op::GetGameServer) {
                    Ok(reply) => Some(Response { id, reply }),
                    Err(_) => {
                        *watching = None;
                        None
                    }
                };
            }
            Err(broadcast::error::RecvError::Closed) => {
                *watching = None;
                return None;
            }
        };
        if gs.key() != current.key {
            continue;
        }
        let id = current.id;
        if last {
            *watching = None;
        }
        return Some(Response {
            id,
            reply: Reply::GameServer {
                game_server: Box::new(gs),
            },
        });
    }
}

fn error_reply(code: &str, message: String) -> Reply {
    Reply::Error {
        code: code.to_string(),
        message,
    }
}

async fn send<W: AsyncWrite + Unpin>(write: &mut W, response: &Response) -> io::Result<()> {
    let mut buf = serde_json::to_vec(response)?;
    buf.push(b'\n');
    write.write_all(&buf).await?;
    write.flush().await
}

/// Listen on a Unix socket at `path` until `shutdown` flips.
///
/// A stale socket file from an earlier run is removed first.
pub async fn serve_unix(
    service: SdkService,
    path: &Path,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale SDK socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    let _guard = SocketGuard(path.to_path_buf());
    info!(path = %path.display(), "SDK server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let service = service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(service, stream).await {
                            warn!(error = %e, "Agent connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("SDK server stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Removes the socket file when the server stops.
struct SocketGuard(PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
