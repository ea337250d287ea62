//! Bus server: the fan-out hub.
//!
//! One websocket endpoint. Connections join rooms; accepted change messages
//! are recorded in the backlog and rebroadcast to the wildcard room `'*'`
//! and to the room named by the message's walk target. A connection joining
//! with a known mtime first gets the room's missed messages replayed.
//!
//! When a writer token is configured, connections that did not present it
//! may still listen, but their inbound messages are rejected, a
//! connection-level failure that never takes the server down.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::store::lock::mutex_lock;

use super::error::BusError;
use super::message::{ChangeMessage, ClientFrame};
use super::rooms::Backlog;

const SOURCE: &str = "bus::server";

const METRIC_BUS_BROADCAST: &str = "veille_bus_broadcast_total";
const METRIC_BUS_REPLAY: &str = "veille_bus_replay_total";
const METRIC_BUS_REJECT: &str = "veille_bus_reject_total";

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(0);

/// Server tuning.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Writer token; `None` accepts messages from any connection.
    pub token: Option<String>,
    /// Backlog window, in messages.
    pub backlog_limit: usize,
    /// Broadcast channel capacity before slow consumers lag.
    pub channel_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            token: None,
            backlog_limit: 256,
            channel_capacity: 1024,
        }
    }
}

/// A message already serialized for the wire, tagged with its rooms.
#[derive(Clone)]
struct Envelope {
    rooms: Arc<Vec<String>>,
    text: Arc<str>,
}

/// Shared bus server state, injected into the websocket handler.
pub struct BusServerState {
    token: Option<String>,
    backlog: Mutex<Backlog>,
    tx: broadcast::Sender<Envelope>,
}

impl BusServerState {
    pub fn new(options: ServerOptions) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(options.channel_capacity);
        Arc::new(Self {
            token: options.token,
            backlog: Mutex::new(Backlog::new(options.backlog_limit)),
            tx,
        })
    }

    /// Newest mtime the backlog has seen; observability and test hook.
    pub fn backlog_high_water(&self) -> i64 {
        mutex_lock(&self.backlog, SOURCE, "high_water").high_water()
    }

    /// Validate, record and fan out one inbound message.
    fn accept(&self, msg: ChangeMessage) -> Result<(), BusError> {
        if msg.key.is_empty() {
            return Err(BusError::validation("message without a key"));
        }
        let rooms = vec!["*".to_string(), msg.target().to_string()];
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(err) => return Err(BusError::validation(format!("unencodable message: {err}"))),
        };
        mutex_lock(&self.backlog, SOURCE, "accept").record(&rooms, &msg);
        counter!(METRIC_BUS_BROADCAST).increment(1);
        // no receivers is fine; the backlog still catches late joiners
        let _ = self.tx.send(Envelope {
            rooms: Arc::new(rooms),
            text: text.into(),
        });
        Ok(())
    }
}

/// The bus server endpoint, mountable into any axum app.
pub fn router(state: Arc<BusServerState>) -> Router {
    Router::new().route("/bus", get(ws_handler)).with_state(state)
}

/// Bind-and-run helper for the standalone hub binary.
pub async fn serve(listener: TcpListener, state: Arc<BusServerState>) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "bus server listening");
    axum::serve(listener, router(state)).await
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BusServerState>>,
    headers: HeaderMap,
) -> Response {
    let authorized = match &state.token {
        None => true,
        Some(token) => headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value == format!("Bearer {token}")),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, authorized))
}

async fn handle_socket(socket: WebSocket, state: Arc<BusServerState>, authorized: bool) {
    let conn = CONNECTION_IDS.fetch_add(1, Ordering::Relaxed);
    info!(conn, authorized, "bus connection open");

    let (mut sink, mut stream) = socket.split();
    let mut joined: HashSet<String> = HashSet::new();
    let mut rx = state.tx.subscribe();

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !handle_frame(&state, &mut sink, &mut joined, conn, authorized, &text).await {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(conn, error = %err, "bus connection receive error");
                        break;
                    }
                }
            }
            envelope = rx.recv() => {
                match envelope {
                    Ok(envelope) => {
                        if envelope.rooms.iter().any(|room| joined.contains(room))
                            && sink
                                .send(WsMessage::Text(envelope.text.to_string().into()))
                                .await
                                .is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(conn, skipped, "slow bus consumer lagged; backlog covers the gap");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    info!(conn, "bus connection closed");
}

/// Handle one client frame; false means the connection should close.
async fn handle_frame(
    state: &BusServerState,
    sink: &mut SplitSink<WebSocket, WsMessage>,
    joined: &mut HashSet<String>,
    conn: u64,
    authorized: bool,
    text: &str,
) -> bool {
    match serde_json::from_str::<ClientFrame>(text) {
        Ok(ClientFrame::Join(join)) => {
            debug!(conn, room = %join.room, since = join.mtime, "join");
            joined.insert(join.room.clone());
            let missed = mutex_lock(&state.backlog, SOURCE, "replay").replay(&join.room, join.mtime);
            counter!(METRIC_BUS_REPLAY).increment(missed.len() as u64);
            for msg in missed {
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    return false;
                }
            }
            true
        }
        Ok(ClientFrame::Leave(leave)) => {
            debug!(conn, room = %leave.room, "leave");
            joined.remove(&leave.room);
            true
        }
        Ok(ClientFrame::Message(msg)) => {
            if !authorized {
                counter!(METRIC_BUS_REJECT).increment(1);
                let err = BusError::auth(format!("connection {conn} did not present the writer token"));
                warn!(conn, key = %msg.key, error = %err, "message rejected");
                return true;
            }
            if let Err(err) = state.accept(msg) {
                counter!(METRIC_BUS_REJECT).increment(1);
                warn!(conn, error = %err, "message rejected");
            }
            true
        }
        Err(err) => {
            counter!(METRIC_BUS_REJECT).increment(1);
            warn!(conn, error = %err, "undecodable frame dropped");
            true
        }
    }
}
