//! Producer/consumer side of the invalidation bus.
//!
//! [`Publisher`] is the fire-and-forget sending handle: it never blocks and
//! never fails the mutation that triggered it. A send that cannot be
//! delivered is logged and dropped, correctness degrading to the next
//! backlog replay.
//!
//! [`BusClient::spawn`] runs the subscriber connection manager: pick a server
//! from the pool at random, connect, join the wildcard room with the local
//! high-water mtime (the server replays what was missed), deliver every
//! message into [`ResourceStore::invalidate_parents`], and on any failure
//! reconnect forever with jittered exponential backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info, warn};

use crate::store::ResourceStore;
use crate::store::resource::now_millis;

use super::message::{ChangeMessage, JoinFrame};

const METRIC_BUS_PUBLISH: &str = "veille_bus_publish_total";
const METRIC_BUS_DELIVER: &str = "veille_bus_deliver_total";

/// Fire-and-forget sending handle over the bus connection.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<ChangeMessage>,
}

impl Publisher {
    /// Queue a message for the bus. Missing mtimes are stamped here so every
    /// message on the wire is orderable.
    pub fn send(&self, mut msg: ChangeMessage) {
        if msg.key.is_empty() {
            warn!("dropping invalidation message without a key");
            return;
        }
        if msg.mtime == 0 {
            msg.mtime = now_millis();
        }
        counter!(METRIC_BUS_PUBLISH).increment(1);
        if self.tx.send(msg).is_err() {
            warn!("bus client is gone; invalidation message dropped");
        }
    }

    /// A publisher wired to a plain channel instead of a live bus. The
    /// receiving end sees exactly what would have gone on the wire.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChangeMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Subscriber connection state, observable through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Disconnected,
    Connecting,
    Joined,
}

/// Reconnect backoff tuning.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 250,
            max_ms: 15_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

/// Connection settings for one bus client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server pool; one is picked at random per connection attempt.
    pub pool: Vec<String>,
    /// Writer token, sent as a bearer header when configured.
    pub token: Option<String>,
    pub reconnect: ReconnectConfig,
}

/// The bus client: one socket shared by the publisher and the subscriber.
pub struct BusClient;

impl BusClient {
    /// Attach the connection manager to an existing publisher channel
    /// (create one with [`Publisher::channel`]; the store is built over the
    /// publisher half, the manager consumes the receiving half). Returns a
    /// watch over the subscriber state machine.
    pub fn attach(
        store: ResourceStore,
        options: ClientOptions,
        outbound: mpsc::UnboundedReceiver<ChangeMessage>,
    ) -> watch::Receiver<BusState> {
        let (state_tx, state_rx) = watch::channel(BusState::Disconnected);
        tokio::spawn(run_manager(store, options, outbound, state_tx));
        state_rx
    }
}

async fn run_manager(
    store: ResourceStore,
    options: ClientOptions,
    mut outbound: mpsc::UnboundedReceiver<ChangeMessage>,
    state_tx: watch::Sender<BusState>,
) {
    let last_seen = Arc::new(AtomicI64::new(0));
    let mut backoff = options.reconnect.initial_ms;

    loop {
        let Some(url) = pick(&options.pool) else {
            warn!("bus pool is empty; subscriber idle");
            return;
        };
        state_tx.send_replace(BusState::Connecting);

        match connect(url, options.token.as_deref()).await {
            Ok(socket) => {
                let (mut sink, mut stream) = socket.split();
                let join = JoinFrame {
                    room: "*".to_string(),
                    mtime: last_seen.load(Ordering::Acquire),
                };
                let joined = match serde_json::to_string(&join) {
                    Ok(frame) => sink.send(WsMessage::Text(frame.into())).await.is_ok(),
                    Err(_) => false,
                };
                if joined {
                    info!(url, "bus joined");
                    state_tx.send_replace(BusState::Joined);
                    backoff = options.reconnect.initial_ms;

                    loop {
                        tokio::select! {
                            queued = outbound.recv() => {
                                let Some(msg) = queued else { return };
                                let frame = match serde_json::to_string(&msg) {
                                    Ok(frame) => frame,
                                    Err(err) => {
                                        warn!(key = %msg.key, error = %err, "unencodable bus message dropped");
                                        continue;
                                    }
                                };
                                if let Err(err) = sink.send(WsMessage::Text(frame.into())).await {
                                    warn!(error = %err, "bus send failed; reconnecting");
                                    break;
                                }
                            }
                            received = stream.next() => {
                                match received {
                                    Some(Ok(WsMessage::Text(text))) => {
                                        deliver(&store, &last_seen, &text).await;
                                    }
                                    Some(Ok(WsMessage::Close(_))) | None => {
                                        info!("bus connection closed");
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(err)) => {
                                        warn!(error = %err, "bus receive failed; reconnecting");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                state_tx.send_replace(BusState::Disconnected);
            }
            Err(err) => {
                debug!(url, error = %err, "bus connect failed");
                state_tx.send_replace(BusState::Disconnected);
            }
        }

        tokio::time::sleep(Duration::from_millis(jittered_backoff(
            backoff,
            options.reconnect.jitter_ms,
        )))
        .await;
        let next = (backoff as f64 * options.reconnect.multiplier) as u64;
        backoff = next.min(options.reconnect.max_ms);
    }
}

async fn deliver(store: &ResourceStore, last_seen: &AtomicI64, text: &str) {
    let msg: ChangeMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(err) => {
            warn!(error = %err, "undecodable bus message dropped");
            return;
        }
    };
    last_seen.fetch_max(msg.mtime, Ordering::AcqRel);
    counter!(METRIC_BUS_DELIVER).increment(1);
    if let Err(err) = store.invalidate_parents(&msg).await {
        warn!(key = %msg.key, error = %err, "invalidation delivery failed");
    }
}

async fn connect(
    url: &str,
    token: Option<&str>,
) -> Result<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    tokio_tungstenite::tungstenite::Error,
> {
    let mut request = url.into_client_request()?;
    if let Some(token) = token {
        match tokio_tungstenite::tungstenite::http::HeaderValue::try_from(format!("Bearer {token}"))
        {
            Ok(value) => {
                request.headers_mut().insert("authorization", value);
            }
            Err(_) => warn!("bus token contains invalid header characters; sent without auth"),
        }
    }
    let (socket, _response) = connect_async(request).await?;
    Ok(socket)
}

fn pick(pool: &[String]) -> Option<&str> {
    if pool.is_empty() {
        return None;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as usize;
    Some(&pool[nanos % pool.len()])
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    base_ms.saturating_add(nanos % jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publisher_stamps_missing_mtime() {
        let (publisher, mut rx) = Publisher::channel();
        publisher.send(ChangeMessage::put("k").with_mtime(0));

        let msg = rx.recv().await.expect("message");
        assert!(msg.mtime > 0);
    }

    #[tokio::test]
    async fn publisher_drops_keyless_messages() {
        let (publisher, mut rx) = Publisher::channel();
        publisher.send(ChangeMessage::put(""));
        drop(publisher);

        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn publisher_survives_closed_channel() {
        let (publisher, rx) = Publisher::channel();
        drop(rx);
        // logged and swallowed, never a panic or an error to the caller
        publisher.send(ChangeMessage::put("k"));
    }

    #[test]
    fn backoff_jitter_is_bounded() {
        for _ in 0..32 {
            let delay = jittered_backoff(100, 50);
            assert!((100..150).contains(&delay));
        }
        assert_eq!(jittered_backoff(100, 0), 100);
    }

    #[test]
    fn pick_stays_in_pool() {
        let pool = vec!["ws://a".to_string(), "ws://b".to_string()];
        for _ in 0..16 {
            assert!(pool.iter().any(|u| u == pick(&pool).expect("pick")));
        }
        assert!(pick(&[]).is_none());
    }
}
