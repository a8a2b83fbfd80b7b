use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use kindred_types::events::{ConnectionId, RelayCommand, RelayEvent};

use crate::listeners::ListenerRegistry;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound side of the relay connection. Emits are fire-and-forget: REST is
/// the durability boundary, so a lost emit only delays other sessions until
/// their next load.
pub trait RelayLink: Send + Sync {
    fn emit(&self, command: RelayCommand);

    fn is_active(&self) -> bool;
}

/// Stand-in used when no relay connection could be made.
pub struct DetachedLink;

impl RelayLink for DetachedLink {
    fn emit(&self, command: RelayCommand) {
        debug!("relay unavailable, dropping {}", command.name());
    }

    fn is_active(&self) -> bool {
        false
    }
}

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relay connection over a WebSocket. Incoming events are handed to the
/// listener registry; outgoing commands go through an unbounded queue to a
/// supervisor task that owns the socket.
///
/// When the socket drops, the supervisor reconnects with exponential backoff
/// and publishes each new connection id on `connection_ids`. Registrations
/// are per connection, so whoever holds the session must re-register.
pub struct WsRelayLink {
    tx: mpsc::UnboundedSender<RelayCommand>,
    active: Arc<AtomicBool>,
    ids: watch::Receiver<Option<ConnectionId>>,
}

impl WsRelayLink {
    /// Connect and wait for the relay's `ready` frame. Only this first
    /// attempt fails the call; later drops are retried in the background.
    pub async fn connect(url: &str, listeners: ListenerRegistry) -> anyhow::Result<Self> {
        let (ws, connection_id) = open(url).await?;

        let active = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel::<RelayCommand>();
        let (id_tx, ids) = watch::channel(Some(connection_id));

        tokio::spawn(supervise(
            url.to_string(),
            ws,
            rx,
            listeners,
            active.clone(),
            id_tx,
        ));

        Ok(Self { tx, active, ids })
    }

    /// Id of the live connection, `None` while reconnecting.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        *self.ids.borrow()
    }

    /// Wakes on every reconnect and every drop.
    pub fn connection_ids(&self) -> watch::Receiver<Option<ConnectionId>> {
        self.ids.clone()
    }
}

async fn open(url: &str) -> anyhow::Result<(RelaySocket, ConnectionId)> {
    let (mut ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .with_context(|| format!("failed to connect to relay at {url}"))?;

    let connection_id = tokio::time::timeout(READY_TIMEOUT, wait_for_ready(&mut ws))
        .await
        .context("relay did not send ready")??;

    info!("relay connected as {}", connection_id);
    Ok((ws, connection_id))
}

async fn supervise(
    url: String,
    mut ws: RelaySocket,
    mut rx: mpsc::UnboundedReceiver<RelayCommand>,
    listeners: ListenerRegistry,
    active: Arc<AtomicBool>,
    ids: watch::Sender<Option<ConnectionId>>,
) {
    loop {
        if pump(ws, &mut rx, &listeners).await == Pump::LinkDropped {
            active.store(false, Ordering::Release);
            debug!("relay link dropped, closing connection");
            return;
        }
        active.store(false, Ordering::Release);
        ids.send_replace(None);
        warn!("relay connection lost, reconnecting");

        let mut delay = RECONNECT_MIN;
        let (next, connection_id) = loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => debug!("relay link down, dropping {}", cmd.name()),
                    None => return,
                },
                _ = tokio::time::sleep(delay) => match open(&url).await {
                    Ok(opened) => break opened,
                    Err(e) => {
                        delay = (delay * 2).min(RECONNECT_MAX);
                        warn!("relay reconnect failed, retrying in {:?}: {:#}", delay, e);
                    }
                },
            }
        };

        ws = next;
        active.store(true, Ordering::Release);
        ids.send_replace(Some(connection_id));
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Pump {
    ConnectionLost,
    LinkDropped,
}

/// Shuttle commands out and events in until either side ends.
async fn pump(
    ws: RelaySocket,
    rx: &mut mpsc::UnboundedReceiver<RelayCommand>,
    listeners: &ListenerRegistry,
) -> Pump {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    let _ = sink.close().await;
                    return Pump::LinkDropped;
                };
                let text = match serde_json::to_string(&cmd) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode {}: {}", cmd.name(), e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return Pump::ConnectionLost;
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayEvent>(&text) {
                    Ok(event) => {
                        listeners.dispatch(&event);
                    }
                    Err(e) => warn!("undecodable relay event: {}", e),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Pump::ConnectionLost,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn wait_for_ready<S>(stream: &mut S) -> anyhow::Result<ConnectionId>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        if let Message::Text(text) = msg? {
            if let Ok(RelayEvent::Ready { connection_id }) = serde_json::from_str(&text) {
                return Ok(connection_id);
            }
        }
    }
    Err(anyhow!("relay closed before ready"))
}

impl RelayLink for WsRelayLink {
    fn emit(&self, command: RelayCommand) {
        if !self.is_active() {
            debug!("relay link down, dropping {}", command.name());
            return;
        }
        if let Err(e) = self.tx.send(command) {
            debug!("relay writer gone, dropping {}", e.0.name());
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}
