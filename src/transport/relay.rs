//! WebSocket relay client: the aggregate bus client used by the daemon.
//!
//! One WebSocket is kept per configured relay URL, each with its own
//! exponential-backoff reconnect loop. On connect the client registers its
//! address; the relay routes frames between registered addresses.
//!
//! Frames are JSON text messages tagged by `type`:
//!
//! | Direction | `type`     | Fields                                                    |
//! |-----------|------------|-----------------------------------------------------------|
//! | out       | `register` | `addr`                                                    |
//! | out       | `send`     | `id`, `dest`, `payload`, `payload_type`, `encrypted`, `no_reply` |
//! | in        | `message`  | `id`, `src`, `payload`, `payload_type`, `encrypted`, `no_reply` |
//! | out       | `reply`    | `reply_to`, `dest`, `payload?`                            |
//! | in        | `response` | `reply_to`, `src`, `payload?`                             |
//! | in        | `error`    | `reply_to?`, `message`                                    |
//!
//! Outbound sends go out on every live connection; inbound messages are
//! de-duplicated by `id`, so a message seen on several relays is delivered
//! once. Binary payloads travel base64-encoded.
//!
//! `encrypted` reflects the hop: only `wss://` connections set it on the way
//! out, and anything received over plain `ws://` is marked unencrypted
//! whatever the frame claims.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ClientFactory, Connection, InboundMessage, PayloadType, Reply, SendError, SendOptions,
    Transport,
};
use crate::config::TransportConfig;

/// Capacity of the inbound queue shared by all connections.
const INBOUND_QUEUE: usize = 256;
/// Capacity of each connection's outbound frame queue.
const OUTBOUND_QUEUE: usize = 256;
/// Message ids remembered for de-duplication.
const SEEN_IDS: usize = 1024;
/// How long [`RelayClientFactory::connect`] waits for the first connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Relay client settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub urls: Vec<String>,
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reply_timeout: Duration,
}

impl RelayConfig {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            urls: config.relays.clone(),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs.max(1)),
            reconnect_max_delay: Duration::from_secs(config.reconnect_max_delay_secs.max(1)),
            reply_timeout: Duration::from_secs(config.reply_timeout_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Register {
        addr: String,
    },
    Send {
        id: String,
        dest: String,
        payload: String,
        payload_type: PayloadType,
        encrypted: bool,
        #[serde(default)]
        no_reply: bool,
    },
    Message {
        id: String,
        src: String,
        payload: String,
        payload_type: PayloadType,
        #[serde(default)]
        encrypted: bool,
        #[serde(default)]
        no_reply: bool,
    },
    Reply {
        reply_to: String,
        dest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
    Response {
        reply_to: String,
        src: String,
        #[serde(default)]
        payload: Option<String>,
    },
    Error {
        #[serde(default)]
        reply_to: Option<String>,
        message: String,
    },
}

impl Frame {
    fn to_message(&self) -> Result<Message, SendError> {
        serde_json::to_string(self)
            .map(|s| Message::Text(s.into()))
            .map_err(|e| SendError::Io(e.to_string()))
    }
}

/// Bounded set of recently seen message ids.
struct RecentIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.order.push_back(id.to_string());
        self.set.insert(id.to_string());
        true
    }
}

type PendingReplies = HashMap<String, oneshot::Sender<Result<(), SendError>>>;

/// State shared by the client handle and its connection loops.
struct Shared {
    address: String,
    pending: Mutex<PendingReplies>,
    seen: Mutex<RecentIds>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    live_tx: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl Shared {
    fn complete(&self, id: &str, result: Result<(), SendError>) {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
    }
}

/// One relay WebSocket.
pub struct RelayConnection {
    url: String,
    /// TLS (`wss://`) connection.
    secure: bool,
    outbound: mpsc::Sender<Message>,
    connected: AtomicBool,
    reconnect: Notify,
}

impl RelayConnection {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connection for RelayConnection {
    fn id(&self) -> &str {
        &self.url
    }

    async fn ping(&self) -> Result<(), SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        self.outbound
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|_| SendError::Closed)
    }

    fn reconnect(&self) {
        self.reconnect.notify_one();
    }
}

/// Marks a connection live for as long as it is held.
struct LiveGuard<'a> {
    shared: &'a Shared,
    conn: &'a RelayConnection,
}

impl<'a> LiveGuard<'a> {
    fn new(shared: &'a Shared, conn: &'a RelayConnection) -> Self {
        conn.connected.store(true, Ordering::Relaxed);
        shared.live_tx.send_modify(|n| *n += 1);
        Self { shared, conn }
    }
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.conn.connected.store(false, Ordering::Relaxed);
        self.shared.live_tx.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Reason a single connection attempt ended.
enum Disconnect {
    /// Relay closed the socket or the stream ended.
    Closed,
    /// [`Connection::reconnect`] was called.
    Requested,
    /// The client is shutting down.
    Shutdown,
}

/// Aggregate client over all configured relays.
pub struct RelayClient {
    shared: Arc<Shared>,
    connections: Vec<Arc<RelayConnection>>,
    reply_timeout: Duration,
}

impl RelayClient {
    /// Start one connection loop per relay URL. Returns the client and the
    /// queue inbound messages are delivered on.
    pub fn start(config: RelayConfig, address: String) -> (Arc<Self>, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (live_tx, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            address,
            pending: Mutex::new(HashMap::new()),
            seen: Mutex::new(RecentIds::new(SEEN_IDS)),
            inbound_tx,
            live_tx,
            cancel: CancellationToken::new(),
        });

        let connections = config
            .urls
            .iter()
            .map(|url| {
                let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
                let secure = is_secure_url(url);
                if !secure {
                    warn!("Relay {url} is not TLS; messages over it count as unencrypted");
                }
                let conn = Arc::new(RelayConnection {
                    url: url.clone(),
                    secure,
                    outbound,
                    connected: AtomicBool::new(false),
                    reconnect: Notify::new(),
                });
                tokio::spawn(connection_loop(
                    Arc::clone(&shared),
                    Arc::clone(&conn),
                    outbound_rx,
                    config.clone(),
                ));
                conn
            })
            .collect();

        let client = Arc::new(Self {
            shared,
            connections,
            reply_timeout: config.reply_timeout,
        });
        (client, inbound_rx)
    }

    /// Number of relays currently connected.
    pub fn live_connections(&self) -> usize {
        *self.shared.live_tx.borrow()
    }

    /// Wait until at least one relay is connected.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), SendError> {
        let mut rx = self.shared.live_tx.subscribe();
        let cancel = self.shared.cancel.clone();
        tokio::select! {
            r = tokio::time::timeout(timeout, rx.wait_for(|n| *n > 0)) => match r {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(_)) => Err(SendError::Closed),
                Err(_) => Err(SendError::Timeout),
            },
            () = cancel.cancelled() => Err(SendError::Closed),
        }
    }

    fn shutdown(&self) {
        self.shared.cancel.cancel();
        let pending: Vec<_> = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(SendError::Closed));
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Transport for RelayClient {
    fn address(&self) -> &str {
        &self.shared.address
    }

    async fn send(
        &self,
        dest: &str,
        payload: String,
        options: SendOptions,
    ) -> Result<(), SendError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }

        let id = Uuid::new_v4().to_string();
        let frame = |encrypted| Frame::Send {
            id: id.clone(),
            dest: dest.to_string(),
            payload: payload.clone(),
            payload_type: PayloadType::Text,
            encrypted,
            no_reply: options.no_reply,
        };
        let secure = frame(true).to_message()?;
        let plain = frame(false).to_message()?;

        let reply_rx = if options.no_reply {
            None
        } else {
            let (tx, rx) = oneshot::channel();
            self.shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id.clone(), tx);
            Some(rx)
        };

        let mut sent = 0usize;
        for conn in self.connections.iter().filter(|c| c.is_connected()) {
            let message = if conn.secure { &secure } else { &plain };
            if conn.outbound.send(message.clone()).await.is_ok() {
                sent += 1;
            }
        }
        if sent == 0 {
            self.shared
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            return Err(SendError::NotConnected);
        }

        let Some(reply_rx) = reply_rx else {
            return Ok(());
        };
        let result = tokio::time::timeout(self.reply_timeout, reply_rx).await;
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SendError::Closed),
            Err(_) => Err(SendError::Timeout),
        }
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
            .collect()
    }

    async fn close(&self) {
        self.shutdown();
    }
}

/// Builds disposable relay clients under the daemon's public key.
pub struct RelayClientFactory {
    config: RelayConfig,
    public_key: String,
}

impl RelayClientFactory {
    pub fn new(config: RelayConfig, public_key: String) -> Self {
        Self { config, public_key }
    }
}

#[async_trait]
impl ClientFactory for RelayClientFactory {
    async fn connect(&self, identifier: &str) -> Result<Arc<dyn Transport>, SendError> {
        let address = crate::identity::make_address(identifier, &self.public_key);
        let (client, _inbound) = RelayClient::start(self.config.clone(), address);
        if let Err(e) = client.wait_connected(CONNECT_TIMEOUT).await {
            client.shutdown();
            return Err(e);
        }
        Ok(client)
    }
}

fn is_secure_url(url: &str) -> bool {
    url.get(..6)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("wss://"))
}

/// Connect, run, and reconnect with exponential backoff until shutdown.
async fn connection_loop(
    shared: Arc<Shared>,
    conn: Arc<RelayConnection>,
    mut outbound_rx: mpsc::Receiver<Message>,
    config: RelayConfig,
) {
    let mut delay = config.reconnect_delay;
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        debug!("Relay: connecting to {}", conn.url);
        match run_connection(&shared, &conn, &mut outbound_rx).await {
            Ok(Disconnect::Shutdown) => break,
            Ok(Disconnect::Requested) => {
                info!("Relay: reconnecting to {} on request", conn.url);
                delay = config.reconnect_delay;
                continue;
            }
            Ok(Disconnect::Closed) => {
                info!("Relay: connection to {} closed, reconnecting...", conn.url);
                delay = config.reconnect_delay;
            }
            Err(e) => {
                warn!(
                    "Relay: connection to {} failed: {e}, reconnecting in {}s",
                    conn.url,
                    delay.as_secs()
                );
            }
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = conn.reconnect.notified() => {}
            () = shared.cancel.cancelled() => break,
        }
        delay = (delay * 2).min(config.reconnect_max_delay);
    }
    debug!("Relay: connection loop for {} stopped", conn.url);
}

/// A single connection attempt: connect, register, pump frames until disconnect.
async fn run_connection(
    shared: &Arc<Shared>,
    conn: &Arc<RelayConnection>,
    outbound_rx: &mut mpsc::Receiver<Message>,
) -> Result<Disconnect, Box<dyn std::error::Error + Send + Sync>> {
    let connect = tokio_tungstenite::connect_async(conn.url.as_str());
    let (ws_stream, _response) = tokio::select! {
        r = connect => r?,
        () = shared.cancel.cancelled() => return Ok(Disconnect::Shutdown),
    };
    let (mut sink, mut stream) = ws_stream.split();

    sink.send(
        Frame::Register {
            addr: shared.address.clone(),
        }
        .to_message()?,
    )
    .await?;

    let _live = LiveGuard::new(shared, conn);
    info!("Relay: connected to {} as {}", conn.url, shared.address);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { return Ok(Disconnect::Closed) };
                match msg? {
                    Message::Text(text) => handle_frame(shared, conn, &text),
                    Message::Close(_) => return Ok(Disconnect::Closed),
                    _ => {}
                }
            }
            out = outbound_rx.recv() => {
                let Some(out) = out else { return Ok(Disconnect::Shutdown) };
                sink.send(out).await?;
            }
            () = conn.reconnect.notified() => {
                let _ = sink.close().await;
                return Ok(Disconnect::Requested);
            }
            () = shared.cancel.cancelled() => {
                let _ = sink.close().await;
                return Ok(Disconnect::Shutdown);
            }
        }
    }
}

fn handle_frame(shared: &Arc<Shared>, conn: &Arc<RelayConnection>, text: &str) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!("Relay: ignoring unparseable frame from {}: {e}", conn.url);
            return;
        }
    };

    match frame {
        Frame::Message {
            id,
            src,
            payload,
            payload_type,
            encrypted,
            no_reply,
        } => {
            let fresh = shared
                .seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(&id);
            if !fresh {
                return;
            }
            let payload = match payload_type {
                PayloadType::Text => payload.into_bytes(),
                PayloadType::Binary => match BASE64.decode(payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Relay: bad binary payload from {src}: {e}");
                        return;
                    }
                },
            };

            let encrypted = encrypted && conn.secure;
            let mut msg = InboundMessage::new(src.clone(), payload, payload_type, encrypted);
            if !no_reply {
                let (tx, rx) = oneshot::channel();
                msg = msg.with_reply(tx);
                let conn = Arc::clone(conn);
                tokio::spawn(async move {
                    let Ok(reply) = rx.await else { return };
                    let payload = match reply {
                        Reply::Payload(p) => Some(p),
                        Reply::Ack => None,
                    };
                    let frame = Frame::Reply {
                        reply_to: id,
                        dest: src,
                        payload,
                    };
                    match frame.to_message() {
                        Ok(m) => {
                            if conn.outbound.send(m).await.is_err() {
                                debug!("Relay: reply dropped, connection gone");
                            }
                        }
                        Err(e) => warn!("Relay: failed to encode reply: {e}"),
                    }
                });
            }

            match shared.inbound_tx.try_send(msg) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(m)) => {
                    warn!("Relay: inbound queue full, dropping message from {}", m.src);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Relay: no inbound consumer, message dropped");
                }
            }
        }
        Frame::Response { reply_to, .. } => shared.complete(&reply_to, Ok(())),
        Frame::Error {
            reply_to: Some(id),
            message,
        } => shared.complete(&id, Err(SendError::Io(message))),
        Frame::Error {
            reply_to: None,
            message,
        } => warn!("Relay {}: {message}", conn.url),
        other => debug!("Relay: unexpected frame from {}: {other:?}", conn.url),
    }
}
