//! Overlay message bus contract.
//!
//! The daemon only needs a small surface from the bus: its own address, a
//! `send` that resolves once the destination acknowledged (or immediately for
//! `no_reply` sends), the set of underlying connections for heartbeats and
//! forced reconnects, and a stream of inbound messages that can be answered
//! in place. [`relay`] implements it over WebSocket relays.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

pub mod relay;
#[cfg(test)]
pub mod testing;

/// Payload encoding flagged by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    Text,
    Binary,
}

/// Per-send options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Do not wait for the receiver's reply.
    pub no_reply: bool,
}

impl SendOptions {
    pub fn no_reply() -> Self {
        Self { no_reply: true }
    }
}

/// Why a send or ping did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No underlying connection is currently up.
    NotConnected,
    /// The client was closed.
    Closed,
    /// The destination did not reply in time.
    Timeout,
    /// Connection-level failure.
    Io(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NotConnected => write!(f, "no connection available"),
            SendError::Closed => write!(f, "client closed"),
            SendError::Timeout => write!(f, "reply timed out"),
            SendError::Io(e) => write!(f, "connection error: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

/// In-place answer to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Reply carrying a payload.
    Payload(String),
    /// Empty acknowledgement.
    Ack,
}

/// A message received from the bus.
///
/// Dropping it without calling [`InboundMessage::respond`] means the sender
/// gets no reply at all.
pub struct InboundMessage {
    pub src: String,
    pub payload: Vec<u8>,
    pub payload_type: PayloadType,
    pub encrypted: bool,
    reply_tx: Option<oneshot::Sender<Reply>>,
}

impl InboundMessage {
    pub fn new(src: String, payload: Vec<u8>, payload_type: PayloadType, encrypted: bool) -> Self {
        Self {
            src,
            payload,
            payload_type,
            encrypted,
            reply_tx: None,
        }
    }

    /// Attach the channel the transport listens on for the in-place reply.
    #[must_use]
    pub fn with_reply(mut self, tx: oneshot::Sender<Reply>) -> Self {
        self.reply_tx = Some(tx);
        self
    }

    /// Answer the sender in place. Returns false if the sender did not ask
    /// for a reply or the transport stopped listening.
    pub fn respond(&mut self, reply: Reply) -> bool {
        match self.reply_tx.take() {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

/// One underlying connection of an aggregate client.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Human-readable identifier (e.g. the relay URL).
    fn id(&self) -> &str;

    /// Protocol-level ping on the raw connection.
    async fn ping(&self) -> Result<(), SendError>;

    /// Drop the current connection and establish a new one.
    fn reconnect(&self);
}

/// Aggregate client over one or more connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Full address of this client (`[identifier.]publicKey`).
    fn address(&self) -> &str;

    /// Send `payload` to `dest`. Unless `options.no_reply` is set, resolves
    /// once the destination replied.
    async fn send(&self, dest: &str, payload: String, options: SendOptions)
        -> Result<(), SendError>;

    /// The underlying connections.
    fn connections(&self) -> Vec<Arc<dyn Connection>>;

    /// Close every connection. Pending sends fail with [`SendError::Closed`].
    async fn close(&self);
}

/// Builds additional clients sharing the daemon's key under another identifier.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Create a client under `identifier` and wait until it is connected.
    async fn connect(&self, identifier: &str) -> Result<Arc<dyn Transport>, SendError>;
}
