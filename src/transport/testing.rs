//! In-memory transport for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{ClientFactory, Connection, SendError, SendOptions, Transport};

/// A send captured by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub dest: String,
    pub payload: String,
    pub options: SendOptions,
}

#[derive(Default)]
pub struct RecordingConnection {
    pub pings: AtomicUsize,
    pub reconnects: AtomicUsize,
    pub fail_pings: AtomicBool,
}

#[async_trait]
impl Connection for RecordingConnection {
    fn id(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> Result<(), SendError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_pings.load(Ordering::SeqCst) {
            Err(SendError::NotConnected)
        } else {
            Ok(())
        }
    }

    fn reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every send; optionally fails them.
pub struct RecordingTransport {
    address: String,
    pub sent: Mutex<Vec<Sent>>,
    pub fail_sends: AtomicBool,
    pub closed: AtomicBool,
    pub conns: Vec<Arc<RecordingConnection>>,
    notify: Notify,
}

impl RecordingTransport {
    pub fn new(address: &str) -> Arc<Self> {
        Self::with_connections(address, 1)
    }

    pub fn with_connections(address: &str, n: usize) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            conns: (0..n).map(|_| Arc::default()).collect(),
            notify: Notify::new(),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until `pred` holds over the recorded sends, or panic after `timeout`.
    pub async fn wait_for(&self, timeout: Duration, pred: impl Fn(&[Sent]) -> bool) -> Vec<Sent> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                {
                    let sent = self.sent.lock().unwrap();
                    if pred(&sent) {
                        return sent.clone();
                    }
                }
                let _ = tokio::time::timeout(Duration::from_millis(50), notified).await;
            }
        })
        .await
        .expect("condition on recorded sends not met in time")
    }

    pub fn reconnects(&self) -> usize {
        self.conns
            .iter()
            .map(|c| c.reconnects.load(Ordering::SeqCst))
            .sum()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(
        &self,
        dest: &str,
        payload: String,
        options: SendOptions,
    ) -> Result<(), SendError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SendError::Timeout);
        }
        self.sent.lock().unwrap().push(Sent {
            dest: dest.to_string(),
            payload,
            options,
        });
        self.notify.notify_waiters();
        Ok(())
    }

    fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.conns
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
            .collect()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`RecordingTransport`]s and remembers them.
#[derive(Default)]
pub struct RecordingFactory {
    pub attempts: AtomicUsize,
    pub fail_sends: AtomicBool,
    pub fail_connect: AtomicBool,
    pub made: Mutex<Vec<(String, Arc<RecordingTransport>)>>,
}

#[async_trait]
impl ClientFactory for RecordingFactory {
    async fn connect(&self, identifier: &str) -> Result<Arc<dyn Transport>, SendError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SendError::Timeout);
        }
        let client = RecordingTransport::new(&format!("{identifier}.pk"));
        client
            .fail_sends
            .store(self.fail_sends.load(Ordering::SeqCst), Ordering::SeqCst);
        self.made
            .lock()
            .unwrap()
            .push((identifier.to_string(), Arc::clone(&client)));
        Ok(client)
    }
}
