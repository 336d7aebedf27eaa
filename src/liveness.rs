//! Network liveness supervision.
//!
//! Relay connections can go silently dead: the socket stays open but nothing
//! is delivered. Three independent tasks watch for that:
//!
//! - **heartbeat**: a protocol-level ping on every underlying connection each
//!   `ping_interval`. Failures are logged and otherwise ignored.
//! - **keepalive**: each `ping_interval`, send an empty message to our own
//!   address and wait for the echo to be acknowledged.
//! - **forced probe**: each `force_ping_interval`, connect a disposable client
//!   under a throwaway identifier, let it settle, send one empty message to
//!   the primary address, then close it whatever happened.
//!
//! Keepalive and probe each track their own last success. When a send fails
//! and the last success is more than 3 intervals old every connection is
//! told to reconnect; past 5 intervals in strict mode the daemon is asked to
//! terminate so an external supervisor can restart it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::transport::{ClientFactory, SendError, SendOptions, Transport};

/// Stale-for multiple of the interval after which connections are rebuilt.
const RECONNECT_AFTER: u32 = 3;
/// Stale-for multiple of the interval after which strict mode terminates.
const TERMINATE_AFTER: u32 = 5;
/// Delay between the probe client connecting and sending its probe.
const PROBE_SETTLE_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub ping_interval: Duration,
    pub force_ping_interval: Duration,
    pub settle_delay: Duration,
    /// Terminate instead of only reconnecting when liveness is lost for long.
    pub must_keepalive: bool,
    /// Daemon identifier, appended to probe identifiers.
    pub identifier: String,
}

impl LivenessConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            force_ping_interval: config.force_ping_interval(),
            settle_delay: PROBE_SETTLE_DELAY,
            must_keepalive: config.keepalive.must_keepalive,
            identifier: config.daemon.identifier.clone(),
        }
    }
}

/// What to do after a failed keepalive or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Healthy,
    Reconnect,
    Terminate,
}

/// Escalation for a failure `elapsed` after the last success.
pub fn escalate(elapsed: Duration, interval: Duration, strict: bool) -> Escalation {
    if strict && elapsed > interval * TERMINATE_AFTER {
        Escalation::Terminate
    } else if elapsed > interval * RECONNECT_AFTER {
        Escalation::Reconnect
    } else {
        Escalation::Healthy
    }
}

/// Throwaway identifier for a probe client: 8 random hex digits, then the
/// daemon identifier if there is one.
pub fn probe_identifier(identifier: &str) -> String {
    let tag = hex::encode(rand::random::<[u8; 4]>());
    if identifier.is_empty() {
        tag
    } else {
        format!("{tag}.{identifier}")
    }
}

/// Running liveness tasks. Dropping the handle stops them.
pub struct LivenessHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl LivenessHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for LivenessHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start heartbeat, keepalive, and forced-probe tasks for `transport`.
///
/// A terminate decision is reported on `fatal_tx`; the receiver is expected
/// to exit the process.
pub fn spawn(
    transport: Arc<dyn Transport>,
    factory: Arc<dyn ClientFactory>,
    config: LivenessConfig,
    fatal_tx: mpsc::Sender<String>,
) -> LivenessHandle {
    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&transport),
        config.ping_interval,
    ));
    let keepalive = tokio::spawn(keepalive_loop(
        Arc::clone(&transport),
        config.clone(),
        fatal_tx.clone(),
    ));
    let probe = tokio::spawn(probe_loop(transport, factory, config, fatal_tx));
    LivenessHandle {
        tasks: vec![heartbeat, keepalive, probe],
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    // interval_at panics on a zero period.
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn heartbeat_loop(transport: Arc<dyn Transport>, period: Duration) {
    let mut interval = ticker(period);
    loop {
        interval.tick().await;
        for conn in transport.connections() {
            match conn.ping().await {
                Ok(()) | Err(SendError::NotConnected) => {}
                Err(e) => warn!("Websocket ping on {} failed: {e}", conn.id()),
            }
        }
    }
}

async fn keepalive_loop(
    transport: Arc<dyn Transport>,
    config: LivenessConfig,
    fatal_tx: mpsc::Sender<String>,
) {
    let mut interval = ticker(config.ping_interval);
    let mut last_success = Instant::now();
    loop {
        interval.tick().await;
        let own = transport.address().to_string();
        match transport
            .send(&own, String::new(), SendOptions::default())
            .await
        {
            Ok(()) => last_success = Instant::now(),
            Err(e) => {
                warn!("Multiclient ping error: {e}");
                let decision = escalate(
                    last_success.elapsed(),
                    config.ping_interval,
                    config.must_keepalive,
                );
                if !act(decision, "Multiclient keepalive", &*transport, &fatal_tx).await {
                    return;
                }
            }
        }
    }
}

async fn probe_loop(
    transport: Arc<dyn Transport>,
    factory: Arc<dyn ClientFactory>,
    config: LivenessConfig,
    fatal_tx: mpsc::Sender<String>,
) {
    let mut interval = ticker(config.force_ping_interval);
    let mut last_success = Instant::now();
    loop {
        interval.tick().await;
        let identifier = probe_identifier(&config.identifier);
        let probe = match factory.connect(&identifier).await {
            Ok(client) => client,
            Err(e) => {
                warn!("Force ping client {identifier} failed to connect: {e}");
                continue;
            }
        };
        tokio::time::sleep(config.settle_delay).await;

        let result = probe
            .send(transport.address(), String::new(), SendOptions::default())
            .await;
        probe.close().await;
        debug!("Force ping client {identifier} closed");

        match result {
            Ok(()) => last_success = Instant::now(),
            Err(e) => {
                warn!("Force ping error: {e}");
                let decision = escalate(
                    last_success.elapsed(),
                    config.force_ping_interval,
                    config.must_keepalive,
                );
                if !act(decision, "Force keepalive", &*transport, &fatal_tx).await {
                    return;
                }
            }
        }
    }
}

/// Carry out `decision`. Returns false once termination was requested.
async fn act(
    decision: Escalation,
    what: &str,
    transport: &dyn Transport,
    fatal_tx: &mpsc::Sender<String>,
) -> bool {
    match decision {
        Escalation::Healthy => true,
        Escalation::Reconnect => {
            info!("{what} timeout, trying to reconnect...");
            for conn in transport.connections() {
                conn.reconnect();
            }
            true
        }
        Escalation::Terminate => {
            error!("{what} lost for too long, terminating");
            let _ = fatal_tx.send(format!("{what} timeout")).await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{RecordingFactory, RecordingTransport};
    use std::sync::atomic::Ordering;

    fn fast(strict: bool) -> LivenessConfig {
        LivenessConfig {
            ping_interval: Duration::from_millis(40),
            force_ping_interval: Duration::from_secs(3600),
            settle_delay: Duration::from_millis(10),
            must_keepalive: strict,
            identifier: "dev".to_string(),
        }
    }

    #[test]
    fn test_escalation_thresholds() {
        let i = Duration::from_secs(20);
        assert_eq!(escalate(Duration::from_secs(60), i, true), Escalation::Healthy);
        assert_eq!(escalate(Duration::from_secs(61), i, false), Escalation::Reconnect);
        assert_eq!(escalate(Duration::from_secs(100), i, true), Escalation::Reconnect);
        assert_eq!(escalate(Duration::from_secs(101), i, true), Escalation::Terminate);
        assert_eq!(escalate(Duration::from_secs(500), i, false), Escalation::Reconnect);
    }

    #[test]
    fn test_probe_identifier_shape() {
        let id = probe_identifier("dev");
        let (tag, rest) = id.split_once('.').unwrap();
        assert_eq!(tag.len(), 8);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(rest, "dev");
        assert_eq!(probe_identifier("").len(), 8);
        assert_ne!(probe_identifier(""), probe_identifier(""));
    }

    #[tokio::test]
    async fn test_heartbeat_and_keepalive_when_healthy() {
        let transport = RecordingTransport::with_connections("dev.pk", 2);
        let factory = Arc::new(RecordingFactory::default());
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let handle = spawn(transport.clone(), factory, fast(true), fatal_tx);

        let sent = transport
            .wait_for(Duration::from_secs(5), |s| s.len() >= 3)
            .await;
        assert!(sent
            .iter()
            .all(|s| s.dest == "dev.pk" && s.payload.is_empty() && !s.options.no_reply));
        assert!(transport
            .conns
            .iter()
            .all(|c| c.pings.load(Ordering::SeqCst) >= 1));
        assert_eq!(transport.reconnects(), 0);
        assert!(fatal_rx.try_recv().is_err());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_ping_failures_are_only_logged() {
        let transport = RecordingTransport::with_connections("dev.pk", 2);
        for conn in &transport.conns {
            conn.fail_pings.store(true, Ordering::SeqCst);
        }
        let factory = Arc::new(RecordingFactory::default());
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let handle = spawn(transport.clone(), factory, fast(true), fatal_tx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.conns.iter().any(|c| c.pings.load(Ordering::SeqCst) < 3) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(transport.reconnects(), 0);
        assert!(fatal_rx.try_recv().is_err());
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_failing_keepalive_reconnects_without_terminating() {
        let transport = RecordingTransport::with_connections("dev.pk", 2);
        transport.fail_sends.store(true, Ordering::SeqCst);
        let factory = Arc::new(RecordingFactory::default());
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let _handle = spawn(transport.clone(), factory, fast(false), fatal_tx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.conns.iter().any(|c| c.reconnects.load(Ordering::SeqCst) == 0) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_strict_mode_terminates() {
        let transport = RecordingTransport::new("dev.pk");
        transport.fail_sends.store(true, Ordering::SeqCst);
        let factory = Arc::new(RecordingFactory::default());
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let _handle = spawn(transport.clone(), factory, fast(true), fatal_tx);

        let reason = tokio::time::timeout(Duration::from_secs(5), fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reason.contains("keepalive"));
        assert!(transport.reconnects() >= 1);
    }

    #[tokio::test]
    async fn test_forced_probe_sends_then_closes() {
        let transport = RecordingTransport::new("dev.pk");
        let factory = Arc::new(RecordingFactory::default());
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let config = LivenessConfig {
            ping_interval: Duration::from_secs(3600),
            force_ping_interval: Duration::from_millis(30),
            ..fast(true)
        };
        let handle = spawn(transport, factory.clone(), config, fatal_tx);

        let probe = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let made = factory.made.lock().unwrap().first().cloned();
                if let Some((_, client)) = made {
                    if client.closed.load(Ordering::SeqCst) {
                        return client;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown();

        let identifier = factory.made.lock().unwrap()[0].0.clone();
        assert!(identifier.ends_with(".dev"));
        let sent = probe.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dest, "dev.pk");
        assert!(sent[0].payload.is_empty());
    }

    #[tokio::test]
    async fn test_probe_connect_failure_does_not_escalate() {
        let transport = RecordingTransport::new("dev.pk");
        let factory = Arc::new(RecordingFactory::default());
        factory.fail_connect.store(true, Ordering::SeqCst);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let config = LivenessConfig {
            ping_interval: Duration::from_secs(3600),
            force_ping_interval: Duration::from_millis(20),
            ..fast(true)
        };
        let handle = spawn(transport.clone(), factory.clone(), config, fatal_tx);

        // Well past the strict threshold of five intervals.
        tokio::time::timeout(Duration::from_secs(5), async {
            while factory.attempts.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown();

        assert!(fatal_rx.try_recv().is_err());
        assert_eq!(transport.reconnects(), 0);
        assert!(factory.made.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_probe_escalates_and_still_closes() {
        let transport = RecordingTransport::new("dev.pk");
        let factory = Arc::new(RecordingFactory::default());
        factory.fail_sends.store(true, Ordering::SeqCst);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
        let config = LivenessConfig {
            ping_interval: Duration::from_secs(3600),
            force_ping_interval: Duration::from_millis(20),
            ..fast(true)
        };
        let _handle = spawn(transport.clone(), factory.clone(), config, fatal_tx);

        let reason = tokio::time::timeout(Duration::from_secs(5), fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reason.contains("Force"));
        assert!(transport.reconnects() >= 1);
        assert!(factory
            .made
            .lock()
            .unwrap()
            .iter()
            .all(|(_, c)| c.closed.load(Ordering::SeqCst)));
    }
}
