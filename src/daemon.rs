//! Daemon wiring: registry, relay client, sessions, dispatcher, liveness.
//!
//! Inbound messages are handled one at a time in arrival order. A synchronous
//! exec therefore holds up later messages until it finishes or times out;
//! asynchronous work runs in its own tasks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::auth::AuthorizationRegistry;
use crate::config::Config;
use crate::dispatch::{Dispatcher, DispatcherConfig};
use crate::identity::Identity;
use crate::liveness::{self, LivenessConfig};
use crate::sessions::SessionManager;
use crate::transport::relay::{RelayClient, RelayClientFactory, RelayConfig};
use crate::transport::{InboundMessage, Transport};
use crate::util::expand_tilde;

/// How often the authorized file is checked for changes.
const AUTHORIZED_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long to wait for the first relay before logging a reminder.
const CONNECT_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum DaemonError {
    Authorized(String, std::io::Error),
    NoRelays,
    /// Strict keepalive gave up on the network.
    Liveness(String),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Authorized(path, e) => {
                write!(f, "Failed to open authorized file {path}: {e}")
            }
            DaemonError::NoRelays => write!(f, "No relay configured (use --relay or NSHD_RELAYS)"),
            DaemonError::Liveness(reason) => write!(f, "Network liveness lost: {reason}"),
        }
    }
}

impl std::error::Error for DaemonError {}

/// Run until SIGINT/SIGTERM (`Ok`) or until strict keepalive gives up (`Err`).
pub async fn run(config: Config, identity: Identity) -> Result<(), DaemonError> {
    let authorized_path = config.authorized_path();
    let registry = AuthorizationRegistry::open(&authorized_path)
        .map_err(|e| DaemonError::Authorized(authorized_path.clone(), e))?;
    info!(
        "Loaded {} authorized entries from {authorized_path}",
        registry.snapshot().len()
    );
    let watcher = registry.watch(AUTHORIZED_POLL_INTERVAL);

    if config.transport.relays.is_empty() {
        watcher.abort();
        return Err(DaemonError::NoRelays);
    }

    let address = identity.address(&config.daemon.identifier);
    let relay_config = RelayConfig::from_config(&config.transport);
    let (client, mut inbound) = RelayClient::start(relay_config.clone(), address.clone());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            r = client.wait_connected(CONNECT_WAIT) => match r {
                Ok(()) => break,
                Err(e) => warn!("Still waiting for a relay connection: {e}"),
            },
            () = &mut shutdown => {
                watcher.abort();
                client.close().await;
                return Ok(());
            }
        }
    }
    info!(
        "Listening at {address} ({} relay(s) connected)",
        client.live_connections()
    );

    let transport: Arc<dyn Transport> = client.clone();
    let working_dir = Some(expand_tilde(&config.shell.working_dir).into_owned());
    let sessions = SessionManager::new(Arc::clone(&transport), &config.shell.shell, working_dir);
    let dispatcher = Dispatcher::new(
        registry,
        sessions.clone(),
        Arc::clone(&transport),
        DispatcherConfig::from_config(&config),
    );

    let factory = Arc::new(RelayClientFactory::new(
        relay_config,
        identity.public_key().to_string(),
    ));
    let (fatal_tx, mut fatal_rx) = mpsc::channel(1);
    let liveness = liveness::spawn(
        Arc::clone(&transport),
        factory,
        LivenessConfig::from_config(&config),
        fatal_tx,
    );

    let result = serve(&dispatcher, &mut inbound, &mut fatal_rx, shutdown).await;

    info!("Shutting down...");
    liveness.shutdown();
    watcher.abort();
    sessions.kill_all().await;
    client.close().await;
    result
}

/// Dispatch inbound messages until `shutdown` resolves, the inbound queue
/// closes, or a fatal liveness report arrives.
pub async fn serve(
    dispatcher: &Dispatcher,
    inbound: &mut mpsc::Receiver<InboundMessage>,
    fatal_rx: &mut mpsc::Receiver<String>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), DaemonError> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            msg = inbound.recv() => match msg {
                Some(msg) => {
                    dispatcher.dispatch(msg).await;
                }
                None => {
                    warn!("Inbound message queue closed");
                    return Ok(());
                }
            },
            Some(reason) = fatal_rx.recv() => {
                error!("Exiting: {reason}");
                return Err(DaemonError::Liveness(reason));
            }
            () = &mut shutdown => return Ok(()),
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {e}");
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    }
}
