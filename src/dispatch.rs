//! Inbound message dispatch.
//!
//! Every message from the bus goes through [`Dispatcher::handle`], which runs
//! the validation gates in a fixed order and stops at the first one that
//! fails:
//!
//! 1. the payload must be flagged encrypted
//! 2. an empty payload from our own key is a keepalive echo, acknowledged and
//!    otherwise ignored
//! 3. the sender must be in the [`AuthorizationRegistry`]
//! 4. the payload must be text
//! 5. the payload must be a JSON object
//! 6. a `timestamp`, when present, must be at most 60 s old
//!
//! A rejected message gets no reply and causes no side effect. Accepted
//! requests are routed to a synchronous one-shot (reply in place), the
//! sender's interactive session, or an asynchronous one-shot whose result is
//! sent back as a separate message.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::auth::{public_key_of, AuthorizationEntry, AuthorizationRegistry};
use crate::config::Config;
use crate::protocol::{self, CommandRequest, CommandResponse, RequestKind};
use crate::sessions::SessionManager;
use crate::shell::process::{exec_command, ExecError, ExecOptions, ExecResult};
use crate::transport::{InboundMessage, PayloadType, Reply, SendOptions, Transport};
use crate::util::expand_tilde;

/// Dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Route plain async commands and resizes to per-principal sessions.
    pub session_enabled: bool,
    pub sync_timeout_ms: u64,
    /// `0` means unbounded.
    pub async_timeout_ms: u64,
    /// Include command text in logs.
    pub log_cmd: bool,
    /// Working directory for one-shot commands.
    pub working_dir: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            session_enabled: true,
            sync_timeout_ms: 5000,
            async_timeout_ms: 0,
            log_cmd: false,
            working_dir: None,
        }
    }
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_enabled: config.shell.session,
            sync_timeout_ms: config.exec.sync_timeout_ms,
            async_timeout_ms: config.exec.async_timeout_ms,
            log_cmd: config.exec.log_cmd,
            working_dir: Some(expand_tilde(&config.shell.working_dir).into_owned()),
        }
    }
}

/// Why a message was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reject {
    Unencrypted,
    Unauthorized,
    BinaryPayload,
    Malformed(String),
    Stale,
}

impl fmt::Display for Reject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reject::Unencrypted => write!(f, "unencrypted message"),
            Reject::Unauthorized => write!(f, "unauthorized sender"),
            Reject::BinaryPayload => write!(f, "wrong payload type"),
            Reject::Malformed(e) => write!(f, "malformed payload: {e}"),
            Reject::Stale => write!(f, "stale timestamp"),
        }
    }
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Answer in place with this payload.
    Reply(String),
    /// Answer in place with an empty acknowledgement.
    Ack,
    /// Accepted, but nothing to answer.
    Silent,
    /// Dropped at a validation gate.
    Rejected(Reject),
}

impl Outcome {
    /// The in-place reply this outcome calls for, if any.
    pub fn reply(self) -> Option<Reply> {
        match self {
            Outcome::Reply(payload) => Some(Reply::Payload(payload)),
            Outcome::Ack => Some(Reply::Ack),
            Outcome::Silent | Outcome::Rejected(_) => None,
        }
    }
}

/// The protocol state machine between the bus and the shell.
#[derive(Clone)]
pub struct Dispatcher {
    registry: AuthorizationRegistry,
    sessions: SessionManager,
    transport: Arc<dyn Transport>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        registry: AuthorizationRegistry,
        sessions: SessionManager,
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            sessions,
            transport,
            config,
        }
    }

    /// Handle `msg` and answer it in place when the outcome calls for it.
    pub async fn dispatch(&self, mut msg: InboundMessage) -> Outcome {
        let outcome = self.handle(&msg).await;
        if let Some(reply) = outcome.clone().reply() {
            msg.respond(reply);
        }
        outcome
    }

    pub async fn handle(&self, msg: &InboundMessage) -> Outcome {
        let (entry, request) = match self.validate(msg) {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return Outcome::Ack,
            Err(reject) => {
                info!("Received msg from {} dropped: {reject}", msg.src);
                return Outcome::Rejected(reject);
            }
        };
        self.route(&msg.src, &entry, &request).await
    }

    /// Run the validation gates. `Ok(None)` is a keepalive echo.
    fn validate(
        &self,
        msg: &InboundMessage,
    ) -> Result<Option<(AuthorizationEntry, CommandRequest)>, Reject> {
        if !msg.encrypted {
            return Err(Reject::Unencrypted);
        }

        let own_key = public_key_of(self.transport.address());
        if msg.payload.is_empty() && public_key_of(&msg.src) == own_key {
            return Ok(None);
        }

        let entry = self
            .registry
            .lookup(&msg.src)
            .ok_or(Reject::Unauthorized)?;

        if msg.payload_type != PayloadType::Text {
            return Err(Reject::BinaryPayload);
        }

        let request =
            CommandRequest::parse(&msg.payload).map_err(|e| Reject::Malformed(e.to_string()))?;

        // An unreadable timestamp has no age and passes.
        if let Some(ts) = &request.timestamp {
            match protocol::parse_timestamp(ts) {
                Some(parsed) if protocol::is_stale(parsed, Utc::now()) => {
                    return Err(Reject::Stale);
                }
                Some(_) => {}
                None => debug!("Unreadable timestamp {ts:?} from {}", msg.src),
            }
        }

        Ok(Some((entry, request)))
    }

    async fn route(
        &self,
        src: &str,
        entry: &AuthorizationEntry,
        request: &CommandRequest,
    ) -> Outcome {
        if self.config.session_enabled {
            if let Some(size) = request.resize {
                match self
                    .sessions
                    .resize(src, size.cols, size.rows, entry.uid, entry.gid)
                    .await
                {
                    Ok(()) => info!("Resize to {}x{} from {src}", size.cols, size.rows),
                    Err(e) => warn!("Resize for {src} failed: {e}"),
                }
            }
        }

        let Some(cmd) = request.command() else {
            return Outcome::Silent;
        };

        if self.config.log_cmd {
            info!("Execute cmd {cmd} from {src}");
        } else {
            info!("Execute cmd from {src}");
        }

        let kind = request.kind();

        if request.is_sync() {
            let options = self.exec_options(entry, request.timeout_or(self.config.sync_timeout_ms));
            let response = sync_response(exec_command(cmd, &options).await);
            return Outcome::Reply(response.to_json());
        }

        if self.config.session_enabled && kind == RequestKind::Plain {
            if let Err(e) = self.sessions.write(src, cmd, entry.uid, entry.gid).await {
                warn!("Session write for {src} failed: {e}");
            }
            return Outcome::Ack;
        }

        let options = self.exec_options(entry, request.timeout_or(self.config.async_timeout_ms));
        let transport = Arc::clone(&self.transport);
        let cmd = cmd.to_string();
        let dest = src.to_string();
        tokio::spawn(async move {
            let (stdout, stderr) = match exec_command(&cmd, &options).await {
                Ok(r) => (r.stdout, r.stderr),
                Err(e) => failed_output(e),
            };
            let payload = CommandResponse::for_kind(kind, stdout, stderr, Utc::now()).to_json();
            if let Err(e) = transport
                .send(&dest, payload, SendOptions::no_reply())
                .await
            {
                warn!("Send msg to {dest} error: {e}");
            }
        });
        Outcome::Ack
    }

    fn exec_options(&self, entry: &AuthorizationEntry, timeout_ms: u64) -> ExecOptions {
        ExecOptions {
            working_dir: self.config.working_dir.clone(),
            timeout_ms,
            uid: entry.uid,
            gid: entry.gid,
        }
    }
}

/// Reply for a synchronous run: stdout on success, otherwise stderr or a
/// description of the failure.
fn sync_response(result: Result<ExecResult, ExecError>) -> CommandResponse {
    match result {
        Ok(r) if r.success() => CommandResponse::stdout(r.stdout),
        Ok(r) if !r.stderr.is_empty() => CommandResponse::stderr(r.stderr),
        Ok(r) => CommandResponse::stderr(format!("Command failed with exit code {}", r.exit_code)),
        Err(e) => CommandResponse::stderr(failed_output(e).1),
    }
}

/// Output of a run that did not complete: whatever was captured, with the
/// error description standing in for an empty stderr.
fn failed_output(e: ExecError) -> (String, String) {
    let description = e.to_string();
    let (stdout, stderr) = match e {
        ExecError::Timeout { stdout, stderr, .. } => (stdout, stderr),
        ExecError::SpawnFailed(_) | ExecError::ProcessFailed(_) => (String::new(), String::new()),
    };
    if stderr.is_empty() {
        (stdout, description)
    } else {
        (stdout, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::parse;
    use crate::transport::testing::{RecordingTransport, Sent};
    use chrono::Duration as ChronoDuration;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::oneshot;

    const OWN: &str = "nshd.ownkey";
    const PEER: &str = "laptop.peerkey";

    struct Harness {
        dispatcher: Dispatcher,
        transport: Arc<RecordingTransport>,
        sessions: SessionManager,
    }

    fn harness(config: DispatcherConfig, authorized: &str) -> Harness {
        let transport = RecordingTransport::new(OWN);
        let registry = AuthorizationRegistry::new("/nonexistent/authorized");
        registry.replace(parse(authorized));
        let sessions = SessionManager::new(transport.clone(), "/bin/sh", None);
        let dispatcher = Dispatcher::new(registry, sessions.clone(), transport.clone(), config);
        Harness {
            dispatcher,
            transport,
            sessions,
        }
    }

    fn sessionless() -> DispatcherConfig {
        DispatcherConfig {
            session_enabled: false,
            ..Default::default()
        }
    }

    fn text(src: &str, payload: &Value) -> InboundMessage {
        InboundMessage::new(
            src.to_string(),
            payload.to_string().into_bytes(),
            PayloadType::Text,
            true,
        )
    }

    fn json_of(sent: &Sent) -> Value {
        serde_json::from_str(&sent.payload).unwrap()
    }

    #[tokio::test]
    async fn test_sync_exec_replies_stdout() {
        let h = harness(sessionless(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(PEER, &json!({"cmd": "echo hi", "execSync": true})))
            .await;
        assert_eq!(out, Outcome::Reply(r#"{"stdout":"hi\n"}"#.to_string()));
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_sync_failure_replies_stderr() {
        let h = harness(sessionless(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(
                PEER,
                &json!({"cmd": "echo oops >&2; exit 1", "execSync": true}),
            ))
            .await;
        assert_eq!(out, Outcome::Reply(r#"{"stderr":"oops\n"}"#.to_string()));

        let out = h
            .dispatcher
            .handle(&text(PEER, &json!({"cmd": "exit 7", "execSync": true})))
            .await;
        assert_eq!(
            out,
            Outcome::Reply(r#"{"stderr":"Command failed with exit code 7"}"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_sync_timeout_uses_request_override() {
        let h = harness(sessionless(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(
                PEER,
                &json!({"cmd": "sleep 5", "execSync": true, "execTimeout": 100}),
            ))
            .await;
        assert_eq!(
            out,
            Outcome::Reply(r#"{"stderr":"Command timed out after 100 ms"}"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_sync_runs_as_entry_uid() {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let h = harness(sessionless(), &format!("{PEER} {uid} {gid}"));
        let out = h
            .dispatcher
            .handle(&text(PEER, &json!({"cmd": "id -u", "execSync": true})))
            .await;
        assert_eq!(
            out,
            Outcome::Reply(json!({"stdout": format!("{uid}\n")}).to_string())
        );
    }

    #[tokio::test]
    async fn test_dispatch_answers_in_place() {
        let h = harness(sessionless(), "peerkey");
        let (tx, rx) = oneshot::channel();
        let msg = text(PEER, &json!({"cmd": "printf x", "execSync": true})).with_reply(tx);
        h.dispatcher.dispatch(msg).await;
        assert_eq!(rx.await.unwrap(), Reply::Payload(r#"{"stdout":"x"}"#.to_string()));

        // Dropped messages get no reply at all.
        let (tx, rx) = oneshot::channel();
        let msg = text("intruder.otherkey", &json!({"cmd": "id"})).with_reply(tx);
        h.dispatcher.dispatch(msg).await;
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_gates_in_order() {
        let h = harness(sessionless(), "peerkey");

        let mut msg = text("intruder.otherkey", &json!({"cmd": "id"}));
        msg.encrypted = false;
        assert_eq!(
            h.dispatcher.handle(&msg).await,
            Outcome::Rejected(Reject::Unencrypted)
        );

        let mut msg = text("intruder.otherkey", &json!({"cmd": "id"}));
        msg.payload_type = PayloadType::Binary;
        assert_eq!(
            h.dispatcher.handle(&msg).await,
            Outcome::Rejected(Reject::Unauthorized)
        );

        let mut msg = text(PEER, &json!({"cmd": "id"}));
        msg.payload_type = PayloadType::Binary;
        assert_eq!(
            h.dispatcher.handle(&msg).await,
            Outcome::Rejected(Reject::BinaryPayload)
        );

        let msg = InboundMessage::new(PEER.into(), b"not json".to_vec(), PayloadType::Text, true);
        assert!(matches!(
            h.dispatcher.handle(&msg).await,
            Outcome::Rejected(Reject::Malformed(_))
        ));

        let msg = text(PEER, &json!(["cmd", "id"]));
        assert!(matches!(
            h.dispatcher.handle(&msg).await,
            Outcome::Rejected(Reject::Malformed(_))
        ));

        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_keepalive_echo_is_acked() {
        let h = harness(sessionless(), "");
        let own = InboundMessage::new(OWN.into(), Vec::new(), PayloadType::Text, true);
        assert_eq!(h.dispatcher.handle(&own).await, Outcome::Ack);

        // Probe clients share the key under a throwaway identifier.
        let probe = InboundMessage::new(
            "1a2b3c4d.nshd.ownkey".into(),
            Vec::new(),
            PayloadType::Text,
            true,
        );
        assert_eq!(h.dispatcher.handle(&probe).await, Outcome::Ack);

        // A non-empty payload from ourselves still needs authorization.
        let msg = text(OWN, &json!({"cmd": "id"}));
        assert_eq!(
            h.dispatcher.handle(&msg).await,
            Outcome::Rejected(Reject::Unauthorized)
        );
    }

    #[tokio::test]
    async fn test_timestamp_window() {
        let h = harness(sessionless(), "peerkey");
        let fresh = (Utc::now() - ChronoDuration::seconds(5)).to_rfc3339();
        let out = h
            .dispatcher
            .handle(&text(
                PEER,
                &json!({"cmd": "echo ok", "execSync": true, "timestamp": fresh}),
            ))
            .await;
        assert_eq!(out, Outcome::Reply(r#"{"stdout":"ok\n"}"#.to_string()));

        let stale = (Utc::now() - ChronoDuration::seconds(120)).to_rfc3339();
        let out = h
            .dispatcher
            .handle(&text(
                PEER,
                &json!({"cmd": "touch /tmp/should-not-run", "timestamp": stale}),
            ))
            .await;
        assert_eq!(out, Outcome::Rejected(Reject::Stale));

    }

    #[tokio::test]
    async fn test_offset_less_timestamp_is_local_time() {
        let h = harness(sessionless(), "peerkey");
        let fresh = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let out = h
            .dispatcher
            .handle(&text(
                PEER,
                &json!({"cmd": "echo ok", "execSync": true, "timestamp": fresh}),
            ))
            .await;
        assert_eq!(out, Outcome::Reply(r#"{"stdout":"ok\n"}"#.to_string()));

        let old = (chrono::Local::now() - ChronoDuration::seconds(120))
            .format("%Y-%m-%dT%H:%M:%S%.3f")
            .to_string();
        let out = h
            .dispatcher
            .handle(&text(PEER, &json!({"cmd": "id", "timestamp": old})))
            .await;
        assert_eq!(out, Outcome::Rejected(Reject::Stale));
    }

    #[tokio::test]
    async fn test_unreadable_timestamp_is_not_checked() {
        let h = harness(sessionless(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(
                PEER,
                &json!({"cmd": "echo ok", "execSync": true, "timestamp": "not-a-date"}),
            ))
            .await;
        assert_eq!(out, Outcome::Reply(r#"{"stdout":"ok\n"}"#.to_string()));
    }

    #[tokio::test]
    async fn test_address_entry_matches_only_full_address() {
        let h = harness(sessionless(), "device1.abcd1234 1000 1000");
        let out = h
            .dispatcher
            .handle(&text("device2.abcd1234", &json!({"cmd": "id"})))
            .await;
        assert_eq!(out, Outcome::Rejected(Reject::Unauthorized));
    }

    #[tokio::test]
    async fn test_no_command_is_silent() {
        let h = harness(sessionless(), "peerkey");
        let out = h.dispatcher.handle(&text(PEER, &json!({}))).await;
        assert_eq!(out, Outcome::Silent);
        let out = h
            .dispatcher
            .handle(&text(PEER, &json!({"cmd": "", "execSync": true})))
            .await;
        assert_eq!(out, Outcome::Silent);
    }

    #[tokio::test]
    async fn test_resize_only_creates_session() {
        let h = harness(DispatcherConfig::default(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(PEER, &json!({"resize": {"cols": 80, "rows": 24}})))
            .await;
        assert_eq!(out, Outcome::Silent);
        let session = h.sessions.get(PEER).await.unwrap();
        assert_eq!(session.size().unwrap(), (80, 24));
        h.sessions.kill_all().await;
    }

    #[tokio::test]
    async fn test_resize_ignored_without_sessions() {
        let h = harness(sessionless(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(PEER, &json!({"resize": {"cols": 80, "rows": 24}})))
            .await;
        assert_eq!(out, Outcome::Silent);
        assert_eq!(h.sessions.count().await, 0);
    }

    #[tokio::test]
    async fn test_async_plain_sends_both_streams() {
        let h = harness(sessionless(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(PEER, &json!({"cmd": "echo async"})))
            .await;
        assert_eq!(out, Outcome::Ack);
        let sent = h
            .transport
            .wait_for(Duration::from_secs(5), |s| !s.is_empty())
            .await;
        assert_eq!(sent[0].dest, PEER);
        assert!(sent[0].options.no_reply);
        assert_eq!(json_of(&sent[0]), json!({"stdout": "async\n", "stderr": ""}));
    }

    #[tokio::test]
    async fn test_async_timeout_sends_partial_output() {
        let h = harness(sessionless(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(
                PEER,
                &json!({"cmd": "echo part; sleep 5", "execTimeout": 500}),
            ))
            .await;
        assert_eq!(out, Outcome::Ack);
        let sent = h
            .transport
            .wait_for(Duration::from_secs(5), |s| !s.is_empty())
            .await;
        assert_eq!(
            json_of(&sent[0]),
            json!({"stdout": "part\n", "stderr": "Command timed out after 500 ms"})
        );
    }

    #[tokio::test]
    async fn test_sync_timeout_replies_captured_stderr() {
        let h = harness(sessionless(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(
                PEER,
                &json!({"cmd": "echo partial >&2; sleep 5", "execSync": true, "execTimeout": 500}),
            ))
            .await;
        assert_eq!(out, Outcome::Reply(r#"{"stderr":"partial\n"}"#.to_string()));
    }

    #[tokio::test]
    async fn test_async_chat_reply() {
        // Chat requests bypass sessions even when they are enabled.
        let h = harness(DispatcherConfig::default(), "peerkey");
        let out = h
            .dispatcher
            .handle(&text(PEER, &json!({"content": "echo chat >&2"})))
            .await;
        assert_eq!(out, Outcome::Ack);
        let sent = h
            .transport
            .wait_for(Duration::from_secs(5), |s| !s.is_empty())
            .await;
        let v = json_of(&sent[0]);
        assert_eq!(v["content"], "```\nchat\n\n```");
        assert_eq!(v["contentType"], "text");
        assert_eq!(v["isPrivate"], true);
        assert!(v["timestamp"].as_str().unwrap().ends_with(" GMT"));
        assert_eq!(h.sessions.count().await, 0);
    }

    #[tokio::test]
    async fn test_async_plain_goes_to_session() {
        let h = harness(DispatcherConfig::default(), "peerkey");
        for cmd in ["N=6\n", "echo S$((N*7))S\n"] {
            let out = h.dispatcher.handle(&text(PEER, &json!({"cmd": cmd}))).await;
            assert_eq!(out, Outcome::Ack);
        }
        h.transport
            .wait_for(Duration::from_secs(10), |s| {
                s.iter()
                    .filter_map(|m| json_of(m)["stdout"].as_str().map(str::to_string))
                    .collect::<String>()
                    .contains("S42S")
            })
            .await;
        assert_eq!(h.sessions.count().await, 1);
        h.sessions.kill_all().await;
    }

    #[test]
    fn test_outcome_reply_mapping() {
        assert_eq!(Outcome::Ack.reply(), Some(Reply::Ack));
        assert_eq!(
            Outcome::Reply("x".into()).reply(),
            Some(Reply::Payload("x".into()))
        );
        assert_eq!(Outcome::Silent.reply(), None);
        assert_eq!(Outcome::Rejected(Reject::Stale).reply(), None);
    }
}
