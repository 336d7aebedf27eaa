//! Per-principal interactive session table.
//!
//! [`SessionManager`] is the single authority for creating, accessing, and
//! destroying shell sessions. There is at most one live [`Session`] per remote
//! principal; it is created lazily on the principal's first interactive
//! command or resize, and removed the moment its shell exits.
//!
//! ## Concurrency
//!
//! The table is behind an `RwLock`. `get_or_create` holds the write lock
//! across the lookup and insert so two concurrent requests from one principal
//! cannot both spawn a shell. Each session gets a reaper task that removes
//! the entry when the shell exits, but only if the entry still holds that
//! same session (by id).

pub mod buffer;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::shell::pty::PtySpawnOptions;
use crate::transport::Transport;
pub use session::Session;

/// How long `kill_all` waits after SIGHUP before SIGKILL.
const SHUTDOWN_GRACE: tokio::time::Duration = tokio::time::Duration::from_secs(3);

/// Owns every interactive session. Cloneable; clones share the table.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    transport: Arc<dyn Transport>,
    shell: String,
    working_dir: Option<String>,
}

impl SessionManager {
    /// `shell` is spawned without arguments in `working_dir` (inherited when
    /// `None`); session output is sent over `transport`.
    pub fn new(transport: Arc<dyn Transport>, shell: &str, working_dir: Option<String>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            transport,
            shell: shell.to_string(),
            working_dir,
        }
    }

    /// The principal's live session, spawning one (as `uid`/`gid` when set)
    /// if there is none.
    pub async fn get_or_create(
        &self,
        principal: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<Arc<Session>, String> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(principal) {
            if !existing.has_exited() {
                return Ok(Arc::clone(existing));
            }
        }

        let options = PtySpawnOptions {
            working_dir: self.working_dir.clone(),
            uid,
            gid,
        };
        let session = Arc::new(Session::spawn(
            principal,
            &self.shell,
            &options,
            Arc::clone(&self.transport),
        )?);
        sessions.insert(principal.to_string(), Arc::clone(&session));
        info!(
            "Session {} created for {principal} (pid {}), total: {}",
            session.id,
            session.pid,
            sessions.len()
        );
        drop(sessions);

        self.spawn_reaper(&session);
        Ok(session)
    }

    fn spawn_reaper(&self, session: &Arc<Session>) {
        let table = Arc::clone(&self.sessions);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let code = session.wait_exit().await;
            let mut sessions = table.write().await;
            if sessions
                .get(&session.principal)
                .is_some_and(|s| s.id == session.id)
            {
                sessions.remove(&session.principal);
                let remaining = sessions.len();
                drop(sessions);
                info!(
                    "Session {} for {} closed (exit {code:?}, {} bytes out), remaining: {remaining}",
                    session.id,
                    session.principal,
                    session.output_bytes().await
                );
            }
        });
    }

    /// Write `text` verbatim into the principal's session, creating it first
    /// if needed.
    pub async fn write(
        &self,
        principal: &str,
        text: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), String> {
        self.get_or_create(principal, uid, gid)
            .await?
            .write(text)
            .await
    }

    /// Resize the principal's terminal, creating the session first if needed.
    pub async fn resize(
        &self,
        principal: &str,
        cols: u16,
        rows: u16,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> Result<(), String> {
        self.get_or_create(principal, uid, gid)
            .await?
            .resize(cols, rows)
    }

    /// The principal's session, if one is in the table.
    pub async fn get(&self, principal: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(principal).cloned()
    }

    pub async fn contains(&self, principal: &str) -> bool {
        self.sessions.read().await.contains_key(principal)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Terminate every session (used during shutdown).
    ///
    /// Hangs up every terminal at once (SIGHUP to each process group), waits
    /// up to 3 s, then SIGKILLs the rest.
    pub async fn kill_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        if count == 0 {
            return;
        }

        for session in &drained {
            #[allow(clippy::cast_possible_wrap)]
            let pgid = session.pid as i32;
            if pgid > 0 {
                unsafe {
                    libc::kill(-pgid, libc::SIGHUP);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !drained.iter().all(|s| s.has_exited())
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        }

        for session in drained {
            session.kill();
        }
        info!("Shut down {count} session(s)");
    }
}
