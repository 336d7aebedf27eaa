//! One-shot command execution and output capture.
//!
//! Commands run as `/bin/sh -c "<command>"` with `kill_on_drop(true)`, so a
//! command that outlives its timeout (or whose owning task is cancelled) is
//! killed rather than orphaned.

use std::fmt::Write;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Shell used for one-shot commands.
const EXEC_SHELL: &str = "/bin/sh";

/// Max output size per stream for [`exec_command`] (1 MB).
///
/// Output beyond this limit is still drained from the pipe but discarded. A
/// truncation notice is appended to the returned string.
const MAX_EXEC_OUTPUT: usize = 1024 * 1024;

/// How to run a one-shot command.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory; inherited from the daemon when `None`.
    pub working_dir: Option<String>,
    /// Wall-clock limit in milliseconds. `0` means unbounded.
    pub timeout_ms: u64,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Execute a one-shot command and capture its output.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock) and each
/// capped at [`MAX_EXEC_OUTPUT`] bytes. A non-zero exit status is not an
/// error here; callers inspect [`ExecResult::exit_code`].
pub async fn exec_command(command: &str, options: &ExecOptions) -> Result<ExecResult, ExecError> {
    let start = std::time::Instant::now();

    let mut cmd = Command::new(EXEC_SHELL);
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &options.working_dir {
        cmd.current_dir(dir);
    }
    if let Some(gid) = options.gid {
        cmd.gid(gid);
    }
    if let Some(uid) = options.uid {
        cmd.uid(uid);
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::SpawnFailed(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::ProcessFailed("Failed to take stderr pipe".to_string()))?;

    let mut out = Capture::default();
    let mut err = Capture::default();
    let run = async {
        tokio::join!(
            read_capped(&mut stdout, &mut out, MAX_EXEC_OUTPUT),
            read_capped(&mut stderr, &mut err, MAX_EXEC_OUTPUT),
        );
        child
            .wait()
            .await
            .map_err(|e| ExecError::ProcessFailed(e.to_string()))
    };

    let finished = if options.timeout_ms == 0 {
        Some(run.await)
    } else {
        let timeout = tokio::time::Duration::from_millis(options.timeout_ms);
        let timed = Box::pin(tokio::time::timeout(timeout, run)).await;
        timed.ok()
    };
    let Some(status) = finished else {
        return Err(ExecError::Timeout {
            timeout_ms: options.timeout_ms,
            stdout: out.into_string(MAX_EXEC_OUTPUT),
            stderr: err.into_string(MAX_EXEC_OUTPUT),
        });
    };
    let status = status?;

    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = start.elapsed().as_millis() as u64;

    Ok(ExecResult {
        exit_code: status.code().unwrap_or(-1),
        stdout: out.into_string(MAX_EXEC_OUTPUT),
        stderr: err.into_string(MAX_EXEC_OUTPUT),
        duration_ms,
    })
}

/// Output collected from one stream so far.
#[derive(Default)]
struct Capture {
    buf: Vec<u8>,
    total_read: usize,
}

impl Capture {
    fn into_string(self, max_bytes: usize) -> String {
        let mut s = String::from_utf8_lossy(&self.buf).into_owned();
        if self.total_read > max_bytes {
            let _ = write!(
                s,
                "\n[truncated: {} bytes total, showing first {max_bytes}]",
                self.total_read
            );
        }
        s
    }
}

/// Read from an async reader into `capture`, keeping the first `max_bytes` and
/// discarding the rest. Keeps reading past the cap so the child never blocks
/// on a full pipe. What was read stays in `capture` if this future is dropped.
async fn read_capped(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    capture: &mut Capture,
    max_bytes: usize,
) {
    let mut tmp = [0u8; 8192];
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                capture.total_read += n;
                if capture.buf.len() < max_bytes {
                    let take = n.min(max_bytes - capture.buf.len());
                    capture.buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
}

/// Completed run of [`exec_command`].
#[derive(Debug)]
pub struct ExecResult {
    /// Process exit code, or `-1` if killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Errors that can occur during [`exec_command`].
#[derive(Debug)]
pub enum ExecError {
    /// The shell could not be started (bad working dir, permission denied, ...).
    SpawnFailed(String),
    /// The child started but `wait()` failed.
    ProcessFailed(String),
    /// The command exceeded its timeout and was killed. Carries the output
    /// captured up to that point.
    Timeout {
        timeout_ms: u64,
        stdout: String,
        stderr: String,
    },
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::SpawnFailed(e) => write!(f, "Failed to spawn process: {e}"),
            ExecError::ProcessFailed(e) => write!(f, "Process error: {e}"),
            ExecError::Timeout { timeout_ms, .. } => {
                write!(f, "Command timed out after {timeout_ms} ms")
            }
        }
    }
}

impl std::error::Error for ExecError {}
