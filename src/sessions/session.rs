//! One interactive shell bound to a remote principal.
//!
//! A [`Session`] owns a shell running on a PTY and four background tasks:
//!
//! - **stdin writer**: mpsc → PTY master
//! - **output reader**: PTY master → [`OutputBuffer`]
//! - **exit watcher**: waits on the child, marks the session exited
//! - **flush loop**: drains the buffer to the principal as `{"stdout": ...}`
//!
//! The flush loop sends every [`FLUSH_INTERVAL_BUSY`] while output keeps
//! coming and polls every [`FLUSH_INTERVAL_IDLE`] otherwise. After the shell
//! exits it keeps going until the reader has hit EOF (or [`EXIT_DRAIN_GRACE`]
//! passed) and the buffer is empty, so trailing output is still delivered.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::buffer::OutputBuffer;
use crate::protocol::CommandResponse;
use crate::shell::pty::{self, PtySpawnOptions};
use crate::transport::{SendOptions, Transport};

/// Delay between flushes while the buffer had data.
pub const FLUSH_INTERVAL_BUSY: Duration = Duration::from_millis(10);
/// Delay between flushes while the buffer was empty.
pub const FLUSH_INTERVAL_IDLE: Duration = Duration::from_millis(25);
/// How long after exit the flush loop waits for the reader to reach EOF.
pub const EXIT_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// A running (or just exited) PTY shell session.
pub struct Session {
    /// Unique per spawn; distinguishes a replacement session under the same
    /// principal from the one it replaced.
    pub id: String,
    /// Remote principal the session belongs to and output is sent to.
    pub principal: String,
    /// OS process ID of the shell (also its process group and session ID).
    pub pid: u32,
    buffer: Arc<Mutex<OutputBuffer>>,
    exited: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<i32>>,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
    pty_master: OwnedFd,
}

impl Session {
    /// Spawn `shell` on a fresh 120x30 PTY and start streaming its output to
    /// `principal` over `transport`.
    pub fn spawn(
        principal: &str,
        shell: &str,
        options: &PtySpawnOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, String> {
        let pair = pty::allocate_pty(pty::DEFAULT_ROWS, pty::DEFAULT_COLS)
            .map_err(|e| format!("PTY allocation failed: {e}"))?;
        let mut child = pty::spawn_shell_pty(&pair, shell, options)
            .map_err(|e| format!("Failed to spawn {shell}: {e}"))?;
        let pty::PtyPair { master, slave } = pair;
        // Only the child keeps the slave open, so the reader sees EOF on exit.
        drop(slave);

        let pid = child.id().unwrap_or(0);
        let id = uuid::Uuid::new_v4().to_string();

        let master_raw: RawFd = master.as_raw_fd();
        let (master_write, master_read) = dup_pair(master_raw)?;

        let buffer = Arc::new(Mutex::new(OutputBuffer::new()));
        let exited = Arc::new(AtomicBool::new(false));
        let reader_done = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(None);

        // stdin writer task: mpsc → PTY master (write side)
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_task = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = stdin_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Output reader task: PTY master (read side) → buffer
        let sid_out = id.clone();
        let buf_out = Arc::clone(&buffer);
        let done_out = Arc::clone(&reader_done);
        let output_task = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    // EIO once the last slave fd closes.
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf_out.lock().await.push(&tmp[..n]),
                }
            }
            done_out.store(true, Ordering::SeqCst);
            debug!("Session {sid_out} PTY output closed");
        });

        // Exit watcher task
        let sid_exit = id.clone();
        let exited_exit = Arc::clone(&exited);
        let exit_task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(s) => {
                    let code = s.code().unwrap_or(-1);
                    info!("Session {sid_exit} exited with code {code}");
                    code
                }
                Err(e) => {
                    error!("Session {sid_exit} wait error: {e}");
                    -1
                }
            };
            exited_exit.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(Some(code));
        });

        let flush_task = tokio::spawn(flush_loop(
            principal.to_string(),
            transport,
            Arc::clone(&buffer),
            Arc::clone(&exited),
            reader_done,
        ));

        Ok(Session {
            id,
            principal: principal.to_string(),
            pid,
            buffer,
            exited,
            exit_rx,
            stdin_tx,
            tasks: vec![stdin_task, output_task, exit_task, flush_task],
            pty_master: master,
        })
    }

    /// Forward `text` verbatim to the shell's input.
    pub async fn write(&self, text: &str) -> Result<(), String> {
        if self.has_exited() {
            return Err("Session has exited".to_string());
        }
        self.stdin_tx
            .send(text.as_bytes().to_vec())
            .await
            .map_err(|_| "Session stdin closed".to_string())
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), String> {
        pty::resize_pty(&self.pty_master, rows, cols).map_err(|e| e.to_string())
    }

    /// Current terminal size as `(cols, rows)`.
    pub fn size(&self) -> Result<(u16, u16), String> {
        pty::pty_size(&self.pty_master)
            .map(|(rows, cols)| (cols, rows))
            .map_err(|e| e.to_string())
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Resolves with the exit code once the shell exits, or `None` if the
    /// session was killed before the exit could be observed.
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        let code = *rx.wait_for(Option::is_some).await.ok()?;
        code
    }

    /// Total bytes of output produced so far.
    pub async fn output_bytes(&self) -> u64 {
        self.buffer.lock().await.total()
    }

    /// SIGKILL the shell's process group and stop every background task.
    pub fn kill(&self) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
        self.exited.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Two independent async handles on the PTY master: (writer, reader).
fn dup_pair(master_raw: RawFd) -> Result<(tokio::fs::File, tokio::fs::File), String> {
    let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
    if writer_fd < 0 {
        return Err(format!(
            "dup() failed for PTY master writer: {}",
            std::io::Error::last_os_error()
        ));
    }
    // SAFETY: writer_fd was just dup'd and is owned by nothing else.
    let writer = unsafe { std::fs::File::from_raw_fd(writer_fd) };
    let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
    if reader_fd < 0 {
        return Err(format!(
            "dup() failed for PTY master reader: {}",
            std::io::Error::last_os_error()
        ));
    }
    // SAFETY: as above.
    let reader = unsafe { std::fs::File::from_raw_fd(reader_fd) };
    Ok((
        tokio::fs::File::from_std(writer),
        tokio::fs::File::from_std(reader),
    ))
}

async fn flush_loop(
    principal: String,
    transport: Arc<dyn Transport>,
    buffer: Arc<Mutex<OutputBuffer>>,
    exited: Arc<AtomicBool>,
    reader_done: Arc<AtomicBool>,
) {
    let mut exit_seen: Option<tokio::time::Instant> = None;
    loop {
        // Read the flags before draining so a finished reader's last chunk is
        // part of this take.
        let finished = exited.load(Ordering::SeqCst) && {
            let since = *exit_seen.get_or_insert_with(tokio::time::Instant::now);
            reader_done.load(Ordering::SeqCst) || since.elapsed() >= EXIT_DRAIN_GRACE
        };

        let chunk = buffer.lock().await.take_text(finished);
        if !chunk.is_empty() {
            let payload = CommandResponse::stdout(chunk).to_json();
            if let Err(e) = transport
                .send(&principal, payload, SendOptions::no_reply())
                .await
            {
                warn!("Send session output to {principal} failed: {e}");
            }
            tokio::time::sleep(FLUSH_INTERVAL_BUSY).await;
            continue;
        }
        if finished {
            break;
        }
        tokio::time::sleep(FLUSH_INTERVAL_IDLE).await;
    }
    debug!("Session flush loop for {principal} stopped");
}
