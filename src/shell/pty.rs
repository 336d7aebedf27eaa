//! PTY allocation, shell spawning, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd is kept alive for
//! the session lifetime so I/O and resize operations can be performed on it.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// Initial terminal size of a new session.
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

/// Terminal type advertised to session shells.
pub const TERM_NAME: &str = "xterm-color";

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// How to start a session shell.
#[derive(Debug, Clone, Default)]
pub struct PtySpawnOptions {
    pub working_dir: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn `shell` (no arguments) on the slave side of the PTY.
///
/// The child becomes a session leader with the PTY slave as its controlling
/// terminal, inherits the daemon's environment plus `TERM`, and runs under the
/// given uid/gid when set.
pub fn spawn_shell_pty(
    pty: &PtyPair,
    shell: &str,
    options: &PtySpawnOptions,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(shell);
    cmd.env("TERM", TERM_NAME).kill_on_drop(true);
    if let Some(dir) = &options.working_dir {
        cmd.current_dir(dir);
    }
    if let Some(gid) = options.gid {
        cmd.gid(gid);
    }
    if let Some(uid) = options.uid {
        cmd.uid(uid);
    }

    // stdio is wired to the slave in pre_exec.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let ws = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ reads a Winsize struct.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Current terminal size as `(rows, cols)`.
pub fn pty_size(master: &OwnedFd) -> Result<(u16, u16), nix::Error> {
    let mut ws = winsize(0, 0);
    // SAFETY: TIOCGWINSZ writes a Winsize struct.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCGWINSZ,
            std::ptr::addr_of_mut!(ws),
        )
    };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok((ws.ws_row, ws.ws_col))
    }
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}
