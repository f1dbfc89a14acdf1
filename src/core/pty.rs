//! Pseudoterminal wrapper for Unix
//!
//! This module provides a safe RAII wrapper around a `forkpty` pair: the
//! master side of the PTY and the shell process attached to its subordinate
//! side. Dropping a [`Pty`] kills and reaps a child that is still around and
//! closes the master descriptor.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{tcgetattr, Termios};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{access, AccessFlags, Pid};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Exit status of a child whose shell could not be executed.
pub const EXEC_FAILED_STATUS: i32 = 127;

/// How often `terminate` re-checks the child during the grace period.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

nix::ioctl_write_ptr_bad!(set_winsize, libc::TIOCSWINSZ, Winsize);
nix::ioctl_read_bad!(get_winsize, libc::TIOCGWINSZ, Winsize);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("No shell candidates configured")]
    NoShell,

    #[error("Invalid shell path: {0:?}")]
    InvalidShell(String),

    #[error("Failed to allocate PTY: {0}")]
    Allocation(#[source] Errno),

    #[error("Failed to configure descriptor: {0}")]
    Configure(#[source] Errno),

    #[error("Failed to create pipe: {0}")]
    Pipe(#[source] Errno),

    #[error("Failed to set window size: {0}")]
    WindowSize(#[source] Errno),

    #[error("Failed to send {signal:?} to pid {pid}: {source}")]
    Signal {
        signal: Signal,
        pid: i32,
        #[source]
        source: Errno,
    },

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(#[source] Errno),

    #[error("Failed to read from PTY: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to spawn {name} thread: {source}")]
    Thread {
        name: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// How a shell process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Exited normally with the given status.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Reaped by someone else; the status is not available.
    Unknown,
}

impl ChildExit {
    fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ChildExit::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ChildExit::Signaled(signal)),
            _ => None,
        }
    }

    /// Exit code if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            ChildExit::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// Shell candidates prepared before `fork`, first entry tried first.
struct ShellCandidates {
    paths: Vec<CString>,
    display: String,
}

impl ShellCandidates {
    /// Order the configured shells so the first executable one leads.
    ///
    /// When none of them is executable the original order is kept; the child
    /// will then fail every `execv` and exit with [`EXEC_FAILED_STATUS`].
    fn select(shells: &[String]) -> Result<Self> {
        if shells.is_empty() {
            return Err(PtyError::NoShell);
        }

        let mut paths = shells
            .iter()
            .map(|s| CString::new(s.as_str()).map_err(|_| PtyError::InvalidShell(s.clone())))
            .collect::<Result<Vec<_>>>()?;

        if let Some(index) = paths
            .iter()
            .position(|p| access(p.as_c_str(), AccessFlags::X_OK).is_ok())
        {
            let chosen = paths.remove(index);
            paths.insert(0, chosen);
        }

        let display = paths[0].to_string_lossy().into_owned();
        Ok(Self { paths, display })
    }
}

/// Switch a descriptor to non-blocking mode and mark it close-on-exec.
pub(crate) fn set_nonblocking_cloexec(fd: RawFd) -> std::result::Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

/// Terminal settings of the controlling process, when stdin is a terminal.
fn inherited_termios() -> Option<Termios> {
    tcgetattr(io::stdin()).ok()
}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// PTY master plus the shell process attached to it
pub struct Pty {
    master: File,
    child: Pid,
    shell: String,
    exit: Mutex<Option<ChildExit>>,
}

impl Pty {
    /// Fork a shell attached to a new PTY of the given size.
    ///
    /// `shells` is an ordered list of absolute paths. The first executable
    /// entry is exec'd; the others are fallbacks. The master descriptor is
    /// returned in non-blocking, close-on-exec mode.
    pub fn spawn(shells: &[String], cols: u16, rows: u16) -> Result<Self> {
        let candidates = ShellCandidates::select(shells)?;

        // No allocation between fork and exec: argv arrays are built up front.
        let argvs: Vec<[*const libc::c_char; 2]> = candidates
            .paths
            .iter()
            .map(|p| [p.as_ptr(), std::ptr::null()])
            .collect();

        let termios = inherited_termios();
        let ws = winsize(cols, rows);

        // SAFETY: the child only calls execv and _exit, both async-signal-safe,
        // on data prepared before the fork.
        let result = unsafe { forkpty(&ws, termios.as_ref()) }.map_err(PtyError::Allocation)?;

        match result {
            ForkptyResult::Child => {
                for (path, argv) in candidates.paths.iter().zip(&argvs) {
                    // SAFETY: path and argv are NUL-terminated and outlive the call.
                    unsafe { libc::execv(path.as_ptr(), argv.as_ptr()) };
                }
                // SAFETY: leaving the forked child without running parent destructors.
                unsafe { libc::_exit(EXEC_FAILED_STATUS) }
            }
            ForkptyResult::Parent { child, master } => {
                let pty = Pty {
                    master: File::from(master),
                    child,
                    shell: candidates.display,
                    exit: Mutex::new(None),
                };
                set_nonblocking_cloexec(pty.master.as_raw_fd()).map_err(PtyError::Configure)?;
                info!(pid = %child, shell = %pty.shell, cols, rows, "spawned PTY shell");
                Ok(pty)
            }
        }
    }

    /// Child process id
    pub fn pid(&self) -> Pid {
        self.child
    }

    /// Path of the shell that was exec'd first
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Borrow the master descriptor, e.g. for `poll`
    pub fn master_fd(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    /// Read bytes from the master (shell output). Non-blocking.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.master).read(buf)
    }

    /// Write bytes to the master (shell input). Non-blocking.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        (&self.master).write(data)
    }

    /// Push a new terminal size to the PTY
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let ws = winsize(cols, rows);
        // SAFETY: ws is a valid winsize for the duration of the call.
        unsafe { set_winsize(self.master.as_raw_fd(), &ws) }.map_err(PtyError::WindowSize)?;
        Ok(())
    }

    /// Query the PTY's current terminal size as (cols, rows)
    pub fn window_size(&self) -> Result<(u16, u16)> {
        let mut ws = winsize(0, 0);
        // SAFETY: ws is a valid, writable winsize.
        unsafe { get_winsize(self.master.as_raw_fd(), &mut ws) }.map_err(PtyError::WindowSize)?;
        Ok((ws.ws_col, ws.ws_row))
    }

    /// Send a signal to the shell. A reaped child is never signalled.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.exit_status().is_some() {
            return Ok(());
        }
        kill(self.child, signal).map_err(|source| PtyError::Signal {
            signal,
            pid: self.child.as_raw(),
            source,
        })
    }

    /// Cached exit status, without touching the process
    pub fn exit_status(&self) -> Option<ChildExit> {
        *self.lock_exit()
    }

    /// Reap the child if it has exited, without blocking
    pub fn try_wait(&self) -> Option<ChildExit> {
        let mut exit = self.lock_exit();
        if exit.is_none() {
            match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => *exit = ChildExit::from_wait_status(status),
                Err(Errno::ECHILD) => *exit = Some(ChildExit::Unknown),
                Err(Errno::EINTR) => {}
                Err(e) => debug!(pid = %self.child, "waitpid failed: {}", e),
            }
            if let Some(status) = *exit {
                debug!(pid = %self.child, ?status, "shell exited");
            }
        }
        *exit
    }

    /// Check if the shell process is still alive
    pub fn is_alive(&self) -> bool {
        self.try_wait().is_none()
    }

    /// Stop the shell: SIGTERM, wait up to `grace`, then SIGKILL. Always reaps.
    pub fn terminate(&self, grace: Duration) -> Option<ChildExit> {
        if let Some(exit) = self.try_wait() {
            return Some(exit);
        }

        if let Err(e) = self.signal(Signal::SIGTERM) {
            debug!("{}", e);
        }

        let deadline = Instant::now() + grace;
        loop {
            if let Some(exit) = self.try_wait() {
                return Some(exit);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(REAP_POLL_INTERVAL.min(deadline - now));
        }

        debug!(pid = %self.child, "shell ignored SIGTERM, sending SIGKILL");
        if let Err(e) = self.signal(Signal::SIGKILL) {
            warn!("{}", e);
        }
        self.wait()
    }

    /// Block until the child is reaped
    fn wait(&self) -> Option<ChildExit> {
        let mut exit = self.lock_exit();
        while exit.is_none() {
            match waitpid(self.child, None) {
                Ok(status) => *exit = ChildExit::from_wait_status(status),
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => *exit = Some(ChildExit::Unknown),
                Err(e) => {
                    warn!(pid = %self.child, "waitpid failed: {}", e);
                    break;
                }
            }
        }
        *exit
    }

    fn lock_exit(&self) -> MutexGuard<'_, Option<ChildExit>> {
        self.exit.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        if self.try_wait().is_none() {
            warn!(pid = %self.child, "PTY dropped with live shell, killing it");
            if let Err(e) = kill(self.child, Signal::SIGKILL) {
                debug!(pid = %self.child, "SIGKILL on drop failed: {}", e);
            }
            self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> Vec<String> {
        vec!["/bin/sh".to_string()]
    }

    /// Poll the non-blocking master until `needle` shows up or time runs out.
    fn read_until(pty: &Pty, needle: &str, timeout: Duration) -> String {
        let mut output = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match pty.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    output.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    fn wait_for_exit(pty: &Pty, timeout: Duration) -> Option<ChildExit> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(exit) = pty.try_wait() {
                return Some(exit);
            }
            thread::sleep(Duration::from_millis(20));
        }
        None
    }

    #[test]
    fn test_spawn_pty() {
        let pty = Pty::spawn(&sh(), 80, 24);
        assert!(pty.is_ok(), "Failed to spawn PTY: {:?}", pty.err());
        let pty = pty.unwrap();
        assert!(pty.is_alive());
        assert!(pty.pid().as_raw() > 0);
        assert_eq!(pty.shell(), "/bin/sh");
    }

    #[test]
    fn test_master_is_nonblocking() {
        let pty = Pty::spawn(&sh(), 80, 24).unwrap();
        let flags = OFlag::from_bits_truncate(
            fcntl(pty.master_fd().as_raw_fd(), FcntlArg::F_GETFL).unwrap(),
        );
        assert!(flags.contains(OFlag::O_NONBLOCK));
    }

    #[test]
    fn test_write_read_echo() {
        let pty = Pty::spawn(&sh(), 80, 24).unwrap();
        pty.write(b"echo PTY_$((20+22))\n").unwrap();

        let text = read_until(&pty, "PTY_42", Duration::from_secs(3));
        assert!(text.contains("PTY_42"), "Expected PTY_42 in output, got: {text}");
    }

    #[test]
    fn test_resize() {
        let pty = Pty::spawn(&sh(), 80, 24).unwrap();
        assert_eq!(pty.window_size().unwrap(), (80, 24));

        pty.resize(120, 40).unwrap();
        assert_eq!(pty.window_size().unwrap(), (120, 40));
    }

    #[test]
    fn test_child_exit_code() {
        let pty = Pty::spawn(&sh(), 80, 24).unwrap();
        pty.write(b"exit 3\n").unwrap();

        let exit = wait_for_exit(&pty, Duration::from_secs(3));
        assert_eq!(exit, Some(ChildExit::Exited(3)));
        assert_eq!(exit.and_then(|e| e.code()), Some(3));
        assert!(!pty.is_alive());
    }

    #[test]
    fn test_terminate_reaps_child() {
        let pty = Pty::spawn(&sh(), 80, 24).unwrap();
        let started = Instant::now();

        let exit = pty.terminate(Duration::from_millis(200));
        assert!(matches!(exit, Some(ChildExit::Signaled(_))), "got {exit:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!pty.is_alive());

        // Terminating again only returns the cached status.
        assert_eq!(pty.terminate(Duration::from_millis(200)), exit);
    }

    #[test]
    fn test_exec_failure_exits_127() {
        let shells = vec!["/nonexistent/ptyshell-test-shell".to_string()];
        let pty = Pty::spawn(&shells, 80, 24).unwrap();

        let exit = wait_for_exit(&pty, Duration::from_secs(3));
        assert_eq!(exit, Some(ChildExit::Exited(EXEC_FAILED_STATUS)));
    }

    #[test]
    fn test_shell_fallback_order() {
        let shells = vec![
            "/nonexistent/ptyshell-test-shell".to_string(),
            "/bin/sh".to_string(),
        ];
        let candidates = ShellCandidates::select(&shells).unwrap();
        assert_eq!(candidates.display, "/bin/sh");
        assert_eq!(candidates.paths.len(), 2);
    }

    #[test]
    fn test_invalid_shell_lists() {
        assert!(matches!(Pty::spawn(&[], 80, 24), Err(PtyError::NoShell)));

        let shells = vec!["/bin/\0sh".to_string()];
        assert!(matches!(
            Pty::spawn(&shells, 80, 24),
            Err(PtyError::InvalidShell(_))
        ));
    }

    #[test]
    fn test_signal_after_reap_is_noop() {
        let pty = Pty::spawn(&sh(), 80, 24).unwrap();
        pty.terminate(Duration::from_millis(50));
        assert!(pty.signal(Signal::SIGWINCH).is_ok());
    }

    #[test]
    fn test_drop_kills_live_child() {
        let pty = Pty::spawn(&sh(), 80, 24).unwrap();
        let pid = pty.pid();
        assert!(pty.is_alive());

        drop(pty);
        assert_eq!(kill(pid, None), Err(Errno::ESRCH), "child must be reaped");
    }

    #[test]
    fn test_drop_after_exit_is_quiet() {
        let pty = Pty::spawn(&sh(), 80, 24).unwrap();
        pty.write(b"exit 0\n").unwrap();
        assert_eq!(wait_for_exit(&pty, Duration::from_secs(3)), Some(ChildExit::Exited(0)));
        drop(pty);
    }
}
