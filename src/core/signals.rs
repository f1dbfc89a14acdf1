//! Signal forwarding
//!
//! While a session runs, SIGINT, SIGTERM and SIGHUP sent to this process are
//! caught by a handler that writes the signal number into a self-pipe. The
//! session's forwarder thread polls that pipe together with the session's
//! shutdown event and relays each signal to the shell.
//!
//! Handlers are shared: the first [`SignalRelay`] installs them, the last one
//! dropped restores the dispositions that were in place before. Only one
//! relay receives signals at a time, the most recently installed one still
//! alive.

use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::errno::Errno;
use nix::libc;
use nix::poll::PollFlags;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, info, warn};

use super::event::{nonblocking_pipe, poll_readable, ShutdownEvent};
use super::pty::{PtyError, Result};
use super::session::Shared;

/// Signals relayed to the shell
pub const FORWARDED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Write end of the active relay's pipe, -1 when none
static RELAY_FD: AtomicI32 = AtomicI32::new(-1);

static HANDLERS: Mutex<HandlerState> = Mutex::new(HandlerState {
    relays: Vec::new(),
    previous: Vec::new(),
});

struct HandlerState {
    /// Write ends of the live relays, newest last
    relays: Vec<RawFd>,
    previous: Vec<(Signal, SigAction)>,
}

impl HandlerState {
    fn publish_top(&self) {
        let top = self.relays.last().copied().unwrap_or(-1);
        RELAY_FD.store(top, Ordering::SeqCst);
    }
}

extern "C" fn relay_signal(signum: libc::c_int) {
    let fd = RELAY_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let saved = Errno::last_raw();
        let byte = signum as u8;
        // SAFETY: write(2) is async-signal-safe. A full pipe drops the signal.
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
        Errno::set_raw(saved);
    }
}

fn lock_handlers() -> MutexGuard<'static, HandlerState> {
    HANDLERS.lock().unwrap_or_else(PoisonError::into_inner)
}

fn restore(previous: &[(Signal, SigAction)]) {
    for (signal, action) in previous {
        // SAFETY: reinstating a disposition that was installed before.
        if let Err(e) = unsafe { sigaction(*signal, action) } {
            warn!("Failed to restore {:?} handler: {}", signal, e);
        }
    }
}

fn acquire_handlers(relay_fd: RawFd) -> Result<()> {
    let mut state = lock_handlers();
    if state.relays.is_empty() {
        let action = SigAction::new(
            SigHandler::Handler(relay_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let mut previous = Vec::with_capacity(FORWARDED_SIGNALS.len());
        for signal in FORWARDED_SIGNALS {
            // SAFETY: the handler only reads an atomic and calls write(2).
            match unsafe { sigaction(signal, &action) } {
                Ok(old) => previous.push((signal, old)),
                Err(e) => {
                    restore(&previous);
                    return Err(PtyError::SignalHandler(e));
                }
            }
        }
        state.previous = previous;
        debug!("signal relay handlers installed");
    }
    state.relays.push(relay_fd);
    state.publish_top();
    Ok(())
}

fn release_handlers(relay_fd: RawFd) {
    let mut state = lock_handlers();
    if let Some(index) = state.relays.iter().rposition(|&fd| fd == relay_fd) {
        state.relays.remove(index);
    }
    // Redirect the handlers before the caller closes the pipe.
    state.publish_top();
    if state.relays.is_empty() {
        let previous = mem::take(&mut state.previous);
        restore(&previous);
        debug!("signal relay handlers restored");
    }
}

/// Self-pipe fed by the process-wide handlers
#[derive(Debug)]
pub struct SignalRelay {
    read: File,
    write: File,
}

impl SignalRelay {
    /// Install the handlers (if needed) and route caught signals to this relay
    pub fn install() -> Result<Self> {
        let (read, write) = nonblocking_pipe()?;
        acquire_handlers(write.as_raw_fd())?;
        Ok(Self { read, write })
    }

    /// Descriptor that becomes readable when a signal was caught
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    /// Take every signal caught so far
    pub fn drain(&self) -> Vec<Signal> {
        let mut signals = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match (&self.read).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => signals.extend(
                    buf[..n]
                        .iter()
                        .filter_map(|&b| Signal::try_from(libc::c_int::from(b)).ok()),
                ),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
        signals
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        // The pipe itself closes after this, once no handler points at it.
        release_handlers(self.write.as_raw_fd());
    }
}

/// Background loop relaying caught signals to the session's shell
pub(crate) struct SignalForwarder {
    relay: SignalRelay,
    shared: Arc<Shared>,
    shutdown: Arc<ShutdownEvent>,
    poll_interval_ms: u16,
}

impl SignalForwarder {
    pub(crate) fn new(
        relay: SignalRelay,
        shared: Arc<Shared>,
        shutdown: Arc<ShutdownEvent>,
        poll_interval_ms: u16,
    ) -> Self {
        Self {
            relay,
            shared,
            shutdown,
            poll_interval_ms,
        }
    }

    /// Run until the session stops. Dropping the relay on exit releases the handlers.
    pub(crate) fn run(self) {
        debug!("signal forwarder started");
        while self.shared.is_running() {
            let [caught, shutdown] =
                match poll_readable([self.relay.fd(), self.shutdown.fd()], self.poll_interval_ms) {
                    Ok(events) => events,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        warn!("Signal forwarder poll failed: {}", e);
                        break;
                    }
                };

            if !shutdown.is_empty() {
                break;
            }
            if caught.contains(PollFlags::POLLIN) {
                for signal in self.relay.drain() {
                    self.forward(signal);
                }
            }
        }
        debug!("signal forwarder stopped");
    }

    fn forward(&self, signal: Signal) {
        match self.shared.child_pid() {
            Some(pid) => match kill(pid, signal) {
                Ok(()) => info!(%pid, ?signal, "forwarded signal to shell"),
                Err(e) => warn!(%pid, ?signal, "Failed to forward signal: {}", e),
            },
            None => debug!(?signal, "no shell to forward signal to"),
        }
    }
}
