//! Core PTY session components.
//!
//! - **pty**: `forkpty` wrapper owning the master descriptor and shell process
//! - **session**: lifecycle manager tying the PTY to its background loops
//! - **reader**: output pump from the PTY master to the output channel
//! - **signals**: SIGINT/SIGTERM/SIGHUP relay to the shell
//! - **resize**: process-wide SIGWINCH slot
//! - **event**: self-pipe shutdown event and bounded `poll` helpers
//! - **output**: tagged output channel
//!
//! # Architecture
//!
//! ```text
//! ShellSession
//! ├── Pty (master fd + shell pid, RAII)
//! ├── reader thread ──── poll(master, shutdown) ──▶ OutputSink ──▶ callback
//! ├── forwarder thread ─ poll(signal pipe, shutdown) ──▶ kill(shell, sig)
//! └── resize slot ◀──── SIGWINCH handler
//! ```

pub mod event;
pub mod output;
pub mod pty;
pub mod reader;
pub mod resize;
pub mod session;
pub mod signals;

/// Serialises tests that touch process-wide signal state.
#[cfg(test)]
pub(crate) fn process_state_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
