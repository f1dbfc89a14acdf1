//! Self-pipe wake-ups and bounded readiness waits
//!
//! Both background loops of a session sleep in `poll` on their own
//! descriptor plus the read end of a [`ShutdownEvent`]. Triggering the event
//! makes every waiter return immediately; the pipe is never drained, so the
//! event stays set for the rest of its life.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd::pipe;
use tracing::warn;

use super::pty::{set_nonblocking_cloexec, PtyError, Result};

/// Create a pipe whose ends are both non-blocking and close-on-exec
pub(crate) fn nonblocking_pipe() -> Result<(File, File)> {
    let (read, write) = pipe().map_err(PtyError::Pipe)?;
    set_nonblocking_cloexec(read.as_raw_fd()).map_err(PtyError::Configure)?;
    set_nonblocking_cloexec(write.as_raw_fd()).map_err(PtyError::Configure)?;
    Ok((File::from(read), File::from(write)))
}

/// Wait up to `timeout_ms` for any of `fds` to become readable.
///
/// Returns the reported events per descriptor, all empty on timeout.
/// `EINTR` is surfaced to the caller so it can re-check its own state.
pub(crate) fn poll_readable<const N: usize>(
    fds: [BorrowedFd<'_>; N],
    timeout_ms: u16,
) -> std::result::Result<[PollFlags; N], Errno> {
    let mut pollfds = fds.map(|fd| PollFd::new(fd, PollFlags::POLLIN));
    poll(&mut pollfds, timeout_ms)?;
    Ok(pollfds.map(|p| p.revents().unwrap_or(PollFlags::empty())))
}

/// Wait up to `timeout_ms` for `fd` to accept more data
pub(crate) fn poll_writable(fd: BorrowedFd<'_>, timeout_ms: u16) -> std::result::Result<bool, Errno> {
    let mut pollfds = [PollFd::new(fd, PollFlags::POLLOUT)];
    let ready = poll(&mut pollfds, timeout_ms)?;
    Ok(ready > 0
        && pollfds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLOUT)))
}

/// One-shot, level-triggered wake-up shared by a session's threads
#[derive(Debug)]
pub struct ShutdownEvent {
    read: File,
    write: File,
}

impl ShutdownEvent {
    pub fn new() -> Result<Self> {
        let (read, write) = nonblocking_pipe()?;
        Ok(Self { read, write })
    }

    /// Wake every thread waiting on [`fd`](Self::fd)
    pub fn trigger(&self) {
        match (&self.write).write(&[1]) {
            Ok(_) => {}
            // Pipe already full: the event is set.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => warn!("Failed to trigger shutdown event: {}", e),
        }
    }

    /// Descriptor that becomes readable once the event is triggered
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    #[cfg(test)]
    pub(crate) fn is_triggered(&self) -> bool {
        matches!(
            poll_readable([self.fd()], 0),
            Ok([flags]) if flags.contains(PollFlags::POLLIN)
        )
    }
}
