//! Reader loop
//!
//! Pumps shell output from the PTY master to the session's output channel.
//! The loop waits in `poll` on the master and the shutdown event with a
//! bounded timeout, so it notices a cleared running flag promptly even when
//! the shell is silent.

use std::borrow::Cow;
use std::io;
use std::mem;
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::PollFlags;
use tracing::{debug, warn};

use super::event::{poll_readable, ShutdownEvent};
use super::output::OutputSink;
use super::pty::Pty;
use super::session::Shared;

/// Incremental UTF-8 decoder for PTY output.
///
/// A read can end in the middle of a multi-byte character. The incomplete
/// tail is held back and completed by the next chunk instead of being
/// replaced. Genuinely invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let data: Cow<'_, [u8]> = if self.pending.is_empty() {
            Cow::Borrowed(bytes)
        } else {
            let mut joined = mem::take(&mut self.pending);
            joined.extend_from_slice(bytes);
            Cow::Owned(joined)
        };

        let mut text = String::with_capacity(data.len());
        let mut rest: &[u8] = &data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[len..];
                        }
                        None => {
                            self.pending = tail.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    /// Flush a held-back partial character, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let tail = mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&tail).into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Running,
    Stopped,
}

pub(crate) struct ReaderLoop {
    pty: Arc<Pty>,
    shared: Arc<Shared>,
    shutdown: Arc<ShutdownEvent>,
    output: OutputSink,
    chunk_size: usize,
    poll_interval_ms: u16,
}

impl ReaderLoop {
    pub(crate) fn new(
        pty: Arc<Pty>,
        shared: Arc<Shared>,
        shutdown: Arc<ShutdownEvent>,
        output: OutputSink,
        chunk_size: usize,
        poll_interval_ms: u16,
    ) -> Self {
        Self {
            pty,
            shared,
            shutdown,
            output,
            chunk_size,
            poll_interval_ms,
        }
    }

    /// Pump output until the PTY closes or the session stops
    pub(crate) fn run(self) {
        let mut buf = vec![0u8; self.chunk_size.max(1)];
        let mut decoder = Utf8Decoder::default();
        debug!(pid = %self.pty.pid(), "reader loop started");

        while self.shared.is_running() {
            if self.step(&mut buf, &mut decoder) == ReaderState::Stopped {
                break;
            }
        }

        if let Some(tail) = decoder.finish() {
            self.output.chunk(&tail);
        }
        self.shared.clear_running();
        self.output.info("PTY closed");
        debug!(pid = %self.pty.pid(), "reader loop finished");
    }

    fn step(&self, buf: &mut [u8], decoder: &mut Utf8Decoder) -> ReaderState {
        let [master, shutdown] =
            match poll_readable([self.pty.master_fd(), self.shutdown.fd()], self.poll_interval_ms) {
                Ok(events) => events,
                Err(Errno::EINTR) => return ReaderState::Running,
                Err(e) => {
                    warn!("Poll on PTY master failed: {}", e);
                    return ReaderState::Stopped;
                }
            };

        if !shutdown.is_empty() {
            return ReaderState::Stopped;
        }
        // Data that arrives together with a hang-up is drained before stopping.
        if master.contains(PollFlags::POLLIN) {
            return self.read_chunk(buf, decoder);
        }
        if master.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
            debug!(events = ?master, "PTY master hung up");
            return ReaderState::Stopped;
        }
        ReaderState::Running
    }

    fn read_chunk(&self, buf: &mut [u8], decoder: &mut Utf8Decoder) -> ReaderState {
        match self.pty.read(buf) {
            Ok(0) => ReaderState::Stopped,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    self.output.chunk(&text);
                }
                ReaderState::Running
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                ReaderState::Running
            }
            // Linux reports EIO once the shell side of the PTY is gone.
            Err(e) => {
                debug!("PTY read ended: {}", e);
                ReaderState::Stopped
            }
        }
    }
}
