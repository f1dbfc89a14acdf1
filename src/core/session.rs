//! Session management
//!
//! A [`ShellSession`] runs one interactive shell behind a PTY. Output is
//! pumped to a caller-supplied callback by a reader thread, SIGINT/SIGTERM/
//! SIGHUP are relayed to the shell by a forwarder thread, and the caller
//! drives the shell with [`write`](ShellSession::write) and
//! [`notify_resize`](ShellSession::notify_resize).
//!
//! Failures never cross the control surface as errors: they are reported
//! through the output channel and observed via
//! [`is_running`](ShellSession::is_running).

use std::borrow::Cow;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use super::event::{poll_writable, ShutdownEvent};
use super::output::{OutputCallback, OutputSink};
use super::pty::{ChildExit, Pty, PtyError, Result};
use super::reader::ReaderLoop;
use super::resize;
use super::signals::{SignalForwarder, SignalRelay};
use crate::config::Config;

/// State shared between the control thread and the background loops
#[derive(Debug)]
pub(crate) struct Shared {
    running: AtomicBool,
    child_pid: AtomicI32,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            child_pid: AtomicI32::new(-1),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Publish the child, then raise the running flag
    pub(crate) fn set_running(&self, pid: Pid) {
        self.child_pid.store(pid.as_raw(), Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    /// Returns whether the flag was set before
    pub(crate) fn clear_running(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn child_pid(&self) -> Option<Pid> {
        match self.child_pid.load(Ordering::SeqCst) {
            pid if pid > 0 => Some(Pid::from_raw(pid)),
            _ => None,
        }
    }

    pub(crate) fn clear_child(&self) {
        self.child_pid.store(-1, Ordering::SeqCst);
    }
}

/// Resources held for one running period of a session
struct ActiveShell {
    pty: Arc<Pty>,
    shutdown: Arc<ShutdownEvent>,
    reader: Option<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

impl ActiveShell {
    /// Tear down in order: flag, child, wake-up, descriptor, threads.
    fn shutdown(self, shared: &Shared, grace: Duration) -> Option<ChildExit> {
        let ActiveShell {
            pty,
            shutdown,
            reader,
            forwarder,
        } = self;

        shared.clear_running();
        let exit = pty.terminate(grace);
        shared.clear_child();
        shutdown.trigger();
        // The reader holds the last reference; the master closes when it exits.
        drop(pty);

        for handle in [reader, forwarder].into_iter().flatten() {
            let name = handle.thread().name().unwrap_or("pty").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "Background thread panicked");
            }
        }
        exit
    }
}

fn spawn_thread<F>(name: String, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|source| PtyError::Thread { name, source })
}

/// One command per write: make sure the input ends with a single newline
pub(crate) fn with_trailing_newline(text: &str) -> Cow<'_, str> {
    if text.ends_with('\n') {
        Cow::Borrowed(text)
    } else {
        Cow::Owned(format!("{text}\n"))
    }
}

/// An interactive shell behind a PTY
pub struct ShellSession {
    id: u64,
    config: Config,
    cols: u16,
    rows: u16,
    output: OutputSink,
    shared: Arc<Shared>,
    active: Option<ActiveShell>,
    last_exit: Option<ChildExit>,
}

impl ShellSession {
    /// Create a stopped session using `config`
    pub fn new(config: Config) -> Self {
        Self {
            id: resize::next_session_id(),
            cols: config.terminal.cols,
            rows: config.terminal.rows,
            config,
            output: OutputSink::disconnected(),
            shared: Arc::new(Shared::new()),
            active: None,
            last_exit: None,
        }
    }

    /// Process-unique session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Start the shell. Does nothing if it is already running.
    ///
    /// On failure the session stays stopped and `callback` receives one
    /// diagnostic line; `start` may be called again.
    pub fn start(&mut self, callback: Option<OutputCallback>) {
        if self.active.is_some() {
            if self.shared.is_running() {
                debug!(session = self.id, "start ignored, shell already running");
                return;
            }
            // The previous shell ended on its own; release what it left behind.
            self.stop();
        }

        self.output = OutputSink::new(callback, &self.config.output_tag);

        match self.launch() {
            Ok(active) => {
                let shell = active.pty.shell().to_string();
                info!(session = self.id, pid = %active.pty.pid(), shell = %shell, "shell session started");
                self.active = Some(active);
                self.output.info(format_args!("PTY shell started ({shell})"));
            }
            Err(e) => {
                error!(session = self.id, "Failed to start shell: {}", e);
                self.output.error(format_args!("failed to start shell: {e}"));
            }
        }
    }

    fn launch(&self) -> Result<ActiveShell> {
        let pty = Arc::new(Pty::spawn(&self.config.shells, self.cols, self.rows)?);
        let relay = SignalRelay::install()?;
        let shutdown = Arc::new(ShutdownEvent::new()?);

        self.shared.set_running(pty.pid());
        let mut active = ActiveShell {
            pty,
            shutdown,
            reader: None,
            forwarder: None,
        };

        if let Err(e) = self.spawn_loops(&mut active, relay) {
            active.shutdown(&self.shared, self.config.timing.grace_period());
            return Err(e);
        }

        resize::register(self.id);
        Ok(active)
    }

    fn spawn_loops(&self, active: &mut ActiveShell, relay: SignalRelay) -> Result<()> {
        let poll_interval_ms = self.config.timing.poll_interval_ms;

        let forwarder = SignalForwarder::new(
            relay,
            self.shared.clone(),
            active.shutdown.clone(),
            poll_interval_ms,
        );
        active.forwarder = Some(spawn_thread(format!("pty-signals-{}", self.id), move || {
            forwarder.run()
        })?);

        let reader = ReaderLoop::new(
            active.pty.clone(),
            self.shared.clone(),
            active.shutdown.clone(),
            self.output.clone(),
            self.config.reader.chunk_size,
            poll_interval_ms,
        );
        active.reader = Some(spawn_thread(format!("pty-reader-{}", self.id), move || {
            reader.run()
        })?);

        Ok(())
    }

    /// Stop the shell and release every resource. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        let pid = active.pty.pid();
        debug!(session = self.id, %pid, "stopping shell session");
        let exit = active.shutdown(&self.shared, self.config.timing.grace_period());
        resize::unregister(self.id);

        if exit.is_some() {
            self.last_exit = exit;
        }
        info!(session = self.id, %pid, ?exit, "shell session terminated");
        self.output.info("Shell terminated");
    }

    /// Send one command line to the shell.
    ///
    /// A newline is appended unless `text` already ends with one. A write
    /// failure other than a full PTY buffer stops the session.
    pub fn write(&mut self, text: &str) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if !self.shared.is_running() {
            return;
        }

        let pty = active.pty.clone();
        let data = with_trailing_newline(text);
        if let Err(e) = self.write_all(&pty, data.as_bytes()) {
            warn!(session = self.id, "{}; stopping session", e);
            self.stop();
        }
    }

    fn write_all(&self, pty: &Pty, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match pty.write(data) {
                Ok(0) => return Err(PtyError::Write(io::ErrorKind::WriteZero.into())),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    match poll_writable(pty.master_fd(), self.config.timing.poll_interval_ms) {
                        Ok(true) | Err(Errno::EINTR) => {}
                        Ok(false) => {
                            warn!(
                                session = self.id,
                                dropped = data.len(),
                                "PTY input buffer full, dropping input"
                            );
                            return Ok(());
                        }
                        Err(e) => return Err(PtyError::Write(e.into())),
                    }
                }
                Err(e) => return Err(PtyError::Write(e)),
            }
        }
        Ok(())
    }

    /// True while the running flag is set and the shell process is alive.
    ///
    /// Liveness is checked on every call, so a shell that exited or was
    /// killed without [`stop`](Self::stop) is detected here.
    pub fn is_running(&self) -> bool {
        self.shared.is_running() && self.active.as_ref().is_some_and(|a| a.pty.is_alive())
    }

    /// Resize the PTY and send SIGWINCH so the shell redraws
    pub fn notify_resize(&mut self, cols: u16, rows: u16) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        if !self.shared.is_running() {
            return;
        }

        self.cols = cols;
        self.rows = rows;
        if let Err(e) = active.pty.resize(cols, rows) {
            warn!(session = self.id, "{}", e);
        }
        if let Err(e) = active.pty.signal(Signal::SIGWINCH) {
            warn!(session = self.id, "{}", e);
        }
        debug!(session = self.id, cols, rows, "terminal resized");
    }

    /// Consume a window-change recorded by the SIGWINCH handler for this session
    pub fn take_pending_resize(&self) -> bool {
        resize::take_pending(self.id)
    }

    /// Apply a pending window-change with the size reported by `query`.
    ///
    /// Returns true if a resize was applied.
    pub fn apply_pending_resize<F>(&mut self, query: F) -> bool
    where
        F: FnOnce() -> Option<(u16, u16)>,
    {
        if !self.take_pending_resize() {
            return false;
        }
        match query() {
            Some((cols, rows)) if cols > 0 && rows > 0 => {
                self.notify_resize(cols, rows);
                true
            }
            _ => false,
        }
    }

    /// Stored terminal size as (cols, rows)
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Size currently set on the PTY, if a shell is running
    pub fn terminal_size(&self) -> Option<(u16, u16)> {
        self.active.as_ref().and_then(|a| a.pty.window_size().ok())
    }

    /// Pid of the current shell
    pub fn pid(&self) -> Option<i32> {
        self.shared.child_pid().map(Pid::as_raw)
    }

    /// How the most recently stopped shell ended
    pub fn last_exit(&self) -> Option<ChildExit> {
        self.last_exit
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Default for ShellSession {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::nonblocking_pipe;
    use crate::core::process_state_lock;
    use crate::core::pty::EXEC_FAILED_STATUS;
    use nix::sys::signal::{kill, raise};
    use nix::unistd::dup2;
    use std::io::Write as _;
    use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
    use std::sync::Mutex;
    use std::time::Instant;

    fn sh_config() -> Config {
        Config {
            shells: vec!["/bin/sh".to_string()],
            ..Config::default()
        }
    }

    fn transcript() -> (Option<OutputCallback>, Arc<Mutex<String>>) {
        let text = Arc::new(Mutex::new(String::new()));
        let sink = text.clone();
        let callback: OutputCallback = Arc::new(move |message: &str| {
            sink.lock().unwrap().push_str(message);
        });
        (Some(callback), text)
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        condition()
    }

    fn wait_for(text: &Arc<Mutex<String>>, needle: &str, timeout: Duration) -> bool {
        wait_until(timeout, || text.lock().unwrap().contains(needle))
    }

    #[test]
    fn test_trailing_newline() {
        assert_eq!(with_trailing_newline("ls"), "ls\n");
        assert_eq!(with_trailing_newline("ls\n"), "ls\n");
        assert_eq!(with_trailing_newline(""), "\n");
        assert!(matches!(with_trailing_newline("pwd\n"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_start_then_stop_is_bounded() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());

        session.start(callback);
        assert!(session.is_running());
        let pid = Pid::from_raw(session.pid().unwrap());

        let started = Instant::now();
        session.stop();
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(!session.is_running());
        assert_eq!(session.pid(), None);
        assert_eq!(kill(pid, None), Err(Errno::ESRCH), "child must be reaped");
        assert!(session.last_exit().is_some());

        let text = text.lock().unwrap();
        assert!(text.contains("ISHELL_OUTPUT:[*] PTY shell started (/bin/sh)\n"));
        assert!(text.contains("ISHELL_OUTPUT:[*] PTY closed\n"));
        assert!(text.ends_with("ISHELL_OUTPUT:[*] Shell terminated\n"));
    }

    #[test]
    fn test_echo_hello() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());
        session.start(callback);

        session.write("echo hello");
        assert!(wait_for(&text, "hello", Duration::from_secs(2)));

        session.write("echo $((6*7))");
        assert!(wait_for(&text, "42", Duration::from_secs(2)));
    }

    #[test]
    fn test_write_appends_exactly_one_newline() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());
        session.start(callback);

        session.write("IFS= read -r a; IFS= read -r b; echo \"<$a|$b>\"");
        session.write("first\n");
        session.write("second");

        // A doubled newline would make the second read return an empty line.
        assert!(
            wait_for(&text, "<first|second>", Duration::from_secs(3)),
            "got: {}",
            text.lock().unwrap()
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());
        session.start(callback);

        session.stop();
        session.stop();

        let text = text.lock().unwrap();
        assert_eq!(text.matches("[*] Shell terminated").count(), 1);
        assert_eq!(text.matches("[*] PTY closed").count(), 1);
    }

    #[test]
    fn test_external_kill_is_detected() {
        let _guard = process_state_lock();
        let mut session = ShellSession::new(sh_config());
        session.start(None);
        let pid = Pid::from_raw(session.pid().unwrap());

        kill(pid, Signal::SIGKILL).unwrap();

        assert!(wait_until(Duration::from_secs(2), || !session.is_running()));
        session.stop();
        assert_eq!(session.last_exit(), Some(ChildExit::Signaled(Signal::SIGKILL)));
    }

    #[test]
    fn test_exit_ends_session_without_stop() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());
        session.start(callback);

        session.write("exit");

        assert!(wait_until(Duration::from_secs(3), || !session.is_running()));
        assert!(wait_for(&text, "[*] PTY closed", Duration::from_secs(2)));

        // Writes after the shell left are ignored.
        session.write("echo ignored");
        session.stop();
        assert_eq!(session.last_exit(), Some(ChildExit::Exited(0)));
    }

    #[test]
    fn test_resize_reaches_child() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());
        session.start(callback);
        assert_eq!(session.terminal_size(), Some((80, 24)));

        session.write("trap 'echo WINCH_$((40+2))' WINCH; echo TRAP_$((1+2))");
        assert!(wait_for(&text, "TRAP_3", Duration::from_secs(3)));

        session.notify_resize(120, 40);
        assert_eq!(session.size(), (120, 40));
        assert_eq!(session.terminal_size(), Some((120, 40)));

        session.write("stty size");
        assert!(wait_for(&text, "40 120", Duration::from_secs(3)));
        session.write("echo AFTER_RESIZE");
        assert!(
            wait_for(&text, "WINCH_42", Duration::from_secs(3)),
            "got: {}",
            text.lock().unwrap()
        );
    }

    #[test]
    fn test_calls_before_start_do_nothing() {
        let _guard = process_state_lock();
        let mut session = ShellSession::new(sh_config());

        session.write("echo never");
        session.notify_resize(100, 50);
        session.stop();

        assert!(!session.is_running());
        assert_eq!(session.size(), (80, 24));
        assert_eq!(session.terminal_size(), None);
        assert_eq!(session.pid(), None);
        assert_eq!(session.last_exit(), None);
    }

    #[test]
    fn test_start_twice_is_noop() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());

        session.start(callback.clone());
        let pid = session.pid();
        session.start(callback);

        assert_eq!(session.pid(), pid);
        assert_eq!(text.lock().unwrap().matches("PTY shell started").count(), 1);
    }

    #[test]
    fn test_sequential_sessions() {
        let _guard = process_state_lock();
        let mut first = ShellSession::new(sh_config());
        first.start(None);
        assert_eq!(resize::active_session(), Some(first.id()));
        first.stop();
        assert_eq!(resize::active_session(), None);

        let (callback, text) = transcript();
        let mut second = ShellSession::new(sh_config());
        second.start(callback);
        assert_ne!(first.id(), second.id());
        assert_eq!(resize::active_session(), Some(second.id()));

        second.write("echo SECOND_$((2*2))");
        assert!(wait_for(&text, "SECOND_4", Duration::from_secs(2)));

        raise(Signal::SIGWINCH).unwrap();
        assert!(!first.take_pending_resize());
        assert!(second.take_pending_resize());
    }

    #[test]
    fn test_apply_pending_resize() {
        let _guard = process_state_lock();
        let mut session = ShellSession::new(sh_config());
        session.start(None);

        assert!(!session.apply_pending_resize(|| Some((100, 30))));

        raise(Signal::SIGWINCH).unwrap();
        assert!(session.apply_pending_resize(|| Some((100, 30))));
        assert_eq!(session.terminal_size(), Some((100, 30)));

        raise(Signal::SIGWINCH).unwrap();
        assert!(!session.apply_pending_resize(|| None));
        assert_eq!(session.size(), (100, 30));
    }

    #[test]
    fn test_start_failure_is_reported() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(Config {
            shells: Vec::new(),
            ..Config::default()
        });

        session.start(callback);

        assert!(!session.is_running());
        assert_eq!(session.pid(), None);
        assert_eq!(resize::active_session(), None);
        let text = text.lock().unwrap();
        assert_eq!(
            text.as_str(),
            "ISHELL_OUTPUT:[!] failed to start shell: No shell candidates configured\n"
        );
    }

    #[test]
    fn test_exec_failure_is_observable() {
        let _guard = process_state_lock();
        let mut session = ShellSession::new(Config {
            shells: vec!["/nonexistent/ptyshell-test-shell".to_string()],
            ..Config::default()
        });

        session.start(None);
        assert!(wait_until(Duration::from_secs(3), || !session.is_running()));
        session.stop();
        assert_eq!(session.last_exit(), Some(ChildExit::Exited(EXEC_FAILED_STATUS)));
    }

    #[test]
    fn test_sighup_is_forwarded_to_shell() {
        let _guard = process_state_lock();
        let mut session = ShellSession::new(sh_config());
        session.start(None);

        raise(Signal::SIGHUP).unwrap();

        assert!(wait_until(Duration::from_secs(3), || !session.is_running()));
        session.stop();
        assert_eq!(session.last_exit(), Some(ChildExit::Signaled(Signal::SIGHUP)));
    }

    #[test]
    fn test_restart_after_shell_exit() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());
        session.start(callback.clone());
        let first_pid = session.pid();

        session.write("exit 5");
        assert!(wait_until(Duration::from_secs(3), || !session.is_running()));

        session.start(callback);
        assert!(session.is_running());
        assert_ne!(session.pid(), first_pid);
        assert_eq!(session.last_exit(), Some(ChildExit::Exited(5)));
        assert_eq!(text.lock().unwrap().matches("PTY shell started").count(), 2);
    }

    #[test]
    fn test_drop_stops_session() {
        let _guard = process_state_lock();
        let mut session = ShellSession::new(sh_config());
        session.start(None);
        let pid = Pid::from_raw(session.pid().unwrap());

        drop(session);
        assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    }

    /// Run a shell under `session` without the background loops, so nothing
    /// races the control thread for the master descriptor
    fn attach_without_loops(session: &mut ShellSession, callback: Option<OutputCallback>) {
        let pty = Arc::new(Pty::spawn(&session.config.shells, session.cols, session.rows).unwrap());
        session.output = OutputSink::new(callback, &session.config.output_tag);
        session.shared.set_running(pty.pid());
        session.active = Some(ActiveShell {
            pty,
            shutdown: Arc::new(ShutdownEvent::new().unwrap()),
            reader: None,
            forwarder: None,
        });
    }

    /// Point the session's master descriptor number at `target`
    fn redirect_master(session: &ShellSession, target: BorrowedFd<'_>) {
        let master = session.active.as_ref().unwrap().pty.master_fd().as_raw_fd();
        dup2(target.as_raw_fd(), master).unwrap();
    }

    #[test]
    fn test_write_failure_stops_session() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());
        attach_without_loops(&mut session, callback);

        // A pipe with no reader fails every write with EPIPE.
        let (read, write) = nonblocking_pipe().unwrap();
        drop(read);
        redirect_master(&session, write.as_fd());

        session.write("echo unreachable");

        assert!(session.active.is_none());
        assert!(!session.is_running());
        assert_eq!(session.pid(), None);
        assert!(session.last_exit().is_some());

        session.stop();
        session.write("echo again");
        assert_eq!(text.lock().unwrap().matches("[*] Shell terminated\n").count(), 1);
    }

    #[test]
    fn test_full_input_buffer_drops_without_stopping() {
        let _guard = process_state_lock();
        let (callback, text) = transcript();
        let mut session = ShellSession::new(sh_config());
        attach_without_loops(&mut session, callback);

        let (_read, write) = nonblocking_pipe().unwrap();
        let block = [0u8; 4096];
        while (&write).write(&block).is_ok() {}
        while (&write).write(&block[..1]).is_ok() {}
        redirect_master(&session, write.as_fd());

        let started = Instant::now();
        session.write("echo dropped");
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(session.active.is_some());
        assert!(session.shared.is_running());
        assert!(!text.lock().unwrap().contains("Shell terminated"));

        session.stop();
        assert_eq!(text.lock().unwrap().matches("[*] Shell terminated\n").count(), 1);
    }
}
