//! Process-wide window-change slot
//!
//! A SIGWINCH handler cannot carry context, so the session that should react
//! to terminal resizes is published here by id. Registering a session makes
//! it the active one (last registration wins); the handler then marks a
//! resize as pending for that id. Consumers poll the flag with
//! [`ShellSession::take_pending_resize`](super::session::ShellSession::take_pending_resize)
//! and push the real terminal size themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, warn};

/// Session ids start at 1; 0 means "no session".
const NO_SESSION: u64 = 0;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static ACTIVE_SESSION: AtomicU64 = AtomicU64::new(NO_SESSION);
static PENDING_RESIZE: AtomicU64 = AtomicU64::new(NO_SESSION);
static HANDLER_INSTALLED: Once = Once::new();

extern "C" fn on_window_change(_signum: libc::c_int) {
    let active = ACTIVE_SESSION.load(Ordering::Relaxed);
    if active != NO_SESSION {
        PENDING_RESIZE.store(active, Ordering::Relaxed);
    }
}

fn install_handler() {
    HANDLER_INSTALLED.call_once(|| {
        let action = SigAction::new(
            SigHandler::Handler(on_window_change),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only touches atomics.
        match unsafe { sigaction(Signal::SIGWINCH, &action) } {
            Ok(_) => debug!("SIGWINCH handler installed"),
            Err(e) => warn!("Failed to install SIGWINCH handler: {}", e),
        }
    });
}

pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Make `id` the session that receives window-change notifications
pub(crate) fn register(id: u64) {
    install_handler();
    let previous = ACTIVE_SESSION.swap(id, Ordering::SeqCst);
    if previous != NO_SESSION && previous != id {
        debug!(previous, session = id, "window-change slot taken over");
    }
}

/// Clear the slot, but only if it still belongs to `id`
pub(crate) fn unregister(id: u64) {
    let _ = ACTIVE_SESSION.compare_exchange(id, NO_SESSION, Ordering::SeqCst, Ordering::SeqCst);
    let _ = PENDING_RESIZE.compare_exchange(id, NO_SESSION, Ordering::SeqCst, Ordering::SeqCst);
}

/// Consume a pending window-change for `id`
pub(crate) fn take_pending(id: u64) -> bool {
    PENDING_RESIZE
        .compare_exchange(id, NO_SESSION, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Id of the session currently receiving window-change notifications
pub fn active_session() -> Option<u64> {
    match ACTIVE_SESSION.load(Ordering::SeqCst) {
        NO_SESSION => None,
        id => Some(id),
    }
}
