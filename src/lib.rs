//! ptyshell - interactive shell sessions behind a pseudoterminal
//!
//! ptyshell runs one interactive shell on a Unix PTY and bridges it to a
//! callback-driven interface, so a task dispatcher can drive the shell
//! without blocking on its I/O.
//!
//! # Features
//!
//! - **Non-blocking output pump**: shell output is delivered to a callback
//!   from a background thread, in order, tagged with `ISHELL_OUTPUT:`
//! - **Signal forwarding**: SIGINT, SIGTERM and SIGHUP received by this
//!   process are relayed to the shell while a session runs
//! - **Resize propagation**: `notify_resize` updates the PTY size and sends
//!   SIGWINCH; window changes of the controlling terminal are recorded for
//!   the active session
//! - **Clean shutdown**: SIGTERM, a short grace period, SIGKILL; the shell is
//!   always reaped and both background threads are joined
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ptyshell::{Config, ShellSession};
//!
//! let mut session = ShellSession::new(Config::default());
//! session.start(Some(Arc::new(|text: &str| print!("{text}"))));
//! session.write("echo hello");
//! session.notify_resize(120, 40);
//! session.stop();
//! ```

#[cfg(not(unix))]
compile_error!("ptyshell requires a Unix pseudoterminal");

pub mod config;
pub mod core;

pub use crate::config::{Config, ConfigError};
pub use crate::core::output::{strip_tag, OutputCallback, DEFAULT_OUTPUT_TAG};
pub use crate::core::pty::{ChildExit, PtyError};
pub use crate::core::session::ShellSession;
