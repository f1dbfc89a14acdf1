//! Output channel
//!
//! Every message handed to the caller's callback starts with the output tag.
//! Shell output follows the tag verbatim; status lines use `[*] ` for
//! information and `[!] ` for errors and always end in a newline.

use std::fmt;
use std::sync::Arc;

/// Caller-supplied sink for shell output and status lines.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Prefix on every message sent through the output channel
pub const DEFAULT_OUTPUT_TAG: &str = "ISHELL_OUTPUT:";

/// Tagging wrapper around an optional [`OutputCallback`]
#[derive(Clone)]
pub struct OutputSink {
    callback: Option<OutputCallback>,
    tag: Arc<str>,
}

impl OutputSink {
    pub fn new(callback: Option<OutputCallback>, tag: &str) -> Self {
        Self {
            callback,
            tag: Arc::from(tag),
        }
    }

    /// A sink that drops everything
    pub fn disconnected() -> Self {
        Self::new(None, DEFAULT_OUTPUT_TAG)
    }

    pub fn is_connected(&self) -> bool {
        self.callback.is_some()
    }

    /// Forward raw shell output
    pub fn chunk(&self, text: &str) {
        self.emit(text);
    }

    /// Informational status line, e.g. startup or shutdown
    pub fn info(&self, message: impl fmt::Display) {
        self.emit(&format!("[*] {message}\n"));
    }

    /// Diagnostic status line
    pub fn error(&self, message: impl fmt::Display) {
        self.emit(&format!("[!] {message}\n"));
    }

    fn emit(&self, body: &str) {
        if let Some(callback) = &self.callback {
            let mut message = String::with_capacity(self.tag.len() + body.len());
            message.push_str(&self.tag);
            message.push_str(body);
            callback(&message);
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("connected", &self.is_connected())
            .field("tag", &self.tag)
            .finish()
    }
}

/// Remove the output tag from a message, if present
pub fn strip_tag<'a>(message: &'a str, tag: &str) -> &'a str {
    message.strip_prefix(tag).unwrap_or(message)
}
