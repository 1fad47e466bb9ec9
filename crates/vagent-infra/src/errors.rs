//! Shared error type and severity classification.
//!
//! Every crate in the workspace defines its own `thiserror` enum for its own
//! domain (see `AudioError`, `RtpError`, `EngineError`, ...). This module
//! holds only what is genuinely cross-cutting: a severity classification
//! used to map any of those enums onto the retry/termination policy from
//! the error handling design, and a small context-attachment helper.

use std::fmt;

/// How the engine should react to an error, independent of which subsystem
/// raised it. Mirrors the `Kind` column of the error handling design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Bounded retry with backoff; terminate the call if retries are
    /// exhausted. Covers `transient-network` and `rate-limit`.
    Transient,
    /// Unrecoverable for the affected call (or the whole process, at
    /// startup). Covers `auth` and `unsupported-format`.
    Fatal,
    /// Log, count, drop the offending frame/event; only escalates to
    /// termination if it recurs above a threshold within one session.
    Protocol,
}

/// Context attached to an error: which component, which operation.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: &'static str,
    pub details: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self { component, operation, details: None }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "in {} during {}", self.component, self.operation)?;
        if let Some(d) = &self.details {
            write!(f, " ({d})")?;
        }
        Ok(())
    }
}

/// Extension trait letting any `Result<T, E: std::error::Error>` get a
/// `tracing`-friendly context string attached without changing its type.
pub trait ErrorExt<T> {
    fn context_str(self, ctx: ErrorContext) -> Result<T, String>;
}

impl<T, E: std::error::Error> ErrorExt<T> for Result<T, E> {
    fn context_str(self, ctx: ErrorContext) -> Result<T, String> {
        self.map_err(|e| format!("{e} [{ctx}]"))
    }
}
