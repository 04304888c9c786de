//! Error types for the monitor.
//!
//! Every fallible operation in the crate returns a [`MonitorError`], which
//! carries a coarse [`ErrorKind`], a message meant for people, and an
//! optional hint on what to do about it.

use std::error::Error;
use std::fmt;

/// Exit codes for the application.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Network error (connection failed, timeout, etc.).
    pub const NETWORK_ERROR: i32 = 1;
    /// Persistent storage could not be read or written.
    pub const STORAGE_ERROR: i32 = 2;
    /// Configuration error (invalid arguments, unreadable plan file).
    pub const CONFIG_ERROR: i32 = 3;
    /// The monitor loop terminated itself.
    pub const MONITOR_ERROR: i32 = 4;
    /// Unknown/unexpected error.
    pub const UNKNOWN_ERROR: i32 = 99;
}

/// Categories of errors that can occur while monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network connectivity issues.
    Network,
    /// An attempt exceeded its wall-clock ceiling.
    Timeout,
    /// The speed-test engine reported a failure.
    Engine,
    /// The speed-test endpoint returned an error response.
    Api,
    /// Reading or writing persisted sessions failed.
    Storage,
    /// Invalid configuration or arguments.
    Config,
    /// A test result was missing required measurements.
    InvalidResult,
    /// The session is not in a state that permits the operation.
    Session,
    /// The active session disappeared and could not be recreated.
    SessionLost,
    /// The operation was cancelled by a stop request.
    Aborted,
    /// Unknown or unexpected errors.
    Unknown,
}

impl ErrorKind {
    /// Get the exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::Engine
            | ErrorKind::Api => exit_codes::NETWORK_ERROR,
            ErrorKind::Storage => exit_codes::STORAGE_ERROR,
            ErrorKind::Config => exit_codes::CONFIG_ERROR,
            ErrorKind::InvalidResult
            | ErrorKind::Session
            | ErrorKind::SessionLost
            | ErrorKind::Aborted => exit_codes::MONITOR_ERROR,
            ErrorKind::Unknown => exit_codes::UNKNOWN_ERROR,
        }
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Network error",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Engine => "Speed test error",
            ErrorKind::Api => "API error",
            ErrorKind::Storage => "Storage error",
            ErrorKind::Config => "Configuration error",
            ErrorKind::InvalidResult => "Invalid test result",
            ErrorKind::Session => "Session error",
            ErrorKind::SessionLost => "Session lost",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::Unknown => "Unknown error",
        }
    }
}

/// A user-friendly error type for monitor operations.
#[derive(Debug)]
pub struct MonitorError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// User-friendly error message.
    pub message: String,
    /// Optional suggestion for how to resolve the error.
    pub suggestion: Option<String>,
    /// The underlying error, if any.
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl MonitorError {
    /// Create a new MonitorError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), suggestion: None, source: None }
    }

    /// Add a suggestion for how to resolve the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add the underlying error source.
    pub fn with_source(
        mut self,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
            .with_suggestion("Check your internet connection and try again.")
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message).with_suggestion(
            "The connection may be too slow for the current test plan.",
        )
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Engine, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Storage, message).with_suggestion(
            "Check that the data directory exists and is writable.",
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn invalid_result(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResult, message)
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Session, message)
    }

    pub fn session_lost(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionLost, message)
            .with_suggestion("Start a new monitoring session.")
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)?;

        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

impl Error for MonitorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

impl From<std::io::Error> for MonitorError {
    fn from(error: std::io::Error) -> Self {
        MonitorError::storage(error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(error: serde_json::Error) -> Self {
        MonitorError::storage(format!("malformed record: {}", error))
            .with_source(error)
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(error: reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            ErrorKind::Timeout
        } else if error.is_status() {
            ErrorKind::Api
        } else {
            classify_error(&error)
        };
        MonitorError::new(kind, error.to_string()).with_source(error)
    }
}

/// Classify an error into an ErrorKind based on its message.
///
/// Engine failures arrive as free text; this keeps the retry log and the
/// error feed readable without needing typed errors from every backend.
pub fn classify_error(error: &dyn Error) -> ErrorKind {
    classify_message(&error.to_string())
}

pub fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_lowercase();

    if message.contains("timeout")
        || message.contains("timed out")
        || message.contains("deadline")
    {
        return ErrorKind::Timeout;
    }

    if message.contains("dns")
        || message.contains("resolve")
        || message.contains("connection refused")
        || message.contains("connection reset")
        || message.contains("network unreachable")
        || message.contains("host unreachable")
        || message.contains("no route")
        || message.contains("broken pipe")
    {
        return ErrorKind::Network;
    }

    if message.contains("status: 4")
        || message.contains("status: 5")
        || message.contains("server error")
    {
        return ErrorKind::Api;
    }

    ErrorKind::Unknown
}

/// Format an error for user display.
pub fn format_error_for_display(error: &MonitorError) -> String {
    let mut output = format!("Error: {}", error.message);

    if let Some(ref suggestion) = error.suggestion {
        output.push_str(&format!("\n\nSuggestion: {}", suggestion));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_exit_codes() {
        assert_eq!(ErrorKind::Network.exit_code(), exit_codes::NETWORK_ERROR);
        assert_eq!(ErrorKind::Timeout.exit_code(), exit_codes::NETWORK_ERROR);
        assert_eq!(ErrorKind::Storage.exit_code(), exit_codes::STORAGE_ERROR);
        assert_eq!(ErrorKind::Config.exit_code(), exit_codes::CONFIG_ERROR);
        assert_eq!(
            ErrorKind::SessionLost.exit_code(),
            exit_codes::MONITOR_ERROR
        );
    }

    #[test]
    fn test_monitor_error_display() {
        let error = MonitorError::storage("disk full");

        let display = format!("{}", error);
        assert!(display.contains("Storage error"));
        assert!(display.contains("disk full"));
        assert!(display.contains("Suggestion"));
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(classify_message("Operation timed out"), ErrorKind::Timeout);
        assert_eq!(
            classify_message("connection refused by peer"),
            ErrorKind::Network
        );
        assert_eq!(
            classify_message("HTTP status: 503 Service Unavailable"),
            ErrorKind::Api
        );
        assert_eq!(classify_message("something odd"), ErrorKind::Unknown);
    }

    #[test]
    fn test_classify_error_uses_display_text() {
        let error = std::io::Error::new(
            std::io::ErrorKind::Other,
            "DNS resolution failed",
        );
        assert_eq!(classify_error(&error), ErrorKind::Network);
    }

    #[test]
    fn test_io_error_becomes_storage_error() {
        let error: MonitorError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope")
                .into();
        assert_eq!(error.kind, ErrorKind::Storage);
        assert!(error.source().is_some());
    }

    #[test]
    fn test_format_error_for_display() {
        let error = MonitorError::session_lost("session vanished twice");
        let output = format_error_for_display(&error);
        assert!(output.starts_with("Error: session vanished twice"));
        assert!(output.contains("Start a new monitoring session."));
    }
}
