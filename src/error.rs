//! Error types for routemark
//!
//! Errors are categorized by subsystem and carry a recovery classification:
//! transient request-level failures are contained where they happen, while
//! lifecycle failures propagate to the daemon which decides on teardown.

use std::io;

use thiserror::Error;

use crate::codec::DecodeError;

/// Top-level error type for routemark
#[derive(Debug, Error)]
pub enum RoutemarkError {
    /// Configuration errors (file parsing, validation)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// DNS wire decoding errors
    #[error("DNS decode error: {0}")]
    Decode(#[from] DecodeError),

    /// DNS proxy errors
    #[error("DNS proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Netfilter driver errors
    #[error("netfilter error: {0}")]
    Netfilter(#[from] NetfilterError),

    /// Group lifecycle errors
    #[error("group error: {0}")]
    Group(#[from] GroupError),

    /// Daemon lifecycle errors
    #[error("daemon error: {0}")]
    Daemon(#[from] DaemonError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RoutemarkError {
    /// Check if this error is recoverable (the operation can be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Decode(_) => false,
            Self::Proxy(e) => e.is_recoverable(),
            Self::Netfilter(e) => e.is_recoverable(),
            Self::Group(e) => e.is_recoverable(),
            Self::Daemon(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without operator intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// DNS proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind the listener socket
    #[error("failed to bind DNS listener to {addr}: {reason}")]
    BindError { addr: String, reason: String },

    /// Failed to receive a datagram on the listener
    #[error("failed to receive datagram: {0}")]
    RecvError(String),

    /// Failed to reach the upstream resolver
    #[error("upstream {upstream} unreachable: {reason}")]
    UpstreamUnreachable { upstream: String, reason: String },

    /// Upstream did not answer within the read deadline
    #[error("upstream {upstream} timed out after {timeout_secs}s")]
    UpstreamTimeout { upstream: String, timeout_secs: u64 },

    /// I/O error
    #[error("proxy I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::RecvError(_) | Self::UpstreamUnreachable { .. } | Self::UpstreamTimeout { .. } => {
                true
            }
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr: addr.into(),
            reason: reason.into(),
        }
    }
}

/// Netfilter driver errors
///
/// Every driver operation is written to be idempotent; `AlreadyExists` is
/// surfaced only where a caller needs it (mark/table claiming).
#[derive(Debug, Error)]
pub enum NetfilterError {
    /// External command exited non-zero
    #[error("{program} {args} failed: {stderr}")]
    CommandFailed {
        program: String,
        args: String,
        stderr: String,
    },

    /// Failed to spawn an external command
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The kernel object already exists (EEXIST)
    #[error("object already exists: {0}")]
    AlreadyExists(String),

    /// The kernel object does not exist
    #[error("no such object: {0}")]
    NotFound(String),

    /// Could not parse tool output
    #[error("unparseable {what} output: {line:?}")]
    Parse { what: &'static str, line: String },
}

impl NetfilterError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::CommandFailed { .. } | Self::Spawn { .. } | Self::Parse { .. } => false,
            Self::AlreadyExists(_) | Self::NotFound(_) => true,
        }
    }

    /// Create a command failure from collected output
    pub fn command(program: &str, args: &[String], stderr: impl Into<String>) -> Self {
        Self::CommandFailed {
            program: program.to_string(),
            args: args.join(" "),
            stderr: stderr.into(),
        }
    }
}

/// Group lifecycle errors
#[derive(Debug, Error)]
pub enum GroupError {
    /// All candidate firewall marks are taken
    #[error("no free firewall mark")]
    NoFreeMark,

    /// All candidate routing tables (1..=0x3FF) are taken
    #[error("no free routing table")]
    NoFreeTable,

    /// A netfilter operation failed during a group step
    #[error(transparent)]
    Netfilter(#[from] NetfilterError),
}

impl GroupError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::NoFreeMark | Self::NoFreeTable => false,
            Self::Netfilter(e) => e.is_recoverable(),
        }
    }
}

/// Daemon lifecycle errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// `run()` was called while the daemon is already running
    #[error("already running")]
    AlreadyRunning,

    /// A group with the same id is already registered
    #[error("group id conflict: {0}")]
    GroupIdConflict(u32),

    /// Failed to set up the notification socket
    #[error("notification socket {path}: {reason}")]
    NotifySocket { path: String, reason: String },

    /// A background task panicked
    #[error("background task panicked: {0}")]
    TaskPanicked(&'static str),

    /// One or more teardown steps failed
    #[error("teardown finished with {} error(s): {}", errors.len(), errors.join("; "))]
    Teardown { errors: Vec<String> },
}

impl DaemonError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::GroupIdConflict(_))
    }

    /// Create a notification-socket error
    pub fn notify_socket(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotifySocket {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with `RoutemarkError`
pub type Result<T> = std::result::Result<T, RoutemarkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        let config_err = ConfigError::ValidationError("test".into());
        assert!(!config_err.is_recoverable());

        let timeout = ProxyError::UpstreamTimeout {
            upstream: "1.1.1.1:53".into(),
            timeout_secs: 5,
        };
        assert!(timeout.is_recoverable());

        let bind = ProxyError::bind("0.0.0.0:53", "permission denied");
        assert!(!bind.is_recoverable());

        assert!(!GroupError::NoFreeMark.is_recoverable());
        assert!(!DaemonError::AlreadyRunning.is_recoverable());
        assert!(DaemonError::GroupIdConflict(3).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = DaemonError::Teardown {
            errors: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 error(s)"));
        assert!(msg.contains("a; b"));

        let err = NetfilterError::command(
            "iptables",
            &["-t".into(), "nat".into()],
            "No chain/target/match by that name",
        );
        assert!(err.to_string().contains("iptables -t nat"));
    }

    #[test]
    fn test_error_conversion() {
        let nf = NetfilterError::AlreadyExists("rule".into());
        let group: GroupError = nf.into();
        let top: RoutemarkError = group.into();
        assert!(top.is_recoverable());
    }
}
