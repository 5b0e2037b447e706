//! Error types for the multipath core
//!
//! All core errors are represented by the CoreError enum. The variants map
//! onto the failure classes the daemon distinguishes: transient kernel
//! errors that are retried, vanished devices, policy conflicts that skip
//! the offending object, exhausted resources that degrade service, and
//! configuration problems that are clamped or ignored.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Multipath core error types with context
#[derive(Debug, Clone)]
pub enum CoreError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Retryable kernel/transport failure (EAGAIN-class ioctl errors,
    /// checkers still pending)
    Transient {
        /// What was being attempted
        operation: String,
        /// Description of the transient condition
        reason: String,
    },

    /// A path device disappeared from the system
    DeviceGone {
        /// Device node name (e.g. "sdc")
        dev: String,
    },

    /// Alias conflict, size mismatch, WWID mismatch — the object is skipped
    PolicyViolation {
        /// The object the violation was detected on (alias, dev, wwid)
        object: String,
        /// What rule was violated
        reason: String,
    },

    /// Alias id space, fd budget, or client slots ran out
    ResourceExhaustion {
        /// Which resource is exhausted
        resource: String,
    },

    /// Invalid configuration value
    Config {
        /// The offending option name
        option: String,
        /// The rejected value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// Requested object does not exist
    NotFound {
        /// What was looked up (map alias, path dev, wwid)
        object: String,
    },

    /// Unrecoverable daemon failure; the caller is expected to exit
    Fatal {
        /// Description of the failure
        reason: String,
    },
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            CoreError::Transient { operation, reason } => {
                write!(f, "transient failure during {}: {}", operation, reason)
            }

            CoreError::DeviceGone { dev } => {
                write!(f, "{}: device has disappeared", dev)
            }

            CoreError::PolicyViolation { object, reason } => {
                write!(f, "{}: {}", object, reason)
            }

            CoreError::ResourceExhaustion { resource } => {
                write!(f, "out of {}", resource)
            }

            CoreError::Config { option, value, reason } => {
                write!(f, "invalid value for {}: \"{}\" ({})", option, value, reason)
            }

            CoreError::NotFound { object } => {
                write!(f, "{}: not found", object)
            }

            CoreError::Fatal { reason } => {
                write!(f, "fatal: {}", reason)
            }
        }
    }
}

impl Error for CoreError {}

/// Convert std::io::Error to CoreError::Io
impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl CoreError {
    /// Attach a file path to a bare I/O error.
    pub fn io(path: &std::path::Path, err: std::io::Error, what: &str) -> Self {
        CoreError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Result type alias for multipath core operations
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::PolicyViolation {
            object: "mpatha".to_string(),
            reason: "size mismatch for sdb, not adding path".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("mpatha"));
        assert!(display.contains("size mismatch"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let core_err: CoreError = io_err.into();

        match core_err {
            CoreError::Io { kind, .. } => assert_eq!(kind, std::io::ErrorKind::NotFound),
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_exhaustion_display() {
        let err = CoreError::ResourceExhaustion {
            resource: "user_friendly_names".to_string(),
        };
        assert_eq!(format!("{}", err), "out of user_friendly_names");
    }
}
