//! Error types for Passage

use std::fmt;

/// Unified error type for all Passage operations
///
/// Every variant has a well-defined effect at the connection level (see
/// the connection dispatcher): protocol errors disconnect the whole
/// connection, auth errors produce USERAUTH_FAILURE, resource and policy
/// errors fail a single channel while the connection survives, and I/O
/// errors tear the connection down silently.
#[derive(Debug)]
pub enum PassageError {
    /// Malformed packet, bad MAC, window violation, unknown required
    /// algorithm. The connection replies with SSH_MSG_DISCONNECT and
    /// closes.
    Protocol(String),

    /// Credential invalid or authentication attempt budget exceeded.
    Auth(String),

    /// Too many channels, send queue overflow, memory pressure. Fails
    /// the operation (usually one channel); the connection survives.
    Resource(String),

    /// Policy denies a channel type or operation.
    AdminProhibited(String),

    /// A child process could not be started.
    Spawn(String),

    /// Socket closed or non-recoverable read/write error. Torn down
    /// without sending a packet.
    Io(std::io::Error),

    /// Configuration error (bad host key file, invalid listener setup).
    Config(String),

    /// Invariant violated; indicates a bug.
    Internal(String),
}

impl fmt::Display for PassageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassageError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PassageError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            PassageError::Resource(msg) => write!(f, "Resource exhaustion: {}", msg),
            PassageError::AdminProhibited(msg) => write!(f, "Administratively prohibited: {}", msg),
            PassageError::Spawn(msg) => write!(f, "Spawn error: {}", msg),
            PassageError::Io(e) => write!(f, "IO error: {}", e),
            PassageError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PassageError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for PassageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PassageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PassageError {
    fn from(err: std::io::Error) -> Self {
        PassageError::Io(err)
    }
}

/// Result type for Passage operations
pub type PassageResult<T> = Result<T, PassageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PassageError::Protocol("bad padding".to_string());
        assert_eq!(err.to_string(), "Protocol error: bad padding");

        let err = PassageError::AdminProhibited("direct-tcpip".to_string());
        assert_eq!(err.to_string(), "Administratively prohibited: direct-tcpip");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: PassageError = io_err.into();
        assert!(matches!(err, PassageError::Io(_)));
    }

    #[test]
    fn test_result_type() {
        fn example() -> PassageResult<u32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}
