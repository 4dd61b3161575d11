use std::fmt;

/// Coarse classification every error in this crate maps to.
///
/// Configuration and user-compile failures are deterministic and are never worth
/// retrying. Process and protocol failures come from a daemon misbehaving and may
/// succeed on a fresh daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Protocol,
    Process,
    UserCompile,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Protocol | ErrorKind::Process)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration error"),
            ErrorKind::Protocol => write!(f, "protocol error"),
            ErrorKind::Process => write!(f, "process error"),
            ErrorKind::UserCompile => write!(f, "compile error"),
        }
    }
}
