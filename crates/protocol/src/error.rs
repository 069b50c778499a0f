//! The error taxonomy of §7: a typed enum at the crate boundary, the same
//! way `FrameError` anchors the precedent's binary frame parsing. Callers at
//! the application layer (HTTP handlers, the gateway) match on `kind()` to
//! pick a status code or wire-level `error` event; they otherwise propagate
//! via `anyhow::Result` with `.context(...)`.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("path escapes workspace: {0}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("conflict: server mtime is {server_mtime}")]
    Conflict { server_mtime: i64 },

    #[error("no sandbox for user")]
    NoSandbox,

    #[error("exec timed out after {0}s")]
    Timeout(u64),

    #[error("exec aborted")]
    Aborted,

    #[error("failed to spawn: {0}")]
    SpawnError(String),

    #[error("container runtime unavailable")]
    RuntimeUnavailable,

    #[error("sandbox image missing")]
    ImageMissing,

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Broad category used by HTTP/WS handlers to pick a status code or close
/// reason without re-deriving it from the specific variant each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    NotFound,
    Unauthorized,
    Forbidden,
    Conflict,
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidPath(_) | CoreError::Malformed(_) => ErrorKind::BadRequest,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Unauthorized => ErrorKind::Unauthorized,
            CoreError::Forbidden => ErrorKind::Forbidden,
            CoreError::Conflict { .. } => ErrorKind::Conflict,
            CoreError::NoSandbox
            | CoreError::Timeout(_)
            | CoreError::Aborted
            | CoreError::SpawnError(_) => ErrorKind::Internal,
            CoreError::RuntimeUnavailable | CoreError::ImageMissing => ErrorKind::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_errors_distinguish_kind() {
        assert_eq!(CoreError::Unauthorized.kind(), ErrorKind::Unauthorized);
        // Ownership leakage prevention: callers should map a foreign
        // session to NotFound, not Forbidden — this module only supplies
        // the raw kinds, the policy choice is made by the caller.
        assert_eq!(CoreError::Forbidden.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn conflict_carries_server_mtime() {
        let err = CoreError::Conflict { server_mtime: 42 };
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn timeout_message_includes_seconds() {
        let err = CoreError::Timeout(5);
        assert!(err.to_string().contains('5'));
    }
}
