//! Error types for the FTP engine.
//!
//! Errors fall into five families: transport failures (the control
//! connection is unusable and must be discarded), protocol failures (the
//! server said something we could not make sense of), classified remote
//! failures (a 4xx/5xx reply nobody resolved into something better),
//! semantic failures (produced by error handlers or operations) and
//! cancellation.

use std::fmt;

use thiserror::Error;

use crate::cancel::CancelReason;

/// Well-known meanings of failure reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// 332, 532: the server wants an ACCT command.
    AccountsUnsupported,
    /// 421: service not available, control connection closing.
    HostClosed,
    /// 425: data connection could not be opened.
    DataConnection,
    /// 426: data connection closed, transfer aborted.
    DataConnectionClosed,
    /// 450, 451, 550: the catch-all "action not taken".
    OperationFailed,
    /// 452, 552: out of storage on the server.
    NoSpace,
    /// 500-504: command unknown or not implemented.
    Unsupported,
    /// 530: not logged in.
    NotLoggedIn,
    /// 551: page type unknown.
    PageTypeUnknown,
    /// 553: file name not allowed.
    InvalidFilename,
    /// Anything else.
    InvalidReply,
}

impl RemoteErrorKind {
    /// Map a reply code to its well-known meaning.
    pub fn from_code(code: u16) -> Self {
        match code {
            332 | 532 => RemoteErrorKind::AccountsUnsupported,
            421 => RemoteErrorKind::HostClosed,
            425 => RemoteErrorKind::DataConnection,
            426 => RemoteErrorKind::DataConnectionClosed,
            450 | 451 | 550 => RemoteErrorKind::OperationFailed,
            452 | 552 => RemoteErrorKind::NoSpace,
            500..=504 => RemoteErrorKind::Unsupported,
            530 => RemoteErrorKind::NotLoggedIn,
            551 => RemoteErrorKind::PageTypeUnknown,
            553 => RemoteErrorKind::InvalidFilename,
            _ => RemoteErrorKind::InvalidReply,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RemoteErrorKind::AccountsUnsupported => "accounts are unsupported",
            RemoteErrorKind::HostClosed => "host closed connection",
            RemoteErrorKind::DataConnection => "cannot open data connection",
            RemoteErrorKind::DataConnectionClosed => "data connection closed",
            RemoteErrorKind::OperationFailed => "operation failed",
            RemoteErrorKind::NoSpace => "no space left on server",
            RemoteErrorKind::Unsupported => "operation unsupported",
            RemoteErrorKind::NotLoggedIn => "permission denied",
            RemoteErrorKind::PageTypeUnknown => "page type unknown",
            RemoteErrorKind::InvalidFilename => "invalid filename",
            RemoteErrorKind::InvalidReply => "invalid reply",
        };
        f.write_str(msg)
    }
}

/// Errors produced by the engine and the filesystem operations.
#[derive(Debug, Error)]
pub enum FtpError {
    /// Low-level socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Nobody is listening at the server address.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Address that refused the connection.
        addr: String,
    },

    /// Connecting or waiting for a reply took too long.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address of the peer.
        addr: String,
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// The server closed the control connection.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// A reply line could not be parsed.
    #[error("malformed reply: {line:?}")]
    MalformedReply {
        /// The offending line.
        line: String,
    },

    /// A success reply arrived where the command must not succeed yet.
    #[error("invalid reply {code}: {}", .lines.join(" "))]
    UnexpectedReply {
        /// Raw status code.
        code: u16,
        /// Raw reply lines.
        lines: Vec<String>,
    },

    /// A failure reply that no handler resolved into something specific.
    #[error("{kind} ({code}): {}", .lines.join(" "))]
    Remote {
        /// Raw status code.
        code: u16,
        /// Well-known meaning of `code`.
        kind: RemoteErrorKind,
        /// Raw reply lines.
        lines: Vec<String>,
    },

    /// The directory listing could not be parsed.
    #[error("unparseable directory listing line: {line:?}")]
    InvalidListing {
        /// The offending line.
        line: String,
    },

    /// File does not exist.
    #[error("no such file or directory: {path}")]
    NotFound {
        /// Virtual path.
        path: String,
    },

    /// File exists but the server refuses access.
    #[error("permission denied: {path}")]
    PermissionDenied {
        /// Virtual path.
        path: String,
    },

    /// Target is a directory.
    #[error("is a directory: {path}")]
    IsDirectory {
        /// Virtual path.
        path: String,
    },

    /// Target is not a directory.
    #[error("not a directory: {path}")]
    NotDirectory {
        /// Virtual path.
        path: String,
    },

    /// Target already exists.
    #[error("target already exists: {path}")]
    AlreadyExists {
        /// Virtual path.
        path: String,
    },

    /// Directory is not empty.
    #[error("directory not empty: {path}")]
    NotEmpty {
        /// Virtual path.
        path: String,
    },

    /// Name cannot be used as a file name.
    #[error("invalid filename: {name:?}")]
    InvalidFilename {
        /// The rejected name.
        name: String,
    },

    /// Operation is not supported by this backend.
    #[error("operation not supported: {op}")]
    NotSupported {
        /// Operation name.
        op: String,
    },

    /// The operation was cancelled.
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// The session was unmounted while waiting for a connection.
    #[error("connection pool closed")]
    PoolClosed,

    /// Configuration is invalid.
    #[error("configuration error: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FtpError>;

impl FtpError {
    /// Build the generic error for a failure reply.
    pub fn remote(code: u16, lines: &[String]) -> Self {
        FtpError::Remote {
            code,
            kind: RemoteErrorKind::from_code(code),
            lines: lines.to_vec(),
        }
    }

    /// Status code of a classified remote failure, if this is one.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            FtpError::Remote { code, .. } | FtpError::UnexpectedReply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True for errors that leave the control connection in an unknown state.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FtpError::Io(_)
                | FtpError::ConnectionRefused { .. }
                | FtpError::ConnectionTimeout { .. }
                | FtpError::ConnectionClosed
                | FtpError::MalformedReply { .. }
                | FtpError::Cancelled(_)
        )
    }

    /// True if this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FtpError::Cancelled(_))
    }

    /// POSIX errno equivalent.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FtpError::Io(e) => e.raw_os_error().unwrap_or(EIO),
            FtpError::ConnectionRefused { .. } => ECONNREFUSED,
            FtpError::ConnectionTimeout { .. } => ETIMEDOUT,
            FtpError::ConnectionClosed => ECONNRESET,
            FtpError::MalformedReply { .. } => EPROTO,
            FtpError::UnexpectedReply { .. } => EPROTO,
            FtpError::Remote { kind, .. } => match kind {
                RemoteErrorKind::AccountsUnsupported | RemoteErrorKind::Unsupported => ENOTSUP,
                RemoteErrorKind::HostClosed => ECONNRESET,
                RemoteErrorKind::DataConnection | RemoteErrorKind::DataConnectionClosed => EPIPE,
                RemoteErrorKind::NoSpace => ENOSPC,
                RemoteErrorKind::NotLoggedIn => EACCES,
                RemoteErrorKind::InvalidFilename => EINVAL,
                RemoteErrorKind::OperationFailed
                | RemoteErrorKind::PageTypeUnknown
                | RemoteErrorKind::InvalidReply => EIO,
            },
            FtpError::InvalidListing { .. } => EPROTO,
            FtpError::NotFound { .. } => ENOENT,
            FtpError::PermissionDenied { .. } => EACCES,
            FtpError::IsDirectory { .. } => EISDIR,
            FtpError::NotDirectory { .. } => ENOTDIR,
            FtpError::AlreadyExists { .. } => EEXIST,
            FtpError::NotEmpty { .. } => ENOTEMPTY,
            FtpError::InvalidFilename { .. } => EINVAL,
            FtpError::NotSupported { .. } => ENOTSUP,
            FtpError::Cancelled(_) => ECANCELED,
            FtpError::PoolClosed => ESHUTDOWN,
            FtpError::Config { .. } => EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_kind_mapping() {
        assert_eq!(RemoteErrorKind::from_code(332), RemoteErrorKind::AccountsUnsupported);
        assert_eq!(RemoteErrorKind::from_code(532), RemoteErrorKind::AccountsUnsupported);
        assert_eq!(RemoteErrorKind::from_code(421), RemoteErrorKind::HostClosed);
        assert_eq!(RemoteErrorKind::from_code(550), RemoteErrorKind::OperationFailed);
        assert_eq!(RemoteErrorKind::from_code(552), RemoteErrorKind::NoSpace);
        assert_eq!(RemoteErrorKind::from_code(502), RemoteErrorKind::Unsupported);
        assert_eq!(RemoteErrorKind::from_code(530), RemoteErrorKind::NotLoggedIn);
        assert_eq!(RemoteErrorKind::from_code(553), RemoteErrorKind::InvalidFilename);
        assert_eq!(RemoteErrorKind::from_code(599), RemoteErrorKind::InvalidReply);
    }

    #[test]
    fn test_remote_error_carries_code_and_text() {
        let err = FtpError::remote(550, &["550 No such file".to_string()]);
        assert_eq!(err.reply_code(), Some(550));
        let msg = err.to_string();
        assert!(msg.contains("550"));
        assert!(msg.contains("No such file"));
    }

    #[test]
    fn test_transport_classification() {
        assert!(FtpError::ConnectionClosed.is_transport());
        assert!(FtpError::Cancelled(CancelReason::UserRequested).is_transport());
        assert!(!FtpError::remote(550, &[]).is_transport());
        assert!(!FtpError::NotFound { path: "/x".into() }.is_transport());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FtpError::NotFound { path: "/a".into() }.to_errno(), libc::ENOENT);
        assert_eq!(FtpError::PermissionDenied { path: "/a".into() }.to_errno(), libc::EACCES);
        assert_eq!(FtpError::IsDirectory { path: "/a".into() }.to_errno(), libc::EISDIR);
        assert_eq!(FtpError::NotEmpty { path: "/a".into() }.to_errno(), libc::ENOTEMPTY);
        assert_eq!(FtpError::AlreadyExists { path: "/a".into() }.to_errno(), libc::EEXIST);
        assert_eq!(FtpError::remote(552, &[]).to_errno(), libc::ENOSPC);
        assert_eq!(FtpError::Cancelled(CancelReason::Unmounted).to_errno(), libc::ECANCELED);
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            FtpError::ConnectionClosed,
            FtpError::PoolClosed,
            FtpError::MalformedReply { line: "xyz".into() },
            FtpError::NotSupported { op: "backup".into() },
            FtpError::Config { reason: "empty host".into() },
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
