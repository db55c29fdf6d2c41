//! Error handlers for ambiguous failure replies.
//!
//! Servers answer 550 for "no such file", "permission denied", "is a
//! directory" and more. A handler looks at the target path, usually
//! through the directory cache, and either names the real problem or
//! declines.

use crate::error::FtpError;
use crate::path::FtpPath;
use crate::task::Task;

/// What a handler decided.
#[derive(Debug)]
pub enum Resolution {
    /// Replace the generic error with this one.
    Resolved(FtpError),
    /// The handler does not apply; try the next one.
    NotApplicable,
}

/// One entry of a handler chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorHandler {
    /// The target is a directory (links followed).
    IsDirectory,
    /// The target exists: permission denied. Otherwise: not found. Always
    /// decides.
    PermissionOrNotFound,
    /// The target already exists.
    Exists,
    /// The parent directory is missing.
    ParentNotFound,
}

impl ErrorHandler {
    /// Reply code this handler looks at.
    pub fn code(&self) -> u16 {
        550
    }

    /// Try to resolve the failure for `path`.
    ///
    /// Errors from lookups are left on the task for the caller to sort out.
    pub async fn resolve(&self, task: &mut Task<'_>, path: &FtpPath) -> Resolution {
        let cache = task.session().dir_cache();
        let target = path.to_string();
        match self {
            ErrorHandler::IsDirectory => match cache.lookup_file(task, path, true).await {
                Ok(Some(info)) if info.is_dir() => Resolution::Resolved(FtpError::IsDirectory { path: target }),
                Err(err) if err.is_cancelled() => Resolution::Resolved(err),
                _ => Resolution::NotApplicable,
            },
            ErrorHandler::PermissionOrNotFound => match cache.lookup_file(task, path, false).await {
                Ok(Some(_)) => Resolution::Resolved(FtpError::PermissionDenied { path: target }),
                Err(err) if err.is_cancelled() => Resolution::Resolved(err),
                _ => Resolution::Resolved(FtpError::NotFound { path: target }),
            },
            ErrorHandler::Exists => match cache.lookup_file(task, path, false).await {
                Ok(Some(_)) => Resolution::Resolved(FtpError::AlreadyExists { path: target }),
                Err(err) if err.is_cancelled() => Resolution::Resolved(err),
                _ => Resolution::NotApplicable,
            },
            ErrorHandler::ParentNotFound => {
                let Some(parent) = path.parent() else {
                    return Resolution::NotApplicable;
                };
                if task.try_cd(&parent).await {
                    return Resolution::NotApplicable;
                }
                match task.take_error() {
                    Some(err) if err.is_cancelled() => Resolution::Resolved(err),
                    _ => Resolution::Resolved(FtpError::NotFound {
                        path: parent.to_string(),
                    }),
                }
            }
        }
    }
}
