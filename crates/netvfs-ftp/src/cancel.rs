//! Cooperative cancellation for in-flight tasks.
//!
//! Every blocking point of a task (connection checkout, reply reads, data
//! transfers, waiting on another task's directory fetch) races against a
//! [`CancelToken`]. A cancelled control connection is never reused.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{FtpError, Result};

/// Reasons for cancelling a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelReason {
    /// Explicit cancellation by the caller.
    #[default]
    UserRequested,
    /// The session is being unmounted.
    Unmounted,
    /// The caller's deadline expired.
    DeadlineExceeded,
    /// A newer request supersedes this one.
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "UserRequested"),
            CancelReason::Unmounted => write!(f, "Unmounted"),
            CancelReason::DeadlineExceeded => write!(f, "DeadlineExceeded"),
            CancelReason::Superseded => write!(f, "Superseded"),
        }
    }
}

/// A cloneable cancellation token handed to tasks.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
    parent: Option<Box<CancelToken>>,
}

/// The handle that triggers cancellation.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    inner: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let inner = CancellationToken::new();
    let reason = Arc::new(Mutex::new(None));
    (
        CancelToken {
            inner: inner.clone(),
            reason: reason.clone(),
            parent: None,
        },
        CancelHandle { inner, reason },
    )
}

impl CancelToken {
    /// A token whose handle has been dropped; it is never cancelled.
    pub fn never() -> Self {
        new_cancel_pair().0
    }

    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Get the cancellation reason if cancelled.
    ///
    /// A child cancelled through its parent reports the parent's reason.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        let own = self.reason.lock().ok().and_then(|r| *r);
        own.or_else(|| self.parent.as_ref().and_then(|p| p.cancelled_reason()))
            .or(Some(CancelReason::default()))
    }

    /// Create a child token that is cancelled when the parent is cancelled,
    /// but can also be cancelled independently.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let inner = self.inner.child_token();
        let reason = Arc::new(Mutex::new(None));
        (
            CancelToken {
                inner: inner.clone(),
                reason: reason.clone(),
                parent: Some(Box::new(self.clone())),
            },
            CancelHandle { inner, reason },
        )
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    /// Fail with [`FtpError::Cancelled`] if the token is already cancelled.
    pub fn check(&self) -> Result<()> {
        match self.cancelled_reason() {
            Some(reason) => Err(FtpError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Run `fut` to completion unless the token fires first.
    ///
    /// Cancellation wins if both are ready at the same poll.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.inner.cancelled() => Err(FtpError::Cancelled(
                self.cancelled_reason().unwrap_or_default(),
            )),
            res = fut => res,
        }
    }
}

impl CancelHandle {
    /// Trigger cancellation with the given reason. The first reason sticks.
    pub fn cancel(&self, reason: CancelReason) {
        if let Ok(mut r) = self.reason.lock() {
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.inner.cancel();
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}
