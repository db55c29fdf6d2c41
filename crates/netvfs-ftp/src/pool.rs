//! Bounded, FIFO-fair pool of control connections.
//!
//! The pool does not open connections itself. `acquire` either hands out
//! an idle connection or a [`VacantSlot`]: a reservation that counts
//! towards the connection limit while the caller connects and logs in.
//! Dropping an unfilled slot gives the reservation back.
//!
//! All bookkeeping happens under one mutex; blocked callers park on a
//! oneshot channel and are served strictly in arrival order. Handing a
//! released connection to a waiter happens inside the same critical
//! section as the release.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::connection::ControlConnection;
use crate::error::{FtpError, Result};

/// Statistics about the connection pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections that exist or are being opened.
    pub live: usize,
    /// Connections waiting in the idle set.
    pub idle: usize,
    /// Callers blocked in `acquire`.
    pub waiting: usize,
    /// Current connection limit, `None` when unbounded.
    pub max_connections: Option<usize>,
    /// Slots filled with a freshly opened connection.
    pub opened: u64,
    /// Connections destroyed instead of being returned.
    pub discarded: u64,
}

enum Grant<C> {
    Conn(C),
    Slot,
}

struct PoolState<C> {
    idle: VecDeque<C>,
    live: usize,
    max: Option<usize>,
    waiters: VecDeque<oneshot::Sender<Grant<C>>>,
    closed: bool,
    opened: u64,
    discarded: u64,
}

impl<C> PoolState<C> {
    fn has_room(&self) -> bool {
        self.max.map_or(true, |max| self.live < max)
    }

    /// Hand `conn` to the first waiter still listening, else park it.
    fn hand_over(&mut self, conn: C) {
        let mut grant = Grant::Conn(conn);
        while let Some(tx) = self.waiters.pop_front() {
            match tx.send(grant) {
                Ok(()) => return,
                Err(back) => grant = back,
            }
        }
        if let Grant::Conn(conn) = grant {
            self.idle.push_back(conn);
        }
    }

    /// Give freed capacity to waiters.
    fn grant_slots(&mut self) {
        while self.has_room() {
            let Some(tx) = self.waiters.pop_front() else {
                return;
            };
            if tx.send(Grant::Slot).is_ok() {
                self.live += 1;
            }
        }
    }
}

/// Checkout result.
pub enum Checkout<'p, C> {
    /// A pooled connection, ready for use.
    Ready(C),
    /// Room for a new connection that the caller must open.
    Vacant(VacantSlot<'p, C>),
}

/// A reserved slot in the pool for a connection still being opened.
pub struct VacantSlot<'p, C> {
    pool: &'p ConnectionPool<C>,
    armed: bool,
}

impl<C> VacantSlot<'_, C> {
    /// The connection was opened; it is now checked out.
    pub fn fill(mut self) {
        self.armed = false;
        self.pool.lock().opened += 1;
    }

    /// Opening the connection failed although others are alive: the
    /// server limits concurrent logins. Lowers the limit to the current
    /// number of connections and reports whether waiting for one of them
    /// makes sense.
    pub fn forfeit_and_cap(mut self) -> bool {
        self.armed = false;
        let mut state = self.pool.lock();
        state.live -= 1;
        if state.live == 0 {
            state.grant_slots();
            return false;
        }
        if state.max.map_or(true, |max| max > state.live) {
            warn!(limit = state.live, "server refused another connection, capping pool");
            state.max = Some(state.live);
        }
        true
    }
}

impl<C> Drop for VacantSlot<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.lock();
            state.live -= 1;
            state.grant_slots();
        }
    }
}

/// A connection pool bound to one server.
pub struct ConnectionPool<C = ControlConnection> {
    state: Mutex<PoolState<C>>,
}

impl<C> ConnectionPool<C> {
    /// Create a pool; `max_connections` of `None` means unbounded.
    pub fn new(max_connections: Option<usize>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                live: 0,
                max: max_connections,
                waiters: VecDeque::new(),
                closed: false,
                opened: 0,
                discarded: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get an idle connection or room for a new one, waiting in line
    /// behind earlier callers when the pool is full.
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<Checkout<'_, C>> {
        cancel.check()?;
        let mut rx = {
            let mut state = self.lock();
            if state.closed {
                return Err(FtpError::PoolClosed);
            }
            state.waiters.retain(|tx| !tx.is_closed());
            if state.waiters.is_empty() {
                if let Some(conn) = state.idle.pop_front() {
                    return Ok(Checkout::Ready(conn));
                }
                if state.has_room() {
                    state.live += 1;
                    return Ok(Checkout::Vacant(VacantSlot {
                        pool: self,
                        armed: true,
                    }));
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(waiting = state.waiters.len(), "pool full, waiting for a connection");
            rx
        };

        let granted = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            grant = &mut rx => Some(grant),
        };
        match granted {
            None => {
                // a grant may have been sent just before the close
                rx.close();
                if let Ok(grant) = rx.try_recv() {
                    self.return_grant(grant);
                }
                Err(FtpError::Cancelled(cancel.cancelled_reason().unwrap_or_default()))
            }
            Some(Ok(Grant::Conn(conn))) => Ok(Checkout::Ready(conn)),
            Some(Ok(Grant::Slot)) => Ok(Checkout::Vacant(VacantSlot {
                pool: self,
                armed: true,
            })),
            Some(Err(_)) => Err(FtpError::PoolClosed),
        }
    }

    fn return_grant(&self, grant: Grant<C>) {
        match grant {
            Grant::Conn(conn) => self.release(conn),
            Grant::Slot => {
                let mut state = self.lock();
                state.live -= 1;
                state.grant_slots();
            }
        }
    }

    /// Return a healthy connection.
    pub fn release(&self, conn: C) {
        let mut state = self.lock();
        if state.closed || !state.max.map_or(true, |max| state.live <= max) {
            state.live -= 1;
            drop(state);
            drop(conn);
            return;
        }
        state.hand_over(conn);
    }

    /// Destroy a broken connection.
    pub fn discard(&self, conn: C) {
        drop(conn);
        let mut state = self.lock();
        state.live -= 1;
        state.discarded += 1;
        if !state.closed {
            state.grant_slots();
        }
    }

    /// Close the pool: waiters fail with [`FtpError::PoolClosed`], idle
    /// connections are returned for the caller to close. Connections still
    /// checked out are dropped when released.
    pub fn shutdown(&self) -> Vec<C> {
        let mut state = self.lock();
        state.closed = true;
        state.waiters.clear();
        let idle: Vec<C> = state.idle.drain(..).collect();
        state.live -= idle.len();
        idle
    }

    /// True after [`shutdown`](Self::shutdown).
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            waiting: state.waiters.iter().filter(|tx| !tx.is_closed()).count(),
            max_connections: state.max,
            opened: state.opened,
            discarded: state.discarded,
        }
    }
}

impl<C> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool").field("stats", &self.stats()).finish()
    }
}

/// A connection taken out of task management to outlive the task, e.g.
/// for a streaming read or write.
///
/// It must be handed back to a task with
/// [`Task::give_connection`](crate::task::Task::give_connection); dropping
/// it discards the connection.
pub struct DetachedConnection<C = ControlConnection> {
    conn: Option<C>,
    pool: Arc<ConnectionPool<C>>,
}

impl<C> DetachedConnection<C> {
    /// Detach `conn`, still counted against `pool`.
    pub fn new(conn: C, pool: Arc<ConnectionPool<C>>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }

    /// The connection.
    pub fn connection_mut(&mut self) -> Result<&mut C> {
        self.conn.as_mut().ok_or(FtpError::ConnectionClosed)
    }

    /// Take back ownership.
    pub fn into_inner(mut self) -> Result<C> {
        self.conn.take().ok_or(FtpError::ConnectionClosed)
    }
}

impl<C> fmt::Debug for DetachedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedConnection")
            .field("attached", &self.conn.is_some())
            .finish()
    }
}

impl<C> Drop for DetachedConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("detached connection dropped without being given back, discarding");
            self.pool.discard(conn);
        }
    }
}
