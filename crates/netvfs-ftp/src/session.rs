//! A mounted FTP session.
//!
//! The session owns everything the tasks share: the server address, the
//! connection pool, the capability handle and the directory cache.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::address::ServerAddress;
use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
use crate::capability::Capabilities;
use crate::config::{Credentials, SessionConfig};
use crate::connection::ConnectionConfig;
use crate::dir_cache::DirCache;
use crate::error::Result;
use crate::listing::ListingParser;
use crate::ops::Operations;
use crate::pool::{ConnectionPool, PoolStats};
use crate::task::Task;

/// A mounted session.
pub struct Session {
    address: ServerAddress,
    display_name: String,
    credentials: Credentials,
    connection: ConnectionConfig,
    capabilities: Arc<Capabilities>,
    pool: Arc<ConnectionPool>,
    dir_cache: DirCache,
    cancel: CancelToken,
    cancel_handle: CancelHandle,
}

impl Session {
    /// Connect, log in and probe the server.
    pub async fn mount(config: SessionConfig) -> Result<Self> {
        Self::mount_with_parser(config, None).await
    }

    /// Like [`mount`](Self::mount), with a listing parser that replaces the
    /// one picked for the server's dialect.
    pub async fn mount_with_parser(
        config: SessionConfig,
        parser: Option<Arc<dyn ListingParser>>,
    ) -> Result<Self> {
        config.validate()?;
        let capabilities = Arc::new(Capabilities::new());
        let (cancel, cancel_handle) = new_cancel_pair();
        let session = Session {
            address: ServerAddress::new(config.host.clone(), config.port),
            display_name: config.display_name(),
            credentials: config.credentials(),
            connection: config.connection_config(),
            capabilities: capabilities.clone(),
            pool: Arc::new(ConnectionPool::new(config.max_connections)),
            dir_cache: DirCache::new(capabilities, parser),
            cancel,
            cancel_handle,
        };
        info!(server = %session.display_name, user = %session.credentials.user, "mounting");

        let mut task = session.task();
        if let Err(err) = task.bind_connection(true).await {
            task.set_error(err);
        }
        task.done()?;

        info!(
            server = %session.display_name,
            features = %session.capabilities.features(),
            dialect = ?session.capabilities.dialect(),
            pinned = ?session.address.pinned(),
            "mounted"
        );
        Ok(session)
    }

    /// Start a task, cancelled when the session is unmounted.
    pub fn task(&self) -> Task<'_> {
        Task::new(self, self.cancel.clone())
    }

    /// Start a task with a caller supplied token, usually a child of
    /// [`cancel_token`](Self::cancel_token).
    pub fn task_with_cancel(&self, cancel: CancelToken) -> Task<'_> {
        Task::new(self, cancel)
    }

    /// Filesystem operations that run under `cancel`. Pass a child of
    /// [`cancel_token`](Self::cancel_token) so unmounting still stops them.
    pub fn with_cancel(&self, cancel: CancelToken) -> Operations<'_> {
        Operations::new(self, cancel)
    }

    /// Root token of the session; fires on unmount.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Server address, pinned to the mount connection's peer.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// `host` or `host:port`.
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Login credentials.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Socket settings.
    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.connection
    }

    /// Server capabilities and workarounds.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Connection pool.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Directory cache.
    pub fn dir_cache(&self) -> &DirCache {
        &self.dir_cache
    }

    /// Tear the session down: cancel running tasks, fail waiters and close
    /// idle connections.
    pub async fn unmount(&self) {
        self.cancel_handle.cancel(CancelReason::Unmounted);
        let idle = self.pool.shutdown();
        let closing = idle.len();
        for conn in idle {
            conn.quit().await;
        }
        self.dir_cache.clear();
        info!(server = %self.display_name, closed = closing, "unmounted");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.display_name)
            .field("credentials", &self.credentials)
            .field("capabilities", &self.capabilities)
            .field("pool", &self.pool)
            .finish()
    }
}
