//! One in-flight operation against the server.
//!
//! A [`Task`] borrows a control connection from the session pool the first
//! time it needs one and gives it back in [`Task::done`]. It accumulates at
//! most one error: commands keep being sent after a failure (callers check
//! [`Task::is_in_error`] themselves), but only the first error, or a later
//! cancellation, is reported.

use std::net::SocketAddr;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::capability::{Feature, Features, SystemDialect, Workaround};
use crate::connection::{parse_epsv, parse_pasv, ControlConnection};
use crate::error::{FtpError, RemoteErrorKind, Result};
use crate::handlers::{ErrorHandler, Resolution};
use crate::path::FtpPath;
use crate::pool::{Checkout, DetachedConnection};
use crate::reply::{Reply, ReplyClass, ResponseFlags};
use crate::session::Session;

/// An operation in progress.
pub struct Task<'s> {
    session: &'s Session,
    conn: Option<ControlConnection>,
    /// Whether `conn` is accounted for in the pool. False while a freshly
    /// opened connection still sits in its vacant slot.
    counted: bool,
    error: Option<FtpError>,
    cancel: CancelToken,
}

impl<'s> Task<'s> {
    pub(crate) fn new(session: &'s Session, cancel: CancelToken) -> Self {
        Self {
            session,
            conn: None,
            counted: false,
            error: None,
            cancel,
        }
    }

    /// Session this task runs in.
    pub fn session(&self) -> &'s Session {
        self.session
    }

    /// Cancellation token of this task.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// True once an error was recorded.
    pub fn is_in_error(&self) -> bool {
        self.error.is_some()
    }

    /// The recorded error.
    pub fn error(&self) -> Option<&FtpError> {
        self.error.as_ref()
    }

    /// Record `err`. The first error sticks, except that a cancellation
    /// replaces anything else.
    pub fn set_error(&mut self, err: FtpError) {
        match &self.error {
            None => self.error = Some(err),
            Some(existing) if err.is_cancelled() && !existing.is_cancelled() => {
                self.error = Some(err)
            }
            Some(_) => debug!(error = %err, "task already failed, ignoring error"),
        }
    }

    /// Forget the recorded error.
    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Forget the recorded error unless it is a cancellation.
    pub fn clear_recoverable_error(&mut self) {
        if !self.error.as_ref().map_or(false, FtpError::is_cancelled) {
            self.error = None;
        }
    }

    /// Take the recorded error out of the task.
    pub fn take_error(&mut self) -> Option<FtpError> {
        self.error.take()
    }

    /// Turn the task's state into a result, leaving it error free.
    pub fn check(&mut self) -> Result<()> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: FtpError) {
        if err.is_transport() {
            self.drop_connection();
        }
        self.set_error(err);
    }

    /// Destroy the current connection.
    fn drop_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(peer = %conn.peer_addr(), "dropping control connection");
            if self.counted {
                self.session.pool().discard(conn);
            }
        }
        self.counted = false;
    }

    /// Peer address of the bound connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().map(ControlConnection::peer_addr)
    }

    /// Make sure a logged-in connection is bound, taking one from the pool
    /// or opening a new one.
    pub async fn ensure_connection(&mut self) -> Result<()> {
        self.bind_connection(false).await
    }

    /// Like [`ensure_connection`](Self::ensure_connection) but also runs
    /// feature discovery and dialect detection on a new connection.
    pub(crate) async fn bind_connection(&mut self, discover: bool) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        self.cancel.check()?;
        let session = self.session;
        loop {
            match session.pool().acquire(&self.cancel).await? {
                Checkout::Ready(conn) => {
                    self.conn = Some(conn);
                    self.counted = true;
                    return Ok(());
                }
                Checkout::Vacant(slot) => match self.open_connection(discover).await {
                    Ok(()) => {
                        slot.fill();
                        self.counted = true;
                        return Ok(());
                    }
                    Err(err) => {
                        self.conn = None;
                        if err.is_cancelled() || !slot.forfeit_and_cap() {
                            return Err(err);
                        }
                        debug!(error = %err, "could not open another connection, waiting for one");
                    }
                },
            }
        }
    }

    async fn open_connection(&mut self, discover: bool) -> Result<()> {
        let session = self.session;
        let conn = self
            .cancel
            .run(ControlConnection::connect(
                session.address(),
                session.connection_config(),
            ))
            .await?;
        self.conn = Some(conn);
        self.counted = false;

        let mut greeting = self.roundtrip(None).await?;
        while greeting.class() == ReplyClass::Preliminary {
            greeting = self.roundtrip(None).await?;
        }
        ResponseFlags::NONE.check(&greeting)?;

        let caps = session.capabilities();
        if discover {
            let reply = self.roundtrip(Some("FEAT")).await?;
            match ResponseFlags::NONE.check(&reply) {
                Ok(()) => caps.set_features(Features::parse(&reply)),
                Err(_) => {
                    caps.enable_workaround(Workaround::FeatAfterLogin);
                }
            }
        }

        self.login().await?;

        if discover && caps.has_workaround(Workaround::FeatAfterLogin) {
            let reply = self.roundtrip(Some("FEAT")).await?;
            let features = match ResponseFlags::NONE.check(&reply) {
                Ok(()) => Features::parse(&reply),
                Err(_) => Features::empty(),
            };
            caps.set_features(features);
        }

        self.setup_connection().await?;

        if discover {
            let reply = self.roundtrip(Some("SYST")).await?;
            let dialect = match ResponseFlags::NONE.check(&reply) {
                Ok(()) => SystemDialect::detect(&reply),
                Err(_) => SystemDialect::Unknown,
            };
            caps.set_dialect(dialect);
            if let Some(peer) = self.peer_addr() {
                session.address().pin(peer);
            }
        }
        Ok(())
    }

    async fn login(&mut self) -> Result<()> {
        let session = self.session;
        let creds = session.credentials();
        let reply = self.roundtrip(Some(&format!("USER {}", creds.user))).await?;
        ResponseFlags::PASS_300.check(&reply)?;
        if reply.class() == ReplyClass::Intermediate {
            if reply.code == 332 {
                return Err(accounts_unsupported(&reply));
            }
            let reply = self
                .roundtrip(Some(&format!("PASS {}", creds.password)))
                .await?;
            ResponseFlags::PASS_300.check(&reply)?;
            if reply.class() == ReplyClass::Intermediate {
                return Err(accounts_unsupported(&reply));
            }
        }
        debug!(user = %creds.user, "logged in");
        Ok(())
    }

    async fn setup_connection(&mut self) -> Result<()> {
        let reply = self.roundtrip(Some("TYPE I")).await?;
        ResponseFlags::NONE.check(&reply)?;
        if self.session.capabilities().has_feature(Feature::Utf8) {
            let reply = self.roundtrip(Some("OPTS UTF8 ON")).await?;
            if let Err(err) = ResponseFlags::NONE.check(&reply) {
                debug!(error = %err, "server refused UTF-8 mode");
            }
        }
        Ok(())
    }

    /// Send `command` (or nothing) and read one reply on the bound
    /// connection, racing the task's cancellation. Transport failures
    /// destroy the connection.
    async fn roundtrip(&mut self, command: Option<&str>) -> Result<Reply> {
        let cancel = self.cancel.clone();
        let conn = self.conn.as_mut().ok_or(FtpError::ConnectionClosed)?;
        let res = cancel
            .run(async {
                if let Some(cmd) = command {
                    conn.send_command(cmd).await?;
                }
                conn.read_reply().await
            })
            .await;
        match res {
            Err(err) if err.is_transport() => {
                self.drop_connection();
                Err(err)
            }
            Ok(reply) if reply.code == 421 => {
                // the server is closing the control connection
                self.drop_connection();
                Ok(reply)
            }
            other => other,
        }
    }

    async fn exchange(&mut self, flags: ResponseFlags, command: Option<&str>) -> Option<Reply> {
        match self.roundtrip(command).await {
            Ok(reply) => {
                if let Err(err) = flags.check(&reply) {
                    self.set_error(err);
                }
                Some(reply)
            }
            Err(err) => {
                self.set_error(err);
                None
            }
        }
    }

    /// Send one command and read its reply.
    ///
    /// A reply outside `flags` records an error; the reply is returned
    /// either way. `None` means no reply was read.
    pub async fn command(&mut self, flags: ResponseFlags, command: &str) -> Option<Reply> {
        if let Err(err) = self.ensure_connection().await {
            self.set_error(err);
            return None;
        }
        self.exchange(flags, Some(command)).await
    }

    /// Send one command and return the raw status, 0 if there was no
    /// reply.
    pub async fn send(&mut self, flags: ResponseFlags, command: &str) -> u16 {
        self.command(flags, command).await.map_or(0, |r| r.code)
    }

    /// Read a reply without sending anything, e.g. the final reply of a
    /// transfer.
    pub async fn receive_reply(&mut self, flags: ResponseFlags) -> Option<Reply> {
        if self.conn.is_none() {
            self.set_error(FtpError::ConnectionClosed);
            return None;
        }
        self.exchange(flags, None).await
    }

    /// Status-only form of [`receive_reply`](Self::receive_reply).
    pub async fn receive(&mut self, flags: ResponseFlags) -> u16 {
        self.receive_reply(flags).await.map_or(0, |r| r.code)
    }

    /// [`send`](Self::send), then let `handlers` turn a generic failure
    /// into a specific one.
    ///
    /// Handlers run in order; each may look things up through the task.
    /// The first one that decides wins. If none does, the original error
    /// is kept.
    pub async fn send_and_check(
        &mut self,
        flags: ResponseFlags,
        handlers: &[ErrorHandler],
        path: &FtpPath,
        command: &str,
    ) -> u16 {
        let status = self.send(flags, command).await;
        let code = match &self.error {
            Some(FtpError::Remote { code, .. }) if !handlers.is_empty() => *code,
            _ => return status,
        };
        let Some(original) = self.error.take() else {
            return status;
        };
        for handler in handlers.iter().filter(|h| h.code() == code) {
            let resolution = handler.resolve(self, path).await;
            let side_error = self.error.take();
            if let Some(err) = side_error.filter(FtpError::is_cancelled) {
                self.error = Some(err);
                return status;
            }
            if let Resolution::Resolved(err) = resolution {
                debug!(?handler, error = %err, "reply resolved by handler");
                self.error = Some(err);
                return status;
            }
        }
        self.error = Some(original);
        status
    }

    /// Change the working directory; a 550 becomes `NotDirectory`.
    pub async fn cd(&mut self, dir: &FtpPath) -> u16 {
        let status = self
            .send(ResponseFlags::PASS_550, &format!("CWD {}", dir.to_native()))
            .await;
        if status == 550 {
            self.set_error(FtpError::NotDirectory {
                path: dir.to_string(),
            });
            return 0;
        }
        status
    }

    /// Whether `dir` is a directory we can change into. Errors from the
    /// attempt are cleared.
    pub async fn try_cd(&mut self, dir: &FtpPath) -> bool {
        if self.is_in_error() {
            return false;
        }
        if self.cd(dir).await == 0 || self.is_in_error() {
            self.clear_recoverable_error();
            return false;
        }
        true
    }

    /// Open a passive data connection: EPSV when possible, else PASV.
    pub async fn open_data_connection(&mut self) {
        if self.is_in_error() {
            return;
        }
        if let Err(err) = self.ensure_connection().await {
            self.set_error(err);
            return;
        }
        let session = self.session;
        let caps = session.capabilities();
        if caps.has_feature(Feature::Epsv) && !caps.has_workaround(Workaround::NoEpsv) {
            match self.open_data_epsv().await {
                Ok(()) => return,
                Err(err) if err.is_cancelled() || (err.is_transport() && self.conn.is_none()) => {
                    self.fail(err);
                    return;
                }
                Err(err) => {
                    debug!(error = %err, "EPSV failed, falling back to PASV");
                    caps.enable_workaround(Workaround::NoEpsv);
                }
            }
        }
        if let Err(err) = self.open_data_pasv().await {
            self.fail(err);
        }
    }

    async fn open_data_epsv(&mut self) -> Result<()> {
        let reply = self.roundtrip(Some("EPSV")).await?;
        ResponseFlags::NONE.check(&reply)?;
        let port = parse_epsv(&reply).ok_or_else(|| FtpError::remote(reply.code, &reply.lines))?;
        let conn = self.conn.as_mut().ok_or(FtpError::ConnectionClosed)?;
        let addr = SocketAddr::new(conn.peer_addr().ip(), port);
        self.cancel.run(conn.open_data(addr)).await
    }

    async fn open_data_pasv(&mut self) -> Result<()> {
        let reply = self.roundtrip(Some("PASV")).await?;
        ResponseFlags::NONE.check(&reply)?;
        let mut addr =
            parse_pasv(&reply).ok_or_else(|| FtpError::remote(reply.code, &reply.lines))?;
        let session = self.session;
        let caps = session.capabilities();
        let conn = self.conn.as_mut().ok_or(FtpError::ConnectionClosed)?;
        let peer_ip = conn.peer_addr().ip();
        if caps.has_workaround(Workaround::PasvAddr) {
            addr.set_ip(peer_ip);
        }
        match self.cancel.run(conn.open_data(addr)).await {
            Err(err) if !err.is_cancelled() && addr.ip() != peer_ip => {
                warn!(advertised = %addr, peer = %peer_ip, error = %err,
                    "PASV address unreachable, retrying with control peer");
                addr.set_ip(peer_ip);
                self.cancel.run(conn.open_data(addr)).await?;
                caps.enable_workaround(Workaround::PasvAddr);
                Ok(())
            }
            other => other,
        }
    }

    /// Read from the data connection; 0 at end of data or on error.
    pub async fn read_data(&mut self, buf: &mut [u8]) -> usize {
        let cancel = self.cancel.clone();
        let res = match self.conn.as_mut().and_then(ControlConnection::data_mut) {
            Some(data) => cancel.run(data.read(buf)).await,
            None => Err(FtpError::ConnectionClosed),
        };
        match res {
            Ok(n) => n,
            Err(err) => {
                self.fail(err);
                0
            }
        }
    }

    /// Read the data connection until the server closes it.
    pub async fn read_all_data(&mut self) -> Vec<u8> {
        let cancel = self.cancel.clone();
        let res = match self.conn.as_mut().and_then(ControlConnection::data_mut) {
            Some(data) => cancel.run(data.read_to_end()).await,
            None => Err(FtpError::ConnectionClosed),
        };
        match res {
            Ok(bytes) => bytes,
            Err(err) => {
                self.fail(err);
                Vec::new()
            }
        }
    }

    /// Write all of `buf` to the data connection.
    pub async fn write_data(&mut self, buf: &[u8]) {
        let cancel = self.cancel.clone();
        let res = match self.conn.as_mut().and_then(ControlConnection::data_mut) {
            Some(data) => cancel.run(data.write_all(buf)).await,
            None => Err(FtpError::ConnectionClosed),
        };
        if let Err(err) = res {
            self.fail(err);
        }
    }

    /// Close the data connection, if one is open.
    pub async fn close_data_connection(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.close_data().await;
        }
    }

    /// Detach the connection so it can outlive this task.
    pub fn take_connection(&mut self) -> Option<DetachedConnection> {
        if !self.counted {
            return None;
        }
        let conn = self.conn.take()?;
        self.counted = false;
        Some(DetachedConnection::new(conn, self.session.pool().clone()))
    }

    /// Resume ownership of a connection detached by an earlier task.
    pub fn give_connection(&mut self, detached: DetachedConnection) {
        if let Some(current) = self.conn.take() {
            if self.counted {
                self.session.pool().release(current);
            }
        }
        match detached.into_inner() {
            Ok(conn) => {
                self.conn = Some(conn);
                self.counted = true;
            }
            Err(err) => {
                self.counted = false;
                self.set_error(err);
            }
        }
    }

    /// Finish the task: hand the connection back and report the outcome.
    pub fn done(mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            if self.counted {
                if conn.has_data() {
                    self.session.pool().discard(conn);
                } else {
                    self.session.pool().release(conn);
                }
            }
            self.counted = false;
        }
        match self.error.take() {
            Some(err) => Err(err),
            None => self.cancel.check(),
        }
    }
}

impl Drop for Task<'_> {
    fn drop(&mut self) {
        // dropped mid-command: the protocol state is unknown
        self.drop_connection();
    }
}

fn accounts_unsupported(reply: &Reply) -> FtpError {
    FtpError::Remote {
        code: reply.code,
        kind: RemoteErrorKind::AccountsUnsupported,
        lines: reply.lines.clone(),
    }
}
