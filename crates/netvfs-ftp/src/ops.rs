//! Filesystem operations.
//!
//! Each operation runs one [`Task`](crate::task::Task): a handful of
//! commands, a handler chain for the ambiguous replies, cache purges for
//! whatever it changed, and exactly one outcome from `done`.
//!
//! Operations live on [`Operations`], which carries the cancellation token
//! its tasks run under. The methods of the same name on [`Session`] use the
//! session's root token, so only unmounting stops them.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{FtpError, Result};
use crate::handlers::ErrorHandler;
use crate::metadata::FileInfo;
use crate::path::FtpPath;
use crate::pool::DetachedConnection;
use crate::reply::{ReplyClass, ResponseFlags};
use crate::session::Session;
use crate::task::Task;

/// Buffer size for downloads.
pub const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// An open download. Must be passed to [`Operations::close_read`].
///
/// Reads race the token of the operation that opened it.
#[derive(Debug)]
pub struct ReadHandle {
    conn: DetachedConnection,
    path: FtpPath,
    transferred: u64,
    cancel: CancelToken,
}

impl ReadHandle {
    /// File being read.
    pub fn path(&self) -> &FtpPath {
        &self.path
    }

    /// Bytes read so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Token the download runs under.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// An open upload. Must be passed to [`Operations::close_write`].
#[derive(Debug)]
pub struct WriteHandle {
    conn: DetachedConnection,
    path: FtpPath,
    transferred: u64,
    cancel: CancelToken,
}

impl WriteHandle {
    /// File being written.
    pub fn path(&self) -> &FtpPath {
        &self.path
    }

    /// Bytes written so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Token the upload runs under.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Options for [`Operations::move_file`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveOptions {
    /// Replace an existing target.
    pub overwrite: bool,
    /// Keep a backup of the replaced target. Not supported.
    pub backup: bool,
}

/// Options for [`Operations::pull`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullOptions {
    /// Replace an existing local file.
    pub overwrite: bool,
    /// Delete the remote file once it has been copied.
    pub remove_source: bool,
}

/// Filesystem operations running under one cancellation token.
///
/// Created by [`Session::with_cancel`]. Firing the token fails the
/// operation in flight and every handle it opened; other operations of the
/// session carry on.
#[derive(Debug, Clone)]
pub struct Operations<'s> {
    session: &'s Session,
    cancel: CancelToken,
}

impl<'s> Operations<'s> {
    pub(crate) fn new(session: &'s Session, cancel: CancelToken) -> Self {
        Self { session, cancel }
    }

    /// Token the operations run under.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    fn task(&self) -> Task<'s> {
        self.session.task_with_cancel(self.cancel.clone())
    }

    /// Metadata of `path`.
    pub async fn query_info(&self, path: &FtpPath, follow_links: bool) -> Result<FileInfo> {
        let mut task = self.task();
        let found = self
            .session
            .dir_cache()
            .lookup_file(&mut task, path, follow_links)
            .await;
        let info = match found {
            Ok(info) => info,
            Err(err) => {
                task.set_error(err);
                None
            }
        };
        task.done()?;
        info.ok_or_else(|| FtpError::NotFound {
            path: path.to_string(),
        })
    }

    /// Fresh listing of `dir`.
    pub async fn enumerate(&self, dir: &FtpPath, follow_links: bool) -> Result<Vec<FileInfo>> {
        let cache = self.session.dir_cache();
        cache.purge_dir(dir);
        let mut task = self.task();
        let listed = cache.lookup_dir(&mut task, dir, true, follow_links).await;
        let list = match listed {
            Ok(list) => list,
            Err(err) => {
                task.set_error(err);
                None
            }
        };
        task.done()?;
        list.ok_or_else(|| FtpError::NotFound {
            path: dir.to_string(),
        })
    }

    /// Start downloading `path`.
    pub async fn open_for_read(&self, path: &FtpPath) -> Result<ReadHandle> {
        let mut task = self.task();
        task.open_data_connection().await;
        if !task.is_in_error() {
            task.send_and_check(
                ResponseFlags::PASS_100 | ResponseFlags::FAIL_200,
                &[ErrorHandler::IsDirectory, ErrorHandler::PermissionOrNotFound],
                path,
                &format!("RETR {}", path.to_native()),
            )
            .await;
        }
        abandon_refused_transfer(&mut task).await;
        let conn = detach(&mut task);
        task.done()?;
        let conn = conn.ok_or(FtpError::ConnectionClosed)?;
        debug!(path = %path, "download started");
        Ok(ReadHandle {
            conn,
            path: path.clone(),
            transferred: 0,
            cancel: self.cancel.clone(),
        })
    }

    /// Read the next chunk of a download; 0 at end of file.
    pub async fn read(&self, handle: &mut ReadHandle, buf: &mut [u8]) -> Result<usize> {
        let data = handle
            .conn
            .connection_mut()?
            .data_mut()
            .ok_or(FtpError::ConnectionClosed)?;
        let n = handle.cancel.run(data.read(buf)).await?;
        handle.transferred += n as u64;
        Ok(n)
    }

    /// Finish a download and collect the server's final reply.
    pub async fn close_read(&self, handle: ReadHandle) -> Result<()> {
        let ReadHandle {
            conn,
            path,
            transferred,
            cancel,
        } = handle;
        let mut task = self.session.task_with_cancel(cancel);
        task.give_connection(conn);
        task.close_data_connection().await;
        if !task.is_in_error() {
            task.receive(ResponseFlags::NONE).await;
        }
        task.done()?;
        debug!(path = %path, bytes = transferred, "download finished");
        Ok(())
    }

    /// Create `path`; fails if it exists.
    pub async fn create(&self, path: &FtpPath) -> Result<WriteHandle> {
        let mut task = self.task();
        match self.session.dir_cache().lookup_file(&mut task, path, false).await {
            Ok(Some(_)) => task.set_error(FtpError::AlreadyExists {
                path: path.to_string(),
            }),
            Err(err) if err.is_cancelled() => task.set_error(err),
            _ => {}
        }
        self.start_write(task, path, "STOR").await
    }

    /// Append to `path`, creating it if needed.
    pub async fn append(&self, path: &FtpPath) -> Result<WriteHandle> {
        self.start_write(self.task(), path, "APPE").await
    }

    /// Replace the contents of `path`.
    pub async fn replace(&self, path: &FtpPath, make_backup: bool) -> Result<WriteHandle> {
        if make_backup {
            return Err(FtpError::NotSupported {
                op: "backup".to_string(),
            });
        }
        self.start_write(self.task(), path, "STOR").await
    }

    async fn start_write(&self, mut task: Task<'s>, path: &FtpPath, verb: &str) -> Result<WriteHandle> {
        task.open_data_connection().await;
        if !task.is_in_error() {
            task.send(
                ResponseFlags::PASS_100 | ResponseFlags::FAIL_200,
                &format!("{verb} {}", path.to_native()),
            )
            .await;
        }
        abandon_refused_transfer(&mut task).await;
        let conn = detach(&mut task);
        self.session.dir_cache().purge_file(path);
        task.done()?;
        let conn = conn.ok_or(FtpError::ConnectionClosed)?;
        debug!(path = %path, verb, "upload started");
        Ok(WriteHandle {
            conn,
            path: path.clone(),
            transferred: 0,
            cancel: self.cancel.clone(),
        })
    }

    /// Send `buf` to an upload. Returns the number of bytes taken.
    pub async fn write(&self, handle: &mut WriteHandle, buf: &[u8]) -> Result<usize> {
        let data = handle
            .conn
            .connection_mut()?
            .data_mut()
            .ok_or(FtpError::ConnectionClosed)?;
        handle.cancel.run(data.write_all(buf)).await?;
        handle.transferred += buf.len() as u64;
        Ok(buf.len())
    }

    /// Finish an upload and collect the server's final reply.
    pub async fn close_write(&self, handle: WriteHandle) -> Result<()> {
        let WriteHandle {
            conn,
            path,
            transferred,
            cancel,
        } = handle;
        let mut task = self.session.task_with_cancel(cancel);
        task.give_connection(conn);
        task.close_data_connection().await;
        if !task.is_in_error() {
            task.receive(ResponseFlags::NONE).await;
        }
        self.session.dir_cache().purge_file(&path);
        task.done()?;
        debug!(path = %path, bytes = transferred, "upload finished");
        Ok(())
    }

    /// Rename `path` within its directory. Returns the new path.
    pub async fn set_display_name(&self, path: &FtpPath, new_name: &str) -> Result<FtpPath> {
        let parent = path.parent().ok_or_else(|| FtpError::NotSupported {
            op: "rename root".to_string(),
        })?;
        let renamed = parent.child(new_name)?;
        let mut task = self.task();
        task.send(
            ResponseFlags::PASS_300 | ResponseFlags::FAIL_200,
            &format!("RNFR {}", path.to_native()),
        )
        .await;
        if !task.is_in_error() {
            task.send(ResponseFlags::NONE, &format!("RNTO {}", renamed.to_native()))
                .await;
        }
        let cache = self.session.dir_cache();
        cache.purge_dir(&parent);
        // either name may be a directory with listings of its own
        cache.purge_tree(path);
        cache.purge_tree(&renamed);
        task.done()?;
        Ok(renamed)
    }

    /// Remove a file or an empty directory.
    pub async fn delete(&self, path: &FtpPath) -> Result<()> {
        let cache = self.session.dir_cache();
        let mut task = self.task();
        let native = path.to_native();
        // files are far more common, so try DELE first
        let dele = task
            .command(ResponseFlags::PASS_500, &format!("DELE {native}"))
            .await;
        if dele.map_or(false, |r| r.class() == ReplyClass::PermanentFailure) {
            let rmd = task
                .command(ResponseFlags::PASS_550, &format!("RMD {native}"))
                .await;
            if let Some(reply) = rmd.filter(|r| r.code == 550) {
                let error = match cache.lookup_dir(&mut task, path, false, false).await {
                    Ok(Some(list)) if !list.is_empty() => FtpError::NotEmpty {
                        path: path.to_string(),
                    },
                    Err(err) if err.is_cancelled() => err,
                    _ => FtpError::remote(reply.code, &reply.lines),
                };
                task.set_error(error);
            } else {
                cache.purge_tree(path);
            }
        }
        cache.purge_file(path);
        task.done()
    }

    /// Create the directory `path`.
    pub async fn make_directory(&self, path: &FtpPath) -> Result<()> {
        let mut task = self.task();
        task.send_and_check(
            ResponseFlags::NONE,
            &[ErrorHandler::Exists, ErrorHandler::ParentNotFound],
            path,
            &format!("MKD {}", path.to_native()),
        )
        .await;
        self.session.dir_cache().purge_file(path);
        task.done()
    }

    /// Move `src` to `dst`, or into `dst` when it is a directory. Returns
    /// the final path.
    pub async fn move_file(&self, src: &FtpPath, dst: &FtpPath, options: MoveOptions) -> Result<FtpPath> {
        if options.backup {
            return Err(FtpError::NotSupported {
                op: "backup".to_string(),
            });
        }
        let name = src.basename().ok_or_else(|| FtpError::InvalidFilename {
            name: src.to_string(),
        })?;
        let into_dir = dst.child(name)?;
        let cache = self.session.dir_cache();
        let mut task = self.task();
        let target = if task.try_cd(dst).await {
            into_dir
        } else {
            dst.clone()
        };
        if !options.overwrite {
            match cache.lookup_file(&mut task, &target, false).await {
                Ok(Some(_)) => task.set_error(FtpError::AlreadyExists {
                    path: target.to_string(),
                }),
                Err(err) if err.is_cancelled() => task.set_error(err),
                _ => {}
            }
        }
        if !task.is_in_error() {
            task.send(
                ResponseFlags::PASS_300 | ResponseFlags::FAIL_200,
                &format!("RNFR {}", src.to_native()),
            )
            .await;
        }
        if !task.is_in_error() {
            task.send(ResponseFlags::NONE, &format!("RNTO {}", target.to_native()))
                .await;
        }
        cache.purge_file(src);
        cache.purge_file(&target);
        cache.purge_tree(src);
        cache.purge_tree(&target);
        task.done()?;
        Ok(target)
    }

    /// Download `src` into the local file `local`, reporting
    /// `(copied, total)` after every chunk. Returns the number of bytes
    /// copied.
    ///
    /// A failed download removes the local file.
    pub async fn pull<F>(
        &self,
        src: &FtpPath,
        local: &Path,
        options: PullOptions,
        mut progress: F,
    ) -> Result<u64>
    where
        F: FnMut(u64, Option<u64>),
    {
        let mut out = open_local(local, options.overwrite).await?;
        let res = self
            .pull_into(src, &mut out, options.remove_source, &mut progress)
            .await;
        drop(out);
        match res {
            Ok(copied) => {
                info!(src = %src, local = %local.display(), bytes = copied, "pulled");
                Ok(copied)
            }
            Err(err) => {
                if let Err(rm) = tokio::fs::remove_file(local).await {
                    debug!(local = %local.display(), error = %rm, "could not remove partial file");
                }
                Err(err)
            }
        }
    }

    async fn pull_into<F>(
        &self,
        src: &FtpPath,
        out: &mut File,
        remove_source: bool,
        progress: &mut F,
    ) -> Result<u64>
    where
        F: FnMut(u64, Option<u64>),
    {
        let cache = self.session.dir_cache();
        let mut task = self.task();
        let total = match cache.lookup_file(&mut task, src, true).await {
            Ok(Some(info)) if !info.is_dir() => Some(info.size),
            Err(err) if err.is_cancelled() => return Err(err),
            _ => None,
        };

        task.open_data_connection().await;
        if !task.is_in_error() {
            task.send_and_check(
                ResponseFlags::PASS_100 | ResponseFlags::FAIL_200,
                &[ErrorHandler::IsDirectory],
                src,
                &format!("RETR {}", src.to_native()),
            )
            .await;
        }
        abandon_refused_transfer(&mut task).await;

        let mut copied = 0u64;
        if !task.is_in_error() {
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            loop {
                let n = task.read_data(&mut buf).await;
                if n == 0 {
                    break;
                }
                if let Err(err) = out.write_all(&buf[..n]).await {
                    task.set_error(err.into());
                    break;
                }
                copied += n as u64;
                progress(copied, total);
            }
            task.close_data_connection().await;
            task.receive(ResponseFlags::NONE).await;
            if let Err(err) = out.flush().await {
                task.set_error(err.into());
            }
        }

        if remove_source && !task.is_in_error() {
            task.send(ResponseFlags::NONE, &format!("DELE {}", src.to_native()))
                .await;
            cache.purge_file(src);
        }
        task.done()?;
        Ok(copied)
    }
}

impl Session {
    fn operations(&self) -> Operations<'_> {
        self.with_cancel(self.cancel_token().clone())
    }

    /// See [`Operations::query_info`].
    pub async fn query_info(&self, path: &FtpPath, follow_links: bool) -> Result<FileInfo> {
        self.operations().query_info(path, follow_links).await
    }

    /// See [`Operations::enumerate`].
    pub async fn enumerate(&self, dir: &FtpPath, follow_links: bool) -> Result<Vec<FileInfo>> {
        self.operations().enumerate(dir, follow_links).await
    }

    /// See [`Operations::open_for_read`].
    pub async fn open_for_read(&self, path: &FtpPath) -> Result<ReadHandle> {
        self.operations().open_for_read(path).await
    }

    /// See [`Operations::read`].
    pub async fn read(&self, handle: &mut ReadHandle, buf: &mut [u8]) -> Result<usize> {
        self.operations().read(handle, buf).await
    }

    /// See [`Operations::close_read`].
    pub async fn close_read(&self, handle: ReadHandle) -> Result<()> {
        self.operations().close_read(handle).await
    }

    /// See [`Operations::create`].
    pub async fn create(&self, path: &FtpPath) -> Result<WriteHandle> {
        self.operations().create(path).await
    }

    /// See [`Operations::append`].
    pub async fn append(&self, path: &FtpPath) -> Result<WriteHandle> {
        self.operations().append(path).await
    }

    /// See [`Operations::replace`].
    pub async fn replace(&self, path: &FtpPath, make_backup: bool) -> Result<WriteHandle> {
        self.operations().replace(path, make_backup).await
    }

    /// See [`Operations::write`].
    pub async fn write(&self, handle: &mut WriteHandle, buf: &[u8]) -> Result<usize> {
        self.operations().write(handle, buf).await
    }

    /// See [`Operations::close_write`].
    pub async fn close_write(&self, handle: WriteHandle) -> Result<()> {
        self.operations().close_write(handle).await
    }

    /// See [`Operations::set_display_name`].
    pub async fn set_display_name(&self, path: &FtpPath, new_name: &str) -> Result<FtpPath> {
        self.operations().set_display_name(path, new_name).await
    }

    /// See [`Operations::delete`].
    pub async fn delete(&self, path: &FtpPath) -> Result<()> {
        self.operations().delete(path).await
    }

    /// See [`Operations::make_directory`].
    pub async fn make_directory(&self, path: &FtpPath) -> Result<()> {
        self.operations().make_directory(path).await
    }

    /// See [`Operations::move_file`].
    pub async fn move_file(&self, src: &FtpPath, dst: &FtpPath, options: MoveOptions) -> Result<FtpPath> {
        self.operations().move_file(src, dst, options).await
    }

    /// See [`Operations::pull`].
    pub async fn pull<F>(
        &self,
        src: &FtpPath,
        local: &Path,
        options: PullOptions,
        progress: F,
    ) -> Result<u64>
    where
        F: FnMut(u64, Option<u64>),
    {
        self.operations().pull(src, local, options, progress).await
    }
}

/// The server refused the transfer command after the data connection was
/// opened. Drop the data connection so the control connection stays
/// reusable.
async fn abandon_refused_transfer(task: &mut Task<'_>) {
    if task.is_in_error() {
        task.close_data_connection().await;
    }
}

/// Detach the task's connection for streaming, unless the task failed.
fn detach(task: &mut Task<'_>) -> Option<DetachedConnection> {
    if task.is_in_error() {
        return None;
    }
    let conn = task.take_connection();
    if conn.is_none() {
        task.set_error(FtpError::ConnectionClosed);
    }
    conn
}

async fn open_local(path: &Path, overwrite: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    options.open(path).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::AlreadyExists => FtpError::AlreadyExists {
            path: path.display().to_string(),
        },
        _ => FtpError::Io(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_options_default_off() {
        assert_eq!(
            MoveOptions::default(),
            MoveOptions {
                overwrite: false,
                backup: false
            }
        );
        let pull = PullOptions::default();
        assert!(!pull.overwrite && !pull.remove_source);
    }

    #[tokio::test]
    async fn test_open_local_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"old").unwrap();

        let err = open_local(&path, false).await.unwrap_err();
        assert!(matches!(err, FtpError::AlreadyExists { .. }));

        let mut file = open_local(&path, true).await.unwrap();
        file.write_all(b"new contents").await.unwrap();
        file.flush().await.unwrap();
        drop(file);
        assert_eq!(std::fs::read(&path).unwrap(), b"new contents");
    }

    #[tokio::test]
    async fn test_open_local_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fresh.bin");
        open_local(&path, false).await.unwrap();
        assert!(path.exists());
    }
}
