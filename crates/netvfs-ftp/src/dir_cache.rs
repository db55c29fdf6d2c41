//! Directory listing cache.
//!
//! Entries never expire; operations that change a directory purge it.
//! Concurrent misses on the same directory are coalesced: the first
//! caller fetches, later callers park on the in-flight record and reuse
//! the result. An entry is replaced as a whole, never patched.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::debug;

use crate::capability::{Capabilities, Feature};
use crate::error::{FtpError, Result};
use crate::listing::ListingParser;
use crate::metadata::{FileInfo, FileKind};
use crate::path::FtpPath;
use crate::reply::ResponseFlags;
use crate::task::Task;

/// How directory paths and entry names compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyPolicy {
    /// Exact comparison.
    #[default]
    CaseSensitive,
    /// Comparison ignoring case, for servers with case-insensitive file
    /// systems.
    CaseInsensitive,
}

impl KeyPolicy {
    fn key(&self, dir: &FtpPath) -> String {
        match self {
            KeyPolicy::CaseSensitive => dir.to_native(),
            KeyPolicy::CaseInsensitive => dir.to_native().to_lowercase(),
        }
    }

    fn names_match(&self, a: &str, b: &str) -> bool {
        match self {
            KeyPolicy::CaseSensitive => a == b,
            KeyPolicy::CaseInsensitive => a.to_lowercase() == b.to_lowercase(),
        }
    }
}

/// A complete listing of one directory.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    entries: Vec<FileInfo>,
    created_at: Instant,
}

impl CacheEntry {
    fn new(entries: Vec<FileInfo>) -> Self {
        Self {
            entries,
            created_at: Instant::now(),
        }
    }

    /// Listed entries, in server order.
    pub fn entries(&self) -> &[FileInfo] {
        &self.entries
    }

    /// When the listing was fetched.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn find(&self, name: &str, policy: KeyPolicy) -> Option<&FileInfo> {
        self.entries.iter().find(|e| policy.names_match(&e.name, name))
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirCacheStats {
    /// Lookups answered from a cached entry.
    pub hits: u64,
    /// Lookups that had to fetch.
    pub misses: u64,
    /// Listings fetched successfully.
    pub fetches: u64,
    /// Lookups that waited for another caller's fetch.
    pub coalesced: u64,
    /// Purge calls.
    pub purges: u64,
    /// Cached directories.
    pub size: usize,
}

type Waiter = oneshot::Sender<Option<Arc<CacheEntry>>>;

#[derive(Default)]
struct InFlight {
    waiters: Vec<Waiter>,
    purged: bool,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Arc<CacheEntry>>,
    in_flight: HashMap<String, InFlight>,
}

/// Marks a fetch in progress; dropping it without completing releases
/// the waiters so they can retry.
struct FlightGuard<'c> {
    cache: &'c DirCache,
    key: String,
    completed: bool,
}

impl FlightGuard<'_> {
    fn complete(mut self, entry: CacheEntry) -> Arc<CacheEntry> {
        self.completed = true;
        let entry = Arc::new(entry);
        let mut state = self.cache.lock();
        if let Some(flight) = state.in_flight.remove(&self.key) {
            if flight.purged {
                debug!(dir = %self.key, "directory purged during fetch, not caching");
            } else {
                state.entries.insert(self.key.clone(), entry.clone());
            }
            for tx in flight.waiters {
                let _ = tx.send(Some(entry.clone()));
            }
        }
        entry
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            // waiters see a closed channel and retry
            self.cache.lock().in_flight.remove(&self.key);
        }
    }
}

/// Coalescing directory cache of one session.
pub struct DirCache {
    state: Mutex<CacheState>,
    capabilities: Arc<Capabilities>,
    parser: Option<Arc<dyn ListingParser>>,
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    coalesced: AtomicU64,
    purges: AtomicU64,
}

impl DirCache {
    /// Cache using the parser and key policy of the detected dialect,
    /// unless `parser` overrides the parser.
    pub fn new(capabilities: Arc<Capabilities>, parser: Option<Arc<dyn ListingParser>>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capabilities,
            parser,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            purges: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn policy(&self) -> KeyPolicy {
        self.capabilities.dialect().key_policy()
    }

    /// Metadata of `path`, from the listing of its parent.
    ///
    /// With `resolve_links`, a symbolic link is followed once and the
    /// target's metadata is returned under the link's name.
    pub async fn lookup_file(
        &self,
        task: &mut Task<'_>,
        path: &FtpPath,
        resolve_links: bool,
    ) -> Result<Option<FileInfo>> {
        let Some(info) = self.lookup_file_unresolved(task, path).await? else {
            return Ok(None);
        };
        if resolve_links && info.kind == FileKind::Symlink {
            return self.resolve_link(task, path, info).await.map(Some);
        }
        Ok(Some(info))
    }

    /// Listing of `dir`.
    ///
    /// With `must_exist`, failure to list is an error; a directory that
    /// turns out to be missing or a file is reported as such. Without it,
    /// failure yields `None`.
    pub async fn lookup_dir(
        &self,
        task: &mut Task<'_>,
        dir: &FtpPath,
        must_exist: bool,
        resolve_links: bool,
    ) -> Result<Option<Vec<FileInfo>>> {
        let entry = match self.lookup_entry(task, dir).await {
            Ok(entry) => entry,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) if !must_exist => {
                debug!(dir = %dir, error = %err, "directory not listable");
                return Ok(None);
            }
            Err(FtpError::NotDirectory { path }) => {
                return Err(self.explain_cwd_failure(task, dir, path).await);
            }
            Err(err) => return Err(err),
        };
        let mut list = entry.entries().to_vec();
        if resolve_links {
            for info in list.iter_mut().filter(|i| i.kind == FileKind::Symlink) {
                let link = dir.child(info.name.clone())?;
                *info = self.resolve_link(task, &link, info.clone()).await?;
            }
        }
        Ok(Some(list))
    }

    /// Drop the listing of the directory containing `path`.
    pub fn purge_file(&self, path: &FtpPath) {
        match path.parent() {
            Some(parent) => self.purge_dir(&parent),
            None => self.purge_dir(path),
        }
    }

    /// Drop the listing of `dir`.
    pub fn purge_dir(&self, dir: &FtpPath) {
        let key = self.policy().key(dir);
        let mut state = self.lock();
        state.entries.remove(&key);
        if let Some(flight) = state.in_flight.get_mut(&key) {
            flight.purged = true;
        }
        self.purges.fetch_add(1, Ordering::Relaxed);
        debug!(dir = %dir, "directory cache purged");
    }

    /// Drop the listing of `dir` and of every directory below it. Used when
    /// `dir` itself is renamed, moved or removed.
    pub fn purge_tree(&self, dir: &FtpPath) {
        let key = self.policy().key(dir);
        let prefix = if key.ends_with('/') {
            key.clone()
        } else {
            format!("{key}/")
        };
        let below = |k: &str| k == key || k.starts_with(&prefix);
        let mut state = self.lock();
        state.entries.retain(|k, _| !below(k));
        for (k, flight) in state.in_flight.iter_mut() {
            if below(k) {
                flight.purged = true;
            }
        }
        self.purges.fetch_add(1, Ordering::Relaxed);
        debug!(dir = %dir, "directory tree purged");
    }

    /// Drop every listing.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        for flight in state.in_flight.values_mut() {
            flight.purged = true;
        }
    }

    /// Cache counters.
    pub fn stats(&self) -> DirCacheStats {
        DirCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            purges: self.purges.load(Ordering::Relaxed),
            size: self.lock().entries.len(),
        }
    }

    async fn lookup_file_unresolved(
        &self,
        task: &mut Task<'_>,
        path: &FtpPath,
    ) -> Result<Option<FileInfo>> {
        let (Some(parent), Some(name)) = (path.parent(), path.basename()) else {
            return Ok(Some(FileInfo::root()));
        };
        match self.lookup_entry(task, &parent).await {
            Ok(entry) => Ok(entry.find(name, self.policy()).cloned()),
            Err(err) if err.is_cancelled() || matches!(err, FtpError::PoolClosed) => Err(err),
            Err(err) => {
                debug!(path = %path, error = %err, "parent not listable, probing");
                self.probe(task, path).await
            }
        }
    }

    async fn resolve_link(
        &self,
        task: &mut Task<'_>,
        link: &FtpPath,
        info: FileInfo,
    ) -> Result<FileInfo> {
        let target_path = info.symlink_target.as_deref().map(|t| link.resolve_link(t));
        let Some(target_path) = target_path else {
            return Ok(info);
        };
        match self.lookup_file_unresolved(task, &target_path).await {
            Ok(Some(mut resolved)) => {
                resolved.name = info.name;
                resolved.is_symlink = true;
                resolved.symlink_target = info.symlink_target;
                Ok(resolved)
            }
            Err(err) if err.is_cancelled() => Err(err),
            _ => Ok(info),
        }
    }

    /// Find out why `CWD dir` failed.
    async fn explain_cwd_failure(&self, task: &mut Task<'_>, dir: &FtpPath, path: String) -> FtpError {
        match self.lookup_file(task, dir, true).await {
            Ok(None) => FtpError::NotFound { path },
            Ok(Some(info)) if info.is_dir() => FtpError::PermissionDenied { path },
            Err(err) if err.is_cancelled() => err,
            _ => FtpError::NotDirectory { path },
        }
    }

    /// Probe a path the parent listing could not tell us about.
    async fn probe(&self, task: &mut Task<'_>, path: &FtpPath) -> Result<Option<FileInfo>> {
        let stashed = task.take_error();
        let res = self.probe_inner(task, path).await;
        if let Some(err) = stashed {
            task.set_error(err);
        }
        res
    }

    async fn probe_inner(&self, task: &mut Task<'_>, path: &FtpPath) -> Result<Option<FileInfo>> {
        let name = path.basename().unwrap_or("/").to_string();
        if task.try_cd(path).await {
            return Ok(Some(FileInfo::new(name, FileKind::Directory)));
        }
        task.check()?;
        if self.capabilities.has_feature(Feature::Size) {
            let reply = task
                .command(ResponseFlags::NONE, &format!("SIZE {}", path.to_native()))
                .await;
            if !task.is_in_error() {
                if let Some(size) = reply.and_then(|r| r.text().trim().parse::<u64>().ok()) {
                    let mut info = FileInfo::new(name, FileKind::Regular);
                    info.size = size;
                    return Ok(Some(info));
                }
            }
            task.clear_recoverable_error();
            task.check()?;
        }
        Ok(None)
    }

    /// The cached listing of `dir`, fetching it (or waiting for another
    /// caller's fetch) on a miss.
    async fn lookup_entry(&self, task: &mut Task<'_>, dir: &FtpPath) -> Result<Arc<CacheEntry>> {
        let key = self.policy().key(dir);
        loop {
            if let Some(entry) = self.lock().entries.get(&key).cloned() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }
            // a fetcher must own a connection before others can wait on it
            task.ensure_connection().await?;

            let waiting = {
                let mut state = self.lock();
                if let Some(entry) = state.entries.get(&key).cloned() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry);
                }
                match state.in_flight.get_mut(&key) {
                    Some(flight) => {
                        let (tx, rx) = oneshot::channel();
                        flight.waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        state.in_flight.insert(key.clone(), InFlight::default());
                        None
                    }
                }
            };

            let Some(rx) = waiting else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let guard = FlightGuard {
                    cache: self,
                    key: key.clone(),
                    completed: false,
                };
                let entry = self.fetch(task, dir).await?;
                self.fetches.fetch_add(1, Ordering::Relaxed);
                return Ok(guard.complete(entry));
            };

            self.coalesced.fetch_add(1, Ordering::Relaxed);
            let cancel = task.cancel_token().clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(FtpError::Cancelled(cancel.cancelled_reason().unwrap_or_default()));
                }
                outcome = rx => outcome,
            };
            match outcome {
                Ok(Some(entry)) => return Ok(entry),
                _ => debug!(dir = %dir, "coalesced fetch failed, retrying"),
            }
        }
    }

    async fn fetch(&self, task: &mut Task<'_>, dir: &FtpPath) -> Result<CacheEntry> {
        let stashed = task.take_error();
        let res = self.fetch_listing(task, dir).await;
        if let Some(err) = stashed {
            task.set_error(err);
        }
        res
    }

    async fn fetch_listing(&self, task: &mut Task<'_>, dir: &FtpPath) -> Result<CacheEntry> {
        let dialect = self.capabilities.dialect();
        task.cd(dir).await;
        task.check()?;
        task.open_data_connection().await;
        task.check()?;
        task.send(ResponseFlags::PASS_100 | ResponseFlags::FAIL_200, dialect.list_command())
            .await;
        if task.is_in_error() {
            task.close_data_connection().await;
            return Err(task.check().err().unwrap_or(FtpError::ConnectionClosed));
        }
        let data = task.read_all_data().await;
        task.close_data_connection().await;
        task.receive(ResponseFlags::NONE).await;
        task.check()?;

        let parser = self.parser.clone().unwrap_or_else(|| dialect.parser());
        let entries = parser.parse(&data)?;
        debug!(dir = %dir, entries = entries.len(), "directory listed");
        Ok(CacheEntry::new(entries))
    }
}

impl fmt::Debug for DirCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirCache")
            .field("stats", &self.stats())
            .field("parser", &self.parser)
            .finish()
    }
}
