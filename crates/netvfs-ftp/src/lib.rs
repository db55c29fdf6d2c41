#![warn(missing_docs)]

//! netvfs FTP subsystem: command/response engine, connection pool, directory cache, filesystem operations

pub mod address;
pub mod cancel;
pub mod capability;
pub mod cli;
pub mod config;
pub mod connection;
pub mod dir_cache;
pub mod error;
pub mod handlers;
pub mod listing;
pub mod metadata;
pub mod ops;
pub mod path;
pub mod pool;
pub mod reply;
pub mod session;
pub mod task;

pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken};
pub use capability::{Capabilities, Feature, Features, SystemDialect, Workaround};
pub use config::{Credentials, SessionConfig};
pub use dir_cache::{DirCache, DirCacheStats, KeyPolicy};
pub use error::{FtpError, RemoteErrorKind, Result};
pub use handlers::{ErrorHandler, Resolution};
pub use listing::{AutoListingParser, DosListingParser, ListingParser, UnixListingParser};
pub use metadata::{FileInfo, FileKind};
pub use ops::{MoveOptions, Operations, PullOptions, ReadHandle, WriteHandle};
pub use path::FtpPath;
pub use pool::{ConnectionPool, PoolStats};
pub use reply::{Reply, ReplyClass, ResponseFlags};
pub use session::Session;
pub use task::Task;
