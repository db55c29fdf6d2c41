//! File metadata records produced by listings and probes.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Type of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link whose target was not followed.
    Symlink,
    /// Device, socket, pipe or anything else.
    Special,
}

/// Metadata for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Decoded entry name.
    pub name: String,
    /// Entry type.
    pub kind: FileKind,
    /// Size in bytes as reported by the server.
    pub size: u64,
    /// Last modification time, when the listing carries one.
    pub modified: Option<DateTime<Utc>>,
    /// Unix permission bits, when the listing carries them.
    pub permissions: Option<u32>,
    /// Owner name.
    pub owner: Option<String>,
    /// Group name.
    pub group: Option<String>,
    /// Link target for symbolic links, as listed.
    pub symlink_target: Option<String>,
    /// Set when this record describes a link, whether or not the target
    /// was followed.
    pub is_symlink: bool,
}

impl FileInfo {
    /// Bare record with only a name and a type.
    pub fn new(name: impl Into<String>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            modified: None,
            permissions: None,
            owner: None,
            group: None,
            symlink_target: None,
            is_symlink: kind == FileKind::Symlink,
        }
    }

    /// Record for the root directory, which is never listed.
    pub fn root() -> Self {
        Self::new("/", FileKind::Directory)
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// `ls -l` style type and permission column, e.g. `drwxr-xr-x`.
    pub fn mode_string(&self) -> String {
        let t = match self.kind {
            FileKind::Regular => '-',
            FileKind::Directory => 'd',
            FileKind::Symlink => 'l',
            FileKind::Special => '?',
        };
        let t = if self.is_symlink { 'l' } else { t };
        let mut s = String::with_capacity(10);
        s.push(t);
        match self.permissions {
            Some(bits) => {
                for shift in [6u32, 3, 0] {
                    let b = (bits >> shift) & 0o7;
                    s.push(if b & 4 != 0 { 'r' } else { '-' });
                    s.push(if b & 2 != 0 { 'w' } else { '-' });
                    s.push(if b & 1 != 0 { 'x' } else { '-' });
                }
            }
            None => s.push_str("?????????"),
        }
        s
    }
}
