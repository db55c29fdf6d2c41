//! Virtual and protocol-native paths.
//!
//! An [`FtpPath`] is an absolute sequence of segments. The native form is
//! what goes on the wire: segments joined by `/`, with `/`, CR and LF
//! inside a segment escaped as `%2F`, `%0D` and `%0A`. A literal `%` is
//! escaped as `%25` only where it would otherwise read as one of those
//! four escapes, so ordinary names (including ones with `%`) pass through
//! unchanged and the mapping stays injective.

use std::fmt;

use crate::error::{FtpError, Result};

const ESCAPES: [(&str, char); 4] = [("2F", '/'), ("0D", '\r'), ("0A", '\n'), ("25", '%')];

/// Absolute path on the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FtpPath {
    segments: Vec<String>,
}

impl FtpPath {
    /// The root directory.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a virtual path like `/pub/a.txt`.
    ///
    /// Empty and `.` segments are dropped, `..` removes the previous one.
    pub fn from_virtual(path: &str) -> Self {
        let mut segments: Vec<String> = Vec::new();
        for seg in path.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s.to_string()),
            }
        }
        Self { segments }
    }

    /// Parse a native path as sent by the server.
    pub fn from_native(path: &str) -> Self {
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(decode_segment)
            .collect();
        Self { segments }
    }

    /// Build from already decoded segments.
    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = Self::root();
        for seg in segments {
            path = path.child(seg)?;
        }
        Ok(path)
    }

    /// Native form for use in commands.
    pub fn to_native(&self) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for seg in &self.segments {
            out.push('/');
            out.push_str(&encode_segment(seg));
        }
        out
    }

    /// True for `/`.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Segments, decoded.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Containing directory, `None` for the root.
    pub fn parent(&self) -> Option<FtpPath> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Last segment, `None` for the root.
    pub fn basename(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Path of the entry `name` inside this directory.
    pub fn child(&self, name: impl Into<String>) -> Result<FtpPath> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." {
            return Err(FtpError::InvalidFilename { name });
        }
        let mut segments = self.segments.clone();
        segments.push(name);
        Ok(Self { segments })
    }

    /// Resolve a symlink target recorded in the listing of this path's
    /// parent directory. Absolute targets start over at the root.
    pub fn resolve_link(&self, target: &str) -> FtpPath {
        let base = if target.starts_with('/') {
            FtpPath::root()
        } else {
            self.parent().unwrap_or_default()
        };
        let mut segments = base.segments;
        for seg in target.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(decode_segment(s)),
            }
        }
        Self { segments }
    }
}

impl fmt::Display for FtpPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

fn escape_at(s: &str, i: usize) -> Option<char> {
    let code = s.get(i + 1..i + 3)?;
    ESCAPES.iter().find(|(e, _)| *e == code).map(|(_, c)| *c)
}

/// Escape one segment for the wire.
pub fn encode_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for (i, c) in seg.char_indices() {
        match c {
            '/' => out.push_str("%2F"),
            '\r' => out.push_str("%0D"),
            '\n' => out.push_str("%0A"),
            '%' if escape_at(seg, i).is_some() => out.push_str("%25"),
            c => out.push(c),
        }
    }
    out
}

/// Undo [`encode_segment`]. Unknown `%` sequences are kept literally.
pub fn decode_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    let mut chars = seg.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '%' {
            if let Some(decoded) = escape_at(seg, i) {
                out.push(decoded);
                chars.next();
                chars.next();
                continue;
            }
        }
        out.push(c);
    }
    out
}
