//! Directory listing parsers.
//!
//! The directory cache treats a parser as a pure function from the raw
//! `LIST` output to metadata records. A line the parser cannot make sense
//! of fails the whole listing; `total` lines and the `.`/`..` entries are
//! skipped.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

use crate::error::{FtpError, Result};
use crate::metadata::{FileInfo, FileKind};
use crate::path::decode_segment;

/// Turns raw listing output into metadata records.
pub trait ListingParser: Send + Sync + fmt::Debug {
    /// Parse one line. `Ok(None)` skips it.
    fn parse_line(&self, line: &str) -> Result<Option<FileInfo>>;

    /// Parse a complete listing.
    fn parse(&self, data: &[u8]) -> Result<Vec<FileInfo>> {
        let text = String::from_utf8_lossy(data);
        let mut entries = Vec::new();
        for line in text.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }
            if let Some(info) = self.parse_line(line)? {
                if info.name != "." && info.name != ".." {
                    entries.push(info);
                }
            }
        }
        Ok(entries)
    }
}

fn invalid(line: &str) -> FtpError {
    FtpError::InvalidListing {
        line: line.to_string(),
    }
}

/// Whitespace separated tokens with their byte offsets.
fn tokens(line: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                out.push((s, &line[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, &line[s..]));
    }
    out
}

fn month(tok: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    if tok.len() != 3 {
        return None;
    }
    let lower = tok.to_ascii_lowercase();
    MONTHS.iter().position(|m| *m == lower).map(|i| i as u32 + 1)
}

fn hour_minute(tok: &str) -> Option<(u32, u32)> {
    let (h, m) = tok.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some((h, m))
}

fn to_utc(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

fn unix_permissions(mode: &[u8]) -> u32 {
    let mut bits = 0u32;
    for (i, c) in mode.iter().take(9).enumerate() {
        let bit = 1u32 << (8 - i);
        let set = match (i % 3, c) {
            (_, b'-') => false,
            (2, b'S') | (2, b'T') => false,
            _ => true,
        };
        if set {
            bits |= bit;
        }
        match (i, c) {
            (2, b's') | (2, b'S') => bits |= 0o4000,
            (5, b's') | (5, b'S') => bits |= 0o2000,
            (8, b't') | (8, b'T') => bits |= 0o1000,
            _ => {}
        }
    }
    bits
}

/// Parser for `ls -l` style listings.
#[derive(Debug, Default, Clone)]
pub struct UnixListingParser {
    reference: Option<DateTime<Utc>>,
}

impl UnixListingParser {
    /// Parser that places year-less dates relative to the current time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parser that places year-less dates relative to `now`.
    pub fn with_reference_time(now: DateTime<Utc>) -> Self {
        Self {
            reference: Some(now),
        }
    }

    fn timestamp(&self, mon: u32, day: &str, when: &str) -> Option<DateTime<Utc>> {
        let day: u32 = day.parse().ok()?;
        if let Some((h, m)) = hour_minute(when) {
            // no year: the most recent such date not in the future
            let now = self.reference.unwrap_or_else(Utc::now);
            let mut year = now.year();
            let ts = to_utc(year, mon, day, h, m)?;
            if ts > now + chrono::Duration::days(1) {
                year -= 1;
                return to_utc(year, mon, day, h, m);
            }
            return Some(ts);
        }
        let year: i32 = when.parse().ok()?;
        to_utc(year, mon, day, 0, 0)
    }
}

impl ListingParser for UnixListingParser {
    fn parse_line(&self, line: &str) -> Result<Option<FileInfo>> {
        if line.starts_with("total ") {
            return Ok(None);
        }
        let bytes = line.as_bytes();
        let kind = match bytes.first() {
            Some(b'-') => FileKind::Regular,
            Some(b'd') => FileKind::Directory,
            Some(b'l') => FileKind::Symlink,
            Some(b'b' | b'c' | b'p' | b's' | b'D') => FileKind::Special,
            _ => return Err(invalid(line)),
        };
        let toks = tokens(line);
        let m = (2..toks.len().saturating_sub(2))
            .find(|&i| {
                month(toks[i].1).is_some()
                    && toks[i + 1].1.parse::<u32>().map_or(false, |d| (1..=31).contains(&d))
            })
            .ok_or_else(|| invalid(line))?;
        let name_tok = toks.get(m + 3).ok_or_else(|| invalid(line))?;
        let mut name = &line[name_tok.0..];

        let mut info = FileInfo::new("", kind);
        if bytes.len() >= 10 {
            info.permissions = Some(unix_permissions(&bytes[1..10]));
        }
        if m >= 4 {
            info.owner = Some(toks[2].1.to_string());
        }
        if m >= 5 {
            info.group = Some(toks[3].1.to_string());
        }
        info.size = match toks[m - 1].1.parse::<u64>() {
            Ok(size) => size,
            Err(_) if kind == FileKind::Special => 0,
            Err(_) => return Err(invalid(line)),
        };
        let mon = month(toks[m].1).ok_or_else(|| invalid(line))?;
        info.modified = self.timestamp(mon, toks[m + 1].1, toks[m + 2].1);

        if kind == FileKind::Symlink {
            if let Some((link, target)) = name.split_once(" -> ") {
                name = link;
                info.symlink_target = Some(target.to_string());
            }
        }
        info.name = decode_segment(name);
        Ok(Some(info))
    }
}

/// Parser for the MS-DOS style listings of IIS and friends.
#[derive(Debug, Default, Clone)]
pub struct DosListingParser;

impl DosListingParser {
    fn timestamp(date: &str, time: &str) -> Option<DateTime<Utc>> {
        let mut parts = date.split('-');
        let mon: u32 = parts.next()?.parse().ok()?;
        let day: u32 = parts.next()?.parse().ok()?;
        let year_tok = parts.next()?;
        let mut year: i32 = year_tok.parse().ok()?;
        if year_tok.len() == 2 {
            year += if year < 70 { 2000 } else { 1900 };
        }
        let upper = time.to_ascii_uppercase();
        let (clock, pm) = match (upper.strip_suffix("PM"), upper.strip_suffix("AM")) {
            (Some(c), _) => (c.to_string(), Some(true)),
            (_, Some(c)) => (c.to_string(), Some(false)),
            _ => (upper.clone(), None),
        };
        let (mut h, m) = hour_minute(&clock)?;
        match pm {
            Some(true) if h < 12 => h += 12,
            Some(false) if h == 12 => h = 0,
            _ => {}
        }
        to_utc(year, mon, day, h, m)
    }
}

impl ListingParser for DosListingParser {
    fn parse_line(&self, line: &str) -> Result<Option<FileInfo>> {
        let toks = tokens(line);
        if toks.len() < 4 {
            return Err(invalid(line));
        }
        let modified = Self::timestamp(toks[0].1, toks[1].1).ok_or_else(|| invalid(line))?;
        let mut info = if toks[2].1.eq_ignore_ascii_case("<DIR>") {
            FileInfo::new("", FileKind::Directory)
        } else {
            let mut info = FileInfo::new("", FileKind::Regular);
            info.size = toks[2].1.replace(',', "").parse().map_err(|_| invalid(line))?;
            info
        };
        info.modified = Some(modified);
        info.name = decode_segment(&line[toks[3].0..]);
        Ok(Some(info))
    }
}

/// Picks the Unix or DOS format per line.
#[derive(Debug, Default, Clone)]
pub struct AutoListingParser {
    unix: UnixListingParser,
}

impl AutoListingParser {
    /// Auto-detecting parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Auto-detecting parser with a fixed reference time for Unix dates.
    pub fn with_reference_time(now: DateTime<Utc>) -> Self {
        Self {
            unix: UnixListingParser::with_reference_time(now),
        }
    }
}

impl ListingParser for AutoListingParser {
    fn parse_line(&self, line: &str) -> Result<Option<FileInfo>> {
        if line.as_bytes().first().map_or(false, u8::is_ascii_digit) {
            DosListingParser.parse_line(line)
        } else {
            self.unix.parse_line(line)
        }
    }
}
