//! Reply parsing and status classification.
//!
//! A reply is one or more CRLF-terminated lines. The first line starts with
//! a three-digit status code; a dash right after the code opens a
//! multi-line reply that runs until a line starting with the same code
//! followed by a space.

use std::fmt;
use std::ops::BitOr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{FtpError, Result};

/// Outcome category of a status code, taken from its first digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyClass {
    /// 1xx
    Preliminary,
    /// 2xx
    Success,
    /// 3xx
    Intermediate,
    /// 4xx
    TransientFailure,
    /// 5xx
    PermanentFailure,
}

impl ReplyClass {
    /// Classify a status code. Total over 100..=599, `None` outside.
    pub fn of(code: u16) -> Option<Self> {
        match code / 100 {
            1 if code >= 100 => Some(ReplyClass::Preliminary),
            2 => Some(ReplyClass::Success),
            3 => Some(ReplyClass::Intermediate),
            4 => Some(ReplyClass::TransientFailure),
            5 => Some(ReplyClass::PermanentFailure),
            _ => None,
        }
    }
}

/// Per-call description of which reply categories the caller expects.
///
/// Success replies are always expected unless `FAIL_200` is given;
/// transient failures are never expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseFlags(u8);

impl ResponseFlags {
    /// Only success is acceptable.
    pub const NONE: ResponseFlags = ResponseFlags(0);
    /// Preliminary (1xx) replies are acceptable.
    pub const PASS_100: ResponseFlags = ResponseFlags(0x01);
    /// Intermediate (3xx) replies are acceptable.
    pub const PASS_300: ResponseFlags = ResponseFlags(0x02);
    /// Any permanent failure (5xx) is returned to the caller unrecorded.
    pub const PASS_500: ResponseFlags = ResponseFlags(0x04);
    /// A 550 reply is returned to the caller unrecorded.
    pub const PASS_550: ResponseFlags = ResponseFlags(0x08);
    /// A success reply is a protocol error (e.g. a transfer that should have started).
    pub const FAIL_200: ResponseFlags = ResponseFlags(0x10);

    /// True if every bit of `flag` is set.
    pub fn contains(&self, flag: ResponseFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    /// Whether `reply` is acceptable, or the error to record for it.
    pub fn check(&self, reply: &Reply) -> Result<()> {
        let accepted = match reply.class() {
            ReplyClass::Preliminary => self.contains(Self::PASS_100),
            ReplyClass::Success => {
                if self.contains(Self::FAIL_200) {
                    return Err(FtpError::UnexpectedReply {
                        code: reply.code,
                        lines: reply.lines.clone(),
                    });
                }
                true
            }
            ReplyClass::Intermediate => self.contains(Self::PASS_300),
            ReplyClass::TransientFailure => false,
            ReplyClass::PermanentFailure => {
                self.contains(Self::PASS_500) || (reply.code == 550 && self.contains(Self::PASS_550))
            }
        };
        if accepted {
            Ok(())
        } else {
            Err(FtpError::remote(reply.code, &reply.lines))
        }
    }
}

impl BitOr for ResponseFlags {
    type Output = ResponseFlags;

    fn bitor(self, rhs: ResponseFlags) -> ResponseFlags {
        ResponseFlags(self.0 | rhs.0)
    }
}

/// A complete server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit status code.
    pub code: u16,
    /// Raw lines without line terminators. The code appears on the first
    /// and (for multi-line replies) the last line.
    pub lines: Vec<String>,
}

impl Reply {
    /// Category of this reply.
    pub fn class(&self) -> ReplyClass {
        // codes are validated when the first line is parsed
        ReplyClass::of(self.code).unwrap_or(ReplyClass::PermanentFailure)
    }

    /// Text of the first line after the code and separator.
    pub fn text(&self) -> &str {
        self.lines
            .first()
            .map(|l| l.get(4..).unwrap_or(""))
            .unwrap_or("")
    }

    /// Lines between the first and the last line of a multi-line reply.
    pub fn body(&self) -> &[String] {
        if self.lines.len() > 2 {
            &self.lines[1..self.lines.len() - 1]
        } else {
            &[]
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lines.join(" | "))
    }
}

/// Incremental reply assembler: feed lines, get a reply once complete.
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    code: Option<u16>,
    terminator: String,
    lines: Vec<String>,
}

impl ReplyAssembler {
    /// Create an empty assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without CRLF). Returns the reply when this line
    /// completes it.
    pub fn feed(&mut self, line: &str) -> Result<Option<Reply>> {
        match self.code {
            None => {
                let code = parse_status(line)?;
                self.lines.push(line.to_string());
                if line.as_bytes().get(3) == Some(&b'-') {
                    self.code = Some(code);
                    self.terminator = format!("{code} ");
                    Ok(None)
                } else {
                    Ok(Some(self.finish(code)))
                }
            }
            Some(code) => {
                self.lines.push(line.to_string());
                if line.starts_with(&self.terminator) {
                    Ok(Some(self.finish(code)))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn finish(&mut self, code: u16) -> Reply {
        self.code = None;
        self.terminator.clear();
        Reply {
            code,
            lines: std::mem::take(&mut self.lines),
        }
    }
}

fn parse_status(line: &str) -> Result<u16> {
    let malformed = || FtpError::MalformedReply {
        line: line.to_string(),
    };
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(malformed());
    }
    match bytes.get(3) {
        None | Some(b' ') | Some(b'-') => {}
        Some(_) => return Err(malformed()),
    }
    let code: u16 = line[..3].parse().map_err(|_| malformed())?;
    if ReplyClass::of(code).is_none() {
        return Err(malformed());
    }
    Ok(code)
}

/// Longest reply line accepted, terminator included.
pub const MAX_REPLY_LINE: usize = 8 * 1024;

/// Read one complete reply from `reader`.
///
/// A line longer than [`MAX_REPLY_LINE`] fails with
/// [`FtpError::MalformedReply`].
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut assembler = ReplyAssembler::new();
    let mut buf = Vec::with_capacity(128);
    loop {
        buf.clear();
        let n = (&mut *reader)
            .take(MAX_REPLY_LINE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Err(FtpError::ConnectionClosed);
        }
        if n > MAX_REPLY_LINE {
            let head = String::from_utf8_lossy(&buf[..64]);
            return Err(FtpError::MalformedReply {
                line: format!("{head}... ({n}+ bytes without a line break)"),
            });
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf);
        if let Some(reply) = assembler.feed(&line)? {
            return Ok(reply);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: u16) -> Reply {
        Reply {
            code,
            lines: vec![format!("{code} text")],
        }
    }

    #[test]
    fn test_classify_first_digit() {
        assert_eq!(ReplyClass::of(150), Some(ReplyClass::Preliminary));
        assert_eq!(ReplyClass::of(226), Some(ReplyClass::Success));
        assert_eq!(ReplyClass::of(350), Some(ReplyClass::Intermediate));
        assert_eq!(ReplyClass::of(421), Some(ReplyClass::TransientFailure));
        assert_eq!(ReplyClass::of(550), Some(ReplyClass::PermanentFailure));
        assert_eq!(ReplyClass::of(99), None);
        assert_eq!(ReplyClass::of(600), None);
    }

    #[test]
    fn test_flags_default_accepts_only_success() {
        let flags = ResponseFlags::NONE;
        assert!(flags.check(&reply(200)).is_ok());
        assert!(flags.check(&reply(150)).is_err());
        assert!(flags.check(&reply(331)).is_err());
        assert!(flags.check(&reply(450)).is_err());
        assert!(flags.check(&reply(550)).is_err());
    }

    #[test]
    fn test_flags_pass_and_fail() {
        let transfer = ResponseFlags::PASS_100 | ResponseFlags::FAIL_200;
        assert!(transfer.check(&reply(150)).is_ok());
        assert!(matches!(
            transfer.check(&reply(226)),
            Err(FtpError::UnexpectedReply { code: 226, .. })
        ));

        let only_550 = ResponseFlags::PASS_550;
        assert!(only_550.check(&reply(550)).is_ok());
        assert!(only_550.check(&reply(553)).is_err());

        let any_500 = ResponseFlags::PASS_500;
        assert!(any_500.check(&reply(553)).is_ok());
        assert!(any_500.check(&reply(450)).is_err());
    }

    #[test]
    fn test_unexpected_category_carries_raw_reply() {
        let err = ResponseFlags::NONE.check(&reply(550)).unwrap_err();
        match err {
            FtpError::Remote { code, lines, .. } => {
                assert_eq!(code, 550);
                assert_eq!(lines, vec!["550 text".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_single_line_reply() {
        let mut asm = ReplyAssembler::new();
        let r = asm.feed("220 Welcome").unwrap().unwrap();
        assert_eq!(r.code, 220);
        assert_eq!(r.text(), "Welcome");
    }

    #[test]
    fn test_bare_code_is_a_complete_reply() {
        let mut asm = ReplyAssembler::new();
        let r = asm.feed("200").unwrap().unwrap();
        assert_eq!(r.code, 200);
        assert_eq!(r.text(), "");
    }

    #[test]
    fn test_multi_line_reply() {
        let mut asm = ReplyAssembler::new();
        assert!(asm.feed("211-Features:").unwrap().is_none());
        assert!(asm.feed(" SIZE").unwrap().is_none());
        assert!(asm.feed(" MDTM").unwrap().is_none());
        let r = asm.feed("211 End").unwrap().unwrap();
        assert_eq!(r.code, 211);
        assert_eq!(r.lines.len(), 4);
        assert_eq!(r.body(), &[" SIZE".to_string(), " MDTM".to_string()]);
    }

    #[test]
    fn test_multi_line_not_terminated_by_lookalikes() {
        let mut asm = ReplyAssembler::new();
        assert!(asm.feed("230-Hello").unwrap().is_none());
        assert!(asm.feed(" 230 indented is text").unwrap().is_none());
        assert!(asm.feed("2300 longer number").unwrap().is_none());
        assert!(asm.feed("230-dash continues").unwrap().is_none());
        assert!(asm.feed("231 other code").unwrap().is_none());
        let r = asm.feed("230 done").unwrap().unwrap();
        assert_eq!(r.lines.len(), 6);
    }

    #[test]
    fn test_malformed_first_line() {
        let mut asm = ReplyAssembler::new();
        assert!(asm.feed("hello").is_err());
        assert!(asm.feed("20").is_err());
        assert!(asm.feed("2000").is_err());
        assert!(asm.feed("099 low").is_err());
        assert!(asm.feed("600 high").is_err());
    }

    #[tokio::test]
    async fn test_read_reply_from_stream() {
        let data: &[u8] = b"211-Features:\r\n EPSV\r\n211 End\r\n220 next\r\n";
        let mut reader = data;
        let first = read_reply(&mut reader).await.unwrap();
        assert_eq!(first.code, 211);
        assert_eq!(first.lines, vec!["211-Features:", " EPSV", "211 End"]);
        let second = read_reply(&mut reader).await.unwrap();
        assert_eq!(second.code, 220);
        assert!(matches!(
            read_reply(&mut reader).await,
            Err(FtpError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_reply_rejects_overlong_line() {
        let mut data = b"220 ".to_vec();
        data.extend(std::iter::repeat(b'x').take(MAX_REPLY_LINE * 2));
        data.extend_from_slice(b"\r\n");
        let mut reader = data.as_slice();
        assert!(matches!(
            read_reply(&mut reader).await,
            Err(FtpError::MalformedReply { .. })
        ));

        let mut line = b"220 ".to_vec();
        line.extend(std::iter::repeat(b'y').take(MAX_REPLY_LINE - 6));
        line.extend_from_slice(b"\r\n");
        let mut reader = line.as_slice();
        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply.code, 220);
    }

    #[tokio::test]
    async fn test_read_reply_eof_mid_reply() {
        let data: &[u8] = b"150-opening\r\nstill going\r\n";
        let mut reader = data;
        assert!(matches!(
            read_reply(&mut reader).await,
            Err(FtpError::ConnectionClosed)
        ));
    }
}
