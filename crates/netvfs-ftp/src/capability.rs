//! Per-session server capabilities and quirks.
//!
//! Features are discovered once at mount. Workarounds are sticky bits any
//! task may turn on when it catches the server misbehaving; they are
//! updated with a compare-and-swap loop and read without locking.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{info, warn};

use crate::dir_cache::KeyPolicy;
use crate::listing::{AutoListingParser, DosListingParser, ListingParser, UnixListingParser};
use crate::reply::Reply;

/// Protocol extensions advertised by `FEAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// `MDTM`: modification time of a file.
    Mdtm,
    /// `SIZE`: size of a file.
    Size,
    /// `TVFS`: trivial virtual file store, `/`-separated paths.
    Tvfs,
    /// `EPSV`: extended passive mode.
    Epsv,
    /// `UTF8`: UTF-8 path names.
    Utf8,
}

impl Feature {
    const ALL: [Feature; 5] = [
        Feature::Mdtm,
        Feature::Size,
        Feature::Tvfs,
        Feature::Epsv,
        Feature::Utf8,
    ];

    fn bit(self) -> u32 {
        match self {
            Feature::Mdtm => 0x01,
            Feature::Size => 0x02,
            Feature::Tvfs => 0x04,
            Feature::Epsv => 0x08,
            Feature::Utf8 => 0x10,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Feature::Mdtm => "MDTM",
            Feature::Size => "SIZE",
            Feature::Tvfs => "TVFS",
            Feature::Epsv => "EPSV",
            Feature::Utf8 => "UTF8",
        }
    }
}

/// Set of [`Feature`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features(u32);

impl Features {
    /// No extensions.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Add a feature.
    pub fn with(self, feature: Feature) -> Self {
        Self(self.0 | feature.bit())
    }

    /// Whether `feature` is in the set.
    pub fn contains(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    /// Parse a `FEAT` reply. Only lines starting with a space list
    /// features; the keyword match is case-insensitive.
    pub fn parse(reply: &Reply) -> Self {
        let mut features = Self::empty();
        for line in reply.lines.iter().filter(|l| l.starts_with(' ')) {
            let word = line
                .trim_start_matches(' ')
                .split(|c: char| c.is_whitespace())
                .next()
                .unwrap_or("");
            if let Some(f) = Feature::ALL
                .iter()
                .find(|f| word.eq_ignore_ascii_case(f.keyword()))
            {
                features = features.with(*f);
            }
        }
        features
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Feature::ALL
            .iter()
            .filter(|feat| self.contains(**feat))
            .map(|feat| feat.keyword())
            .collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// Behaviour adjustments for non-conforming servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workaround {
    /// `FEAT` fails before login and has to be repeated afterwards.
    FeatAfterLogin,
    /// `PASV` replies carry an unreachable address; connect to the control
    /// connection's peer instead.
    PasvAddr,
    /// `EPSV` is advertised but broken.
    NoEpsv,
}

impl Workaround {
    fn bit(self) -> u32 {
        match self {
            Workaround::FeatAfterLogin => 0x01,
            Workaround::PasvAddr => 0x02,
            Workaround::NoEpsv => 0x04,
        }
    }
}

/// Server family, from the `SYST` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemDialect {
    /// `UNIX Type: L8` and friends.
    Unix,
    /// `Windows_NT`, usually IIS.
    Windows,
    /// Anything else, or `SYST` failed.
    #[default]
    Unknown,
}

const DIALECTS: &[(&str, SystemDialect)] = &[
    ("UNIX ", SystemDialect::Unix),
    ("WINDOWS_NT ", SystemDialect::Windows),
];

impl SystemDialect {
    /// Match the `SYST` reply text against the known dialects, first
    /// match wins.
    pub fn detect(reply: &Reply) -> Self {
        let text = reply.text();
        DIALECTS
            .iter()
            .find(|(prefix, _)| {
                text.len() >= prefix.len()
                    && text.is_char_boundary(prefix.len())
                    && text[..prefix.len()].eq_ignore_ascii_case(prefix)
            })
            .map(|(_, d)| *d)
            .unwrap_or_default()
    }

    /// Command for a directory listing.
    pub fn list_command(&self) -> &'static str {
        match self {
            SystemDialect::Unix => "LIST -a",
            SystemDialect::Windows | SystemDialect::Unknown => "LIST",
        }
    }

    /// How directory cache keys compare.
    pub fn key_policy(&self) -> KeyPolicy {
        match self {
            SystemDialect::Windows => KeyPolicy::CaseInsensitive,
            SystemDialect::Unix | SystemDialect::Unknown => KeyPolicy::CaseSensitive,
        }
    }

    /// Listing parser for this dialect.
    pub fn parser(&self) -> Arc<dyn ListingParser> {
        match self {
            SystemDialect::Unix => Arc::new(UnixListingParser::new()),
            SystemDialect::Windows => Arc::new(DosListingParser),
            SystemDialect::Unknown => Arc::new(AutoListingParser::new()),
        }
    }
}

/// Capability handle shared by every task of a session.
#[derive(Debug, Default)]
pub struct Capabilities {
    features: AtomicU32,
    workarounds: AtomicU32,
    dialect: OnceLock<SystemDialect>,
}

impl Capabilities {
    /// Nothing known yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertised features.
    pub fn features(&self) -> Features {
        Features(self.features.load(Ordering::Acquire))
    }

    /// Shorthand for `features().contains(feature)`.
    pub fn has_feature(&self, feature: Feature) -> bool {
        self.features().contains(feature)
    }

    /// Record the result of feature discovery.
    pub fn set_features(&self, features: Features) {
        self.features.store(features.0, Ordering::Release);
        info!(features = %features, "server features");
    }

    /// Whether `workaround` is on.
    pub fn has_workaround(&self, workaround: Workaround) -> bool {
        self.workarounds.load(Ordering::Acquire) & workaround.bit() != 0
    }

    /// Turn `workaround` on. Returns true if this call turned it on.
    pub fn enable_workaround(&self, workaround: Workaround) -> bool {
        let bit = workaround.bit();
        let mut current = self.workarounds.load(Ordering::Acquire);
        loop {
            if current & bit != 0 {
                return false;
            }
            match self.workarounds.compare_exchange_weak(
                current,
                current | bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    warn!(?workaround, "enabling server workaround");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Server dialect, `Unknown` until detected.
    pub fn dialect(&self) -> SystemDialect {
        self.dialect.get().copied().unwrap_or_default()
    }

    /// Record the detected dialect. Only the first call has an effect.
    pub fn set_dialect(&self, dialect: SystemDialect) {
        if self.dialect.set(dialect).is_ok() {
            info!(?dialect, "server dialect");
        }
    }
}
