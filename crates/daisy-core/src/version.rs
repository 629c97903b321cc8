//! Firmware version strings as reported by blocks
//!
//! Versions look like `<major>.<minor>.<patch>[-(alpha|beta|rc)][-<count>][-g<commit>][-f]`
//! and may be embedded in surrounding text such as a firmware file name
//! (`BLOCKS control 0.2.2-2-g25eaec8a-f.syx`).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("No version number found in {0:?}")]
    NotFound(String),
}

/// Pre-release stage of a build, ordered by priority
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseType {
    Alpha,
    Beta,
    Rc,
    #[default]
    Final,
}

impl ReleaseType {
    fn tag(self) -> Option<&'static str> {
        match self {
            ReleaseType::Alpha => Some("alpha"),
            ReleaseType::Beta => Some("beta"),
            ReleaseType::Rc => Some("rc"),
            ReleaseType::Final => None,
        }
    }
}

/// Parsed firmware version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlocksVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub release_type: ReleaseType,
    /// Builds since the release tag
    pub release_count: u32,
    /// Short commit hash, without the `g` prefix
    pub commit: Option<String>,
    /// Forced builds install regardless of version ordering
    pub forced: bool,
}

impl BlocksVersion {
    /// Parse leniently: an unrecognised string yields `0.0.0`
    pub fn new(text: &str) -> Self {
        match Self::parse(text) {
            Ok(version) => version,
            Err(e) => {
                debug!(error = %e, "Using default version");
                Self::default()
            }
        }
    }

    /// Parse the first version found in `text`
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let bytes = text.as_bytes();

        for start in 0..bytes.len() {
            if !bytes[start].is_ascii_digit() {
                continue;
            }
            if start > 0 && bytes[start - 1].is_ascii_digit() {
                continue;
            }

            let mut cursor = Cursor::new(&text[start..]);
            if let Some(version) = cursor.version() {
                return Ok(version);
            }
        }

        Err(VersionError::NotFound(text.to_string()))
    }

    pub fn is_valid_version(text: &str) -> bool {
        Self::parse(text).is_ok()
    }

    pub fn is_greater_than(&self, other: &Self) -> bool {
        if self.major != other.major {
            return self.major > other.major;
        }
        if self.minor != other.minor {
            return self.minor > other.minor;
        }
        if self.patch != other.patch {
            return self.patch > other.patch;
        }
        if self.release_type != other.release_type {
            return self.release_type > other.release_type;
        }
        self.release_count > other.release_count
    }

    /// Full form including release, commit and forced suffixes
    pub fn to_string_extended(&self) -> String {
        let mut out = self.to_string();

        if let Some(tag) = self.release_type.tag() {
            out.push_str(&format!("-{}-{}", tag, self.release_count));
        } else if self.release_count > 0 {
            out.push_str(&format!("-{}", self.release_count));
        }

        if let Some(commit) = &self.commit {
            out.push_str(&format!("-g{}", commit));
        }

        if self.forced {
            out.push_str("-f");
        }

        out
    }
}

impl PartialEq for BlocksVersion {
    fn eq(&self, other: &Self) -> bool {
        self.major == other.major
            && self.minor == other.minor
            && self.patch == other.patch
            && self.release_type == other.release_type
            && self.release_count == other.release_count
    }
}

impl Eq for BlocksVersion {}

impl Ord for BlocksVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.is_greater_than(other) {
            Ordering::Greater
        } else if self == other {
            Ordering::Equal
        } else {
            Ordering::Less
        }
    }
}

impl PartialOrd for BlocksVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlocksVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for BlocksVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Hand-rolled matcher for the version grammar
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { rest: text }
    }

    fn version(&mut self) -> Option<BlocksVersion> {
        let major = self.number()?;
        self.literal(".").then_some(())?;
        let minor = self.number()?;
        self.literal(".").then_some(())?;
        let patch = self.number()?;

        let mut version = BlocksVersion {
            major,
            minor,
            patch,
            ..BlocksVersion::default()
        };

        for (tag, release_type) in [
            ("-alpha", ReleaseType::Alpha),
            ("-beta", ReleaseType::Beta),
            ("-rc", ReleaseType::Rc),
        ] {
            if self.literal(tag) {
                version.release_type = release_type;
                break;
            }
        }

        if let Some(count) = self.dashed(|c| c.number()) {
            version.release_count = count;
        }

        if let Some(commit) = self.dashed(|c| {
            c.literal("g")
                .then(|| c.take_while(|ch| ch.is_ascii_alphanumeric()))
                .filter(|s| !s.is_empty())
        }) {
            version.commit = Some(commit.to_string());
        }

        version.forced = self.literal("-f");
        Some(version)
    }

    /// Run `parse` after a `-`, restoring the cursor if it fails
    fn dashed<T>(&mut self, parse: impl FnOnce(&mut Self) -> Option<T>) -> Option<T> {
        let saved = self.rest;
        if self.literal("-") {
            if let Some(value) = parse(self) {
                return Some(value);
            }
        }
        self.rest = saved;
        None
    }

    fn literal(&mut self, expected: &str) -> bool {
        match self.rest.strip_prefix(expected) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let end = self.rest.find(|c: char| !pred(c)).unwrap_or(self.rest.len());
        let (taken, rest) = self.rest.split_at(end);
        self.rest = rest;
        taken
    }

    fn number(&mut self) -> Option<u32> {
        let saved = self.rest;
        let digits = self.take_while(|c| c.is_ascii_digit());
        match digits.parse() {
            Ok(n) => Some(n),
            Err(_) => {
                self.rest = saved;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> BlocksVersion {
        BlocksVersion::new(s)
    }

    #[test]
    fn test_compare_patch() {
        assert!(v("4.6.7") < v("4.6.11"));
        assert!(v("4.6.6") > v("4.6.2"));
        assert!(v("4.6.5") <= v("4.6.8"));
        assert!(v("4.6.4") >= v("4.6.3"));
    }

    #[test]
    fn test_compare_minor_and_major() {
        assert!(v("4.5.9") < v("4.6.7"));
        assert!(v("4.15.2") > v("4.6.6"));
        assert!(v("4.6.9") < v("8.5.7"));
        assert!(v("15.6.2") > v("4.9.6"));
    }

    #[test]
    fn test_compare_release_count() {
        assert!(v("0.3.2-alpha-3-gjduh") < v("0.3.2-alpha-12-gjduh"));
        assert!(v("0.3.2-alpha-4-gjduh") > v("0.3.2-alpha-1-gjduh"));
        assert!(v("0.3.2-beta-5-gjduh") <= v("0.3.2-beta-6-gjduh"));
    }

    #[test]
    fn test_compare_release_type() {
        assert!(v("0.3.2-alpha-3-gabc") < v("0.3.2-beta-1-gabc"));
        assert!(v("0.3.2-beta-3-gabc") < v("0.3.2"));
        assert!(v("0.3.2") > v("0.3.2-alpha-3-gabc"));
        assert!(v("1.0.0-rc-1") > v("1.0.0-beta-9"));
    }

    #[test]
    fn test_equality_ignores_commit_and_forced() {
        assert_eq!(v("4.6.7"), v("4.6.7"));
        assert_eq!(v("4.6.7-alpha-3-gsdfsf"), v("4.6.7-alpha-3-gsdfsf"));
        assert_eq!(v("4.6.7-alpha-3-gaaaa"), v("4.6.7-alpha-3-gbbbb-f"));
    }

    #[test]
    fn test_forced() {
        assert!(v("0.2.2-2-g25eaec8a-f").forced);
        assert!(v("0.2.2-2-f").forced);
        assert!(!v("0.2.2-2-g25eaec8-d7").forced);
    }

    #[test]
    fn test_fields() {
        let version = v("0.2.2-2-g25eaec8a-f");
        assert_eq!((version.major, version.minor, version.patch), (0, 2, 2));
        assert_eq!(version.release_type, ReleaseType::Final);
        assert_eq!(version.release_count, 2);
        assert_eq!(version.commit.as_deref(), Some("25eaec8a"));
    }

    #[test]
    fn test_valid_strings() {
        assert!(BlocksVersion::is_valid_version("Rainbow 0.4.5-beta-1-g4c36e"));
        assert!(!BlocksVersion::is_valid_version("0.4-beta-1-g4c36e"));
        assert!(!BlocksVersion::is_valid_version("a.0.4-beta-1-g4c36e"));
        assert!(BlocksVersion::is_valid_version("BLOCKS control 0.2.2-2-g25eaec8a-f.syx"));
        assert_eq!(
            v("BLOCKS control 0.2.2-2-g25eaec8a-f.syx"),
            v("0.2.2-2-g25eaec8a-f")
        );
    }

    #[test]
    fn test_parse_error() {
        assert_eq!(
            BlocksVersion::parse("no version"),
            Err(VersionError::NotFound("no version".to_string()))
        );
        assert_eq!("1.2.3".parse::<BlocksVersion>().map(|v| v.patch), Ok(3));
    }

    #[test]
    fn test_default_is_zero() {
        assert_eq!(BlocksVersion::default(), v("0.0.0"));
        assert_eq!(v("garbage"), BlocksVersion::default());
    }

    #[test]
    fn test_extended_string() {
        assert_eq!(v("0.3.2-beta-5-gabc12-f").to_string_extended(), "0.3.2-beta-5-gabc12-f");
        assert_eq!(v("1.0.4").to_string_extended(), "1.0.4");
        assert_eq!(v("1.0.4-beta-5-gabc").to_string(), "1.0.4");
    }
}
