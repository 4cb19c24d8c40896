//! Core identifiers for the workspace: package paths, versions, version
//! ranges, and package ids.
//!
//! Everything here is pure data plus comparison/derivation logic; no I/O
//! happens in this crate.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Namespaces recognized as the leading element of a [`PackagePath`], in the
/// fixed order used to compare paths before falling back to element-wise
/// comparison. Anything outside this closed set still parses, it just sorts
/// after all of these.
const NAMESPACE_ORDER: &[&str] = &["org", "com", "pvt", "public", "demo"];

/// Length, in hex characters, of the short hash used for on-disk layout.
pub const SHORT_HASH_LEN: usize = 10;

#[derive(Error, Debug)]
pub enum TypesError {
    #[error("empty package path")]
    EmptyPath,
    #[error("invalid character {0:?} in package path element {1:?}")]
    InvalidPathChar(char, String),
    #[error("invalid version: {0}")]
    InvalidVersion(String),
    #[error("invalid version range: {0}")]
    InvalidVersionRange(String),
}

/// A dotted, case-insensitively compared package path, e.g. `org.sqlite`.
///
/// Elements are normalized on parse (`-` becomes `_`) but original casing is
/// preserved for display; equality, hashing, and ordering all operate on the
/// lowercased form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagePath {
    elements: Vec<String>,
}

impl PackagePath {
    /// Parse a dotted path. Elements must be `[A-Za-z0-9._-]`; `-` is
    /// normalized to `_`.
    pub fn parse(s: &str) -> Result<Self, TypesError> {
        if s.is_empty() {
            return Err(TypesError::EmptyPath);
        }
        let mut elements = Vec::new();
        for raw in s.split('.') {
            if raw.is_empty() {
                return Err(TypesError::EmptyPath);
            }
            let mut element = String::with_capacity(raw.len());
            for c in raw.chars() {
                match c {
                    'A'..='Z' | 'a'..='z' | '0'..='9' | '_' => element.push(c),
                    '-' => element.push('_'),
                    other => return Err(TypesError::InvalidPathChar(other, raw.to_string())),
                }
            }
            elements.push(element);
        }
        Ok(Self { elements })
    }

    /// The path's elements in their original (un-lowercased) form.
    pub fn elements(&self) -> &[String] {
        &self.elements
    }

    /// The leading namespace element, e.g. `"org"` in `org.sqlite`.
    pub fn namespace(&self) -> &str {
        &self.elements[0]
    }

    fn namespace_rank(&self) -> usize {
        let ns = self.namespace().to_ascii_lowercase();
        NAMESPACE_ORDER
            .iter()
            .position(|n| *n == ns)
            .unwrap_or(NAMESPACE_ORDER.len())
    }

    fn lower_elements(&self) -> Vec<String> {
        self.elements.iter().map(|e| e.to_ascii_lowercase()).collect()
    }

    /// Lowercased, dot-joined form used as the hashing/equality key.
    pub fn lowercase_joined(&self) -> String {
        self.lower_elements().join(".")
    }
}

impl fmt::Display for PackagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.elements.join("."))
    }
}

impl PartialEq for PackagePath {
    fn eq(&self, other: &Self) -> bool {
        self.lower_elements() == other.lower_elements()
    }
}
impl Eq for PackagePath {}

impl std::hash::Hash for PackagePath {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.lowercase_joined().hash(state);
    }
}

impl PartialOrd for PackagePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackagePath {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.namespace_rank().cmp(&other.namespace_rank()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        self.lower_elements().cmp(&other.lower_elements())
    }
}

/// A package version: a semantic-version triple, an optional tweak, an
/// optional branch name, or the wildcard "any" version.
///
/// Branches compare as strings; numeric triples compare numerically. A
/// numeric version always sorts before a branch version, which always sorts
/// before `Any` (this cross-kind tie-break isn't spec-mandated, just
/// internally consistent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Version {
    Number {
        major: u64,
        minor: u64,
        patch: u64,
        tweak: Option<u64>,
    },
    Branch(String),
    Any,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Version::Number {
            major,
            minor,
            patch,
            tweak: None,
        }
    }

    pub fn with_tweak(major: u64, minor: u64, patch: u64, tweak: u64) -> Self {
        Version::Number {
            major,
            minor,
            patch,
            tweak: Some(tweak),
        }
    }

    pub fn branch(name: impl Into<String>) -> Self {
        Version::Branch(name.into())
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Version::Any)
    }

    /// Parse `major.minor.patch[.tweak]`, a bare branch name, or `*`/`any`.
    pub fn parse(s: &str) -> Result<Self, TypesError> {
        let s = s.trim();
        if s == "*" || s.eq_ignore_ascii_case("any") {
            return Ok(Version::Any);
        }
        if s.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            let parts: Vec<&str> = s.split('.').collect();
            if !(3..=4).contains(&parts.len()) {
                return Err(TypesError::InvalidVersion(s.to_string()));
            }
            let num = |p: &str| {
                p.parse::<u64>()
                    .map_err(|_| TypesError::InvalidVersion(s.to_string()))
            };
            let major = num(parts[0])?;
            let minor = num(parts[1])?;
            let patch = num(parts[2])?;
            let tweak = if parts.len() == 4 { Some(num(parts[3])?) } else { None };
            return Ok(Version::Number {
                major,
                minor,
                patch,
                tweak,
            });
        }
        Ok(Version::Branch(s.to_string()))
    }

    fn rank(&self) -> u8 {
        match self {
            Version::Number { .. } => 0,
            Version::Branch(_) => 1,
            Version::Any => 2,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Number {
                major,
                minor,
                patch,
                tweak,
            } => match tweak {
                Some(t) => write!(f, "{major}.{minor}.{patch}.{t}"),
                None => write!(f, "{major}.{minor}.{patch}"),
            },
            Version::Branch(b) => write!(f, "{b}"),
            Version::Any => write!(f, "*"),
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self, other) {
            (
                Version::Number {
                    major: ma,
                    minor: mi,
                    patch: pa,
                    tweak: ta,
                },
                Version::Number {
                    major: mb,
                    minor: mib,
                    patch: pb,
                    tweak: tb,
                },
            ) => (ma, mi, pa, ta.unwrap_or(0)).cmp(&(mb, mib, pb, tb.unwrap_or(0))),
            (Version::Branch(a), Version::Branch(b)) => a.cmp(b),
            (Version::Any, Version::Any) => Ordering::Equal,
            _ => Ordering::Equal,
        }
    }
}

impl std::hash::Hash for Version {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

/// One endpoint of a [`VersionRange`] interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    Unbounded,
    Inclusive(Version),
    Exclusive(Version),
}

/// A single contiguous interval of versions.
#[derive(Debug, Clone)]
pub struct Interval {
    pub lower: Bound,
    pub upper: Bound,
}

impl Interval {
    pub fn contains(&self, v: &Version) -> bool {
        let above_lower = match &self.lower {
            Bound::Unbounded => true,
            Bound::Inclusive(b) => v >= b,
            Bound::Exclusive(b) => v > b,
        };
        let below_upper = match &self.upper {
            Bound::Unbounded => true,
            Bound::Inclusive(b) => v <= b,
            Bound::Exclusive(b) => v < b,
        };
        above_lower && below_upper
    }
}

/// A union of [`Interval`]s. Membership and `max_satisfying` are the two
/// operations the resolver actually needs.
#[derive(Debug, Clone, Default)]
pub struct VersionRange {
    intervals: Vec<Interval>,
}

impl VersionRange {
    pub fn any() -> Self {
        Self {
            intervals: vec![Interval {
                lower: Bound::Unbounded,
                upper: Bound::Unbounded,
            }],
        }
    }

    pub fn exact(v: Version) -> Self {
        Self {
            intervals: vec![Interval {
                lower: Bound::Inclusive(v.clone()),
                upper: Bound::Inclusive(v),
            }],
        }
    }

    pub fn from_intervals(intervals: Vec<Interval>) -> Self {
        Self { intervals }
    }

    /// Parse a caret range (`^1.2.3`), a tilde range (`~1.2.3`), a plain
    /// exact version, or `*`/`any`.
    pub fn parse(s: &str) -> Result<Self, TypesError> {
        let s = s.trim();
        if s.is_empty() || s == "*" || s.eq_ignore_ascii_case("any") {
            return Ok(Self::any());
        }
        if let Some(rest) = s.strip_prefix('^') {
            let v = Version::parse(rest).map_err(|_| TypesError::InvalidVersionRange(s.to_string()))?;
            return Self::caret_range(v);
        }
        if let Some(rest) = s.strip_prefix('~') {
            let v = Version::parse(rest).map_err(|_| TypesError::InvalidVersionRange(s.to_string()))?;
            return Self::tilde_range(v);
        }
        let v = Version::parse(s).map_err(|_| TypesError::InvalidVersionRange(s.to_string()))?;
        Ok(Self::exact(v))
    }

    fn caret_range(v: Version) -> Result<Self, TypesError> {
        let Version::Number { major, minor, patch, .. } = v.clone() else {
            return Ok(Self::exact(v));
        };
        let upper = if major > 0 {
            Version::new(major + 1, 0, 0)
        } else if minor > 0 {
            Version::new(0, minor + 1, 0)
        } else {
            Version::new(0, 0, patch + 1)
        };
        Ok(Self {
            intervals: vec![Interval {
                lower: Bound::Inclusive(v),
                upper: Bound::Exclusive(upper),
            }],
        })
    }

    fn tilde_range(v: Version) -> Result<Self, TypesError> {
        let Version::Number { major, minor, .. } = v.clone() else {
            return Ok(Self::exact(v));
        };
        let upper = Version::new(major, minor + 1, 0);
        Ok(Self {
            intervals: vec![Interval {
                lower: Bound::Inclusive(v),
                upper: Bound::Exclusive(upper),
            }],
        })
    }

    pub fn contains(&self, v: &Version) -> bool {
        if v.is_any() {
            return true;
        }
        self.intervals.iter().any(|i| i.contains(v))
    }

    /// The largest candidate satisfying this range, or `None` if none do.
    pub fn max_satisfying<'a>(&self, candidates: impl IntoIterator<Item = &'a Version>) -> Option<&'a Version> {
        candidates.into_iter().filter(|v| self.contains(v)).max()
    }
}

/// A package path paired with a resolved version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageId {
    pub path: PackagePath,
    pub version: Version,
}

impl PackageId {
    pub fn new(path: PackagePath, version: Version) -> Self {
        Self { path, version }
    }

    /// Keyed hash of `lowercase(path) + "-" + version`, hex-encoded in full.
    /// The key (a fixed context string) domain-separates this hash from
    /// other blake3 uses in the workspace; it is not a secret.
    pub fn hash(&self) -> String {
        let input = format!("{}-{}", self.path.lowercase_joined(), self.version);
        blake3::derive_key("pm-types package-id v1", input.as_bytes())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    /// Fixed-length prefix of [`Self::hash`], used for on-disk layout.
    pub fn short_hash(&self) -> String {
        self.hash().chars().take(SHORT_HASH_LEN).collect()
    }

    /// `aa/bb/cc/dd/<rest>` derived from the short hash. This layout is a
    /// wire-visible contract (storage migration tools depend on it) and must
    /// not change shape.
    pub fn filesystem_subpath(&self) -> std::path::PathBuf {
        let short: Vec<char> = self.short_hash().chars().collect();
        let seg = |from: usize, to: usize| -> String { short[from..to].iter().collect() };
        let mut p = std::path::PathBuf::new();
        p.push(seg(0, 2));
        p.push(seg(2, 4));
        p.push(seg(4, 6));
        p.push(seg(6, 8));
        p.push(short[8..].iter().collect::<String>());
        p
    }

    /// `path + "-" + version`, e.g. `org.sqlite-3.42.0`.
    pub fn target_name(&self) -> String {
        format!("{}-{}", self.path, self.version)
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.path, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_equality_ignores_case() {
        let a = PackagePath::parse("org.SQLite").unwrap();
        let b = PackagePath::parse("ORG.sqlite").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn path_normalizes_dashes() {
        let p = PackagePath::parse("org.my-lib").unwrap();
        assert_eq!(p.elements()[1], "my_lib");
    }

    #[test]
    fn path_rejects_bad_chars() {
        assert!(PackagePath::parse("org.my lib").is_err());
    }

    #[test]
    fn namespace_order_beats_element_order() {
        let a = PackagePath::parse("com.zzz").unwrap();
        let b = PackagePath::parse("org.aaa").unwrap();
        assert_eq!(a.cmp(&b), Ordering::Less);
    }

    #[test]
    fn version_numeric_compares_numerically() {
        let a = Version::parse("1.9.0").unwrap();
        let b = Version::parse("1.10.0").unwrap();
        assert!(a < b);
    }

    #[test]
    fn version_branch_compares_as_string() {
        let a = Version::branch("main");
        let b = Version::branch("release");
        assert!(a < b);
    }

    #[test]
    fn version_any_is_wildcard() {
        let any = Version::parse("*").unwrap();
        assert!(any.is_any());
        let range = VersionRange::parse("^1.2.0").unwrap();
        assert!(range.contains(&any));
    }

    #[test]
    fn caret_range_excludes_next_major() {
        let range = VersionRange::parse("^1.2.0").unwrap();
        assert!(range.contains(&Version::new(1, 9, 0)));
        assert!(!range.contains(&Version::new(2, 0, 0)));
    }

    #[test]
    fn tilde_range_allows_patch_only() {
        let range = VersionRange::parse("~1.2.0").unwrap();
        assert!(range.contains(&Version::new(1, 2, 9)));
        assert!(!range.contains(&Version::new(1, 3, 0)));
    }

    #[test]
    fn max_satisfying_picks_largest() {
        let range = VersionRange::parse("^1.0.0").unwrap();
        let candidates = vec![Version::new(1, 0, 0), Version::new(1, 5, 2), Version::new(2, 0, 0)];
        let max = range.max_satisfying(candidates.iter()).unwrap();
        assert_eq!(*max, Version::new(1, 5, 2));
    }

    #[test]
    fn filesystem_subpath_has_four_two_char_segments_then_rest() {
        let id = PackageId::new(PackagePath::parse("org.sqlite").unwrap(), Version::new(3, 42, 0));
        let sub = id.filesystem_subpath();
        let components: Vec<_> = sub.components().collect();
        assert_eq!(components.len(), 5);
    }

    #[test]
    fn short_hash_is_prefix_of_full_hash() {
        let id = PackageId::new(PackagePath::parse("org.sqlite").unwrap(), Version::new(3, 42, 0));
        assert!(id.hash().starts_with(&id.short_hash()));
        assert_eq!(id.short_hash().len(), SHORT_HASH_LEN);
    }

    #[test]
    fn target_name_joins_path_and_version() {
        let id = PackageId::new(PackagePath::parse("org.sqlite").unwrap(), Version::new(3, 42, 0));
        assert_eq!(id.target_name(), "org.sqlite-3.42.0");
    }

    #[test]
    fn same_hash_implies_same_directory_identity() {
        let a = PackageId::new(PackagePath::parse("org.a").unwrap(), Version::new(1, 0, 0));
        let b = PackageId::new(PackagePath::parse("org.a").unwrap(), Version::new(1, 0, 0));
        let c = PackageId::new(PackagePath::parse("org.b").unwrap(), Version::new(1, 0, 0));
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }
}
