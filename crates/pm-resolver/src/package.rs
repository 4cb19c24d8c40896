//! Package identity for PubGrub resolution, and the dependency edges a
//! [`crate::PackageProvider`] reports for a given (path, version).

use pm_types::{PackagePath, VersionRange};
use std::fmt;

/// A node in the resolution graph: either the virtual root (the project
/// being resolved) or a concrete package path.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum PmPackage {
    /// Starting point for resolution; its "dependencies" are the root requests.
    Root,
    Named(PackagePath),
}

impl PmPackage {
    pub fn named(path: PackagePath) -> Self {
        Self::Named(path)
    }

    pub fn path(&self) -> Option<&PackagePath> {
        match self {
            Self::Root => None,
            Self::Named(p) => Some(p),
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }
}

impl fmt::Display for PmPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => write!(f, "<root>"),
            Self::Named(p) => write!(f, "{p}"),
        }
    }
}

/// One dependency edge: a package path constrained to a version range.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub path: PackagePath,
    pub range: VersionRange,
}

impl Dependency {
    pub fn new(path: PackagePath, range: VersionRange) -> Self {
        Self { path, range }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_display() {
        assert_eq!(PmPackage::Root.to_string(), "<root>");
        let p = PackagePath::parse("org.sqlite").unwrap();
        assert_eq!(PmPackage::named(p).to_string(), "org.sqlite");
    }

    #[test]
    fn package_equality() {
        let a = PackagePath::parse("org.sqlite").unwrap();
        let b = PackagePath::parse("ORG.SQLITE").unwrap();
        assert_eq!(PmPackage::named(a), PmPackage::named(b));
        assert_ne!(PmPackage::Root, PmPackage::named(PackagePath::parse("org.sqlite").unwrap()));
    }
}
