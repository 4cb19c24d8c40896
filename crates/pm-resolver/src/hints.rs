//! Hints from a previous resolution, used to prefer already-chosen versions
//! and to record why each version was chosen this time.

use pm_types::Version;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct LockfileHints {
    preferred_versions: HashMap<String, Version>,
}

impl LockfileHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_preferred_version(&mut self, path: impl Into<String>, version: Version) {
        self.preferred_versions.insert(path.into(), version);
    }

    pub fn preferred_version(&self, path: &str) -> Option<&Version> {
        self.preferred_versions.get(path)
    }

    pub fn matches_preferred(&self, path: &str, version: &Version) -> bool {
        self.preferred_versions.get(path).map(|v| v == version).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.preferred_versions.is_empty()
    }

    pub fn merge(&mut self, other: LockfileHints) {
        for (path, version) in other.preferred_versions {
            self.preferred_versions.entry(path).or_insert(version);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceReason {
    LockedHint,
    HighestCompatible,
    LowestCompatible,
    Override,
}

impl std::fmt::Display for ChoiceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockedHint => write!(f, "locked"),
            Self::HighestCompatible => write!(f, "highest compatible"),
            Self::LowestCompatible => write!(f, "lowest compatible"),
            Self::Override => write!(f, "override"),
        }
    }
}

/// Tracks why each package was selected and who required it, for building
/// conflict explanations after the fact.
#[derive(Debug, Clone, Default)]
pub struct ResolutionTrace {
    choices: HashMap<String, (Version, ChoiceReason)>,
    required_by: HashMap<String, Vec<String>>,
}

impl ResolutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_choice(&mut self, path: &str, version: &Version, reason: ChoiceReason) {
        self.choices.insert(path.to_string(), (version.clone(), reason));
    }

    pub fn record_requirement(&mut self, path: &str, required_by: &str) {
        self.required_by.entry(path.to_string()).or_default().push(required_by.to_string());
    }

    pub fn get_choice(&self, path: &str) -> Option<(&Version, ChoiceReason)> {
        self.choices.get(path).map(|(v, r)| (v, *r))
    }

    pub fn get_required_by(&self, path: &str) -> &[String] {
        self.required_by.get(path).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lockfile_hints_track_preference() {
        let mut hints = LockfileHints::new();
        hints.add_preferred_version("org.log", Version::new(1, 5, 4));
        assert!(hints.matches_preferred("org.log", &Version::new(1, 5, 4)));
        assert!(!hints.matches_preferred("org.log", &Version::new(1, 4, 0)));
    }

    #[test]
    fn trace_records_choice_and_requirers() {
        let mut trace = ResolutionTrace::new();
        trace.record_choice("org.log", &Version::new(1, 5, 4), ChoiceReason::LockedHint);
        trace.record_requirement("org.log", "app");
        trace.record_requirement("org.log", "net");

        let (version, reason) = trace.get_choice("org.log").unwrap();
        assert_eq!(*version, Version::new(1, 5, 4));
        assert_eq!(reason, ChoiceReason::LockedHint);
        assert_eq!(trace.get_required_by("org.log").len(), 2);
    }
}
