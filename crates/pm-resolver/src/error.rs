//! Error types for dependency resolution and installation.

use pm_types::Version;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no version of {path} satisfies {requirement}")]
    NoMatchingVersion {
        path: String,
        requirement: String,
        available: Vec<Version>,
    },

    #[error("version conflict for {path}")]
    VersionConflict {
        path: String,
        conflicts: Vec<ConflictingRequirement>,
        derivation: Option<ConflictDerivation>,
    },

    #[error("package not found: {0}")]
    PackageNotFound(String),

    #[error("dependency cycle detected: {}", format_cycle(.0))]
    CycleDetected(Vec<String>),

    #[error("resolution cancelled")]
    Cancelled,

    #[error("no solution found: {message}")]
    NoSolution {
        message: String,
        derivation: ConflictDerivation,
        suggestions: Vec<ResolutionSuggestion>,
    },

    #[error("index error: {0}")]
    Index(#[from] pm_registry::RegistryError),

    #[error("store error: {0}")]
    Store(#[from] pm_store::StoreError),

    #[error("source fetch error: {0}")]
    Source(#[from] pm_source::SourceError),

    #[error("downloaded layout hash {actual} does not match expected hash {expected} for {path}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },
}

fn format_cycle(cycle: &[String]) -> String {
    cycle.join(" -> ")
}

#[derive(Debug, Clone)]
pub struct ConflictingRequirement {
    pub from: String,
    pub requirement: String,
    pub dependency_chain: Vec<String>,
}

impl fmt::Display for ConflictingRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requires {}", self.from, self.requirement)?;
        if !self.dependency_chain.is_empty() {
            write!(f, " (via {})", self.dependency_chain.join(" -> "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConflictDerivation {
    pub root_cause: String,
    pub steps: Vec<DerivationStep>,
    pub formatted: String,
}

impl ConflictDerivation {
    pub fn new(root_cause: impl Into<String>) -> Self {
        Self {
            root_cause: root_cause.into(),
            steps: Vec::new(),
            formatted: String::new(),
        }
    }

    pub fn add_step(&mut self, step: DerivationStep) {
        self.steps.push(step);
    }

    pub fn format(&mut self) {
        let mut output = format!("Root cause: {}\n\n", self.root_cause);
        for (i, step) in self.steps.iter().enumerate() {
            output.push_str(&format!("{}. {}\n", i + 1, step.description));
            for pkg in &step.packages_involved {
                output.push_str(&format!("   - {pkg}\n"));
            }
        }
        self.formatted = output;
    }
}

impl fmt::Display for ConflictDerivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.formatted.is_empty() {
            write!(f, "{}", self.root_cause)
        } else {
            write!(f, "{}", self.formatted)
        }
    }
}

#[derive(Debug, Clone)]
pub struct DerivationStep {
    pub description: String,
    pub packages_involved: Vec<String>,
}

impl DerivationStep {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            packages_involved: Vec::new(),
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.packages_involved.push(package.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum ResolutionSuggestion {
    Upgrade { path: String, from: Version, to: Version },
    Downgrade { path: String, from: Version, to: Version },
    AddOverride { path: String, version: String },
    RemoveConstraint { path: String, from: String },
}

impl fmt::Display for ResolutionSuggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upgrade { path, from, to } => write!(f, "upgrade {path} from {from} to {to}"),
            Self::Downgrade { path, from, to } => write!(f, "downgrade {path} from {from} to {to}"),
            Self::AddOverride { path, version } => write!(f, "add override: {path} = \"{version}\""),
            Self::RemoveConstraint { path, from } => write!(f, "remove {path} constraint from {from}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicting_requirement_display() {
        let req = ConflictingRequirement {
            from: "app".to_string(),
            requirement: ">=1.5.0".to_string(),
            dependency_chain: vec!["lib".to_string()],
        };
        assert!(req.to_string().contains("app requires >=1.5.0"));
    }

    #[test]
    fn derivation_formatting() {
        let mut derivation = ConflictDerivation::new("incompatible requirements");
        derivation.add_step(DerivationStep::new("app requires org.log >=1.5").with_package("org.log"));
        derivation.format();
        assert!(derivation.formatted.contains("app requires"));
    }
}
