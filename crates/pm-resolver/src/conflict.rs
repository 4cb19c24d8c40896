//! Conflict formatting and suggestion generation.

use crate::error::{ConflictDerivation, DerivationStep, ResolutionSuggestion};
use pm_types::Version;

pub struct ConflictFormatter;

impl ConflictFormatter {
    pub fn format_incompatibility(path: &str, requirements: &[(String, String)]) -> ConflictDerivation {
        let mut derivation = ConflictDerivation::new(format!("incompatible version requirements for {path}"));
        for (from, requirement) in requirements {
            let step = DerivationStep::new(format!("{from} requires {path} {requirement}")).with_package(from.clone());
            derivation.add_step(step);
        }
        derivation.format();
        derivation
    }

    pub fn suggest_fixes(path: &str, requirements: &[(String, String)], available_versions: &[Version]) -> Vec<ResolutionSuggestion> {
        let mut suggestions = Vec::new();
        if let Some(latest) = available_versions.iter().max() {
            suggestions.push(ResolutionSuggestion::AddOverride {
                path: path.to_string(),
                version: latest.to_string(),
            });
        }
        for (from, _requirement) in requirements {
            suggestions.push(ResolutionSuggestion::RemoveConstraint {
                path: path.to_string(),
                from: from.clone(),
            });
        }
        suggestions
    }

    pub fn format_no_matching_version(path: &str, requirement: &str, available: &[Version]) -> String {
        let mut output = format!("no version of '{path}' satisfies the requirement '{requirement}'.\n\n");
        if available.is_empty() {
            output.push_str("no versions are available for this package.");
        } else {
            output.push_str("available versions:\n");
            let mut versions: Vec<_> = available.iter().collect();
            versions.sort();
            versions.reverse();
            for (i, version) in versions.iter().take(10).enumerate() {
                output.push_str(&format!("  {}. {version}\n", i + 1));
            }
            if versions.len() > 10 {
                output.push_str(&format!("  ... and {} more\n", versions.len() - 10));
            }
        }
        output
    }

    pub fn format_cycle(cycle: &[String]) -> String {
        let mut output = String::from("dependency cycle detected:\n\n");
        for (i, pkg) in cycle.iter().enumerate() {
            if i > 0 {
                output.push_str("  -> \n");
            }
            output.push_str(&format!("  {pkg}\n"));
        }
        if !cycle.is_empty() {
            output.push_str("  -> \n");
            output.push_str(&format!("  {} (cycle)\n", cycle[0]));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_incompatibility_with_all_requirers() {
        let requirements = vec![("app".to_string(), "^1.4".to_string()), ("net".to_string(), ">=1.5.0".to_string())];
        let derivation = ConflictFormatter::format_incompatibility("org.log", &requirements);
        assert!(derivation.formatted.contains("org.log"));
        assert!(derivation.formatted.contains("app"));
    }

    #[test]
    fn formats_cycle_closing_the_loop() {
        let cycle = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let output = ConflictFormatter::format_cycle(&cycle);
        assert!(output.contains("a"));
        assert!(output.contains("cycle"));
    }
}
