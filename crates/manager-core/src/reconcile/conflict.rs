//! Node-identifier conflicts between packages, and against node types the
//! host has loaded from elsewhere.

use crate::catalog::{EntryId, NodePattern, Package};
use crate::host::HostNodeType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One party a package's node identifiers collide with.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Conflict {
    /// Another installed package claims an overlapping pattern.
    Package { entry: EntryId },
    /// The host already serves a matching node type from a module no catalog
    /// package owns.
    Host {
        node_type: String,
        provider: Option<String>,
    },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Package { entry } => write!(f, "{}", entry),
            Conflict::Host {
                node_type,
                provider: Some(provider),
            } => write!(f, "node type '{}' from {}", node_type, provider),
            Conflict::Host {
                node_type,
                provider: None,
            } => write!(f, "built-in node type '{}'", node_type),
        }
    }
}

/// An installed package as seen by the detector.
#[derive(Debug, Clone)]
pub(crate) struct InstalledPattern {
    pub id: EntryId,
    pub pattern: NodePattern,
}

/// Pairwise conflict detection over a fixed set of installed packages.
#[derive(Debug, Default)]
pub(crate) struct ConflictDetector {
    installed: Vec<InstalledPattern>,
    /// `custom_nodes/` directory name -> owning catalog package.
    owners: HashMap<String, EntryId>,
    host: Vec<HostNodeType>,
}

impl ConflictDetector {
    pub fn new(
        installed: Vec<InstalledPattern>,
        owners: HashMap<String, EntryId>,
        host: Vec<HostNodeType>,
    ) -> Self {
        Self {
            installed,
            owners,
            host,
        }
    }

    /// Conflicts `id` would have if it claimed `pattern`.
    ///
    /// One hop only: a package overlapping B, which overlaps C, does not
    /// conflict with C unless it overlaps C itself.
    pub fn detect(&self, id: &EntryId, pattern: Option<&NodePattern>) -> Vec<Conflict> {
        let Some(pattern) = pattern else {
            return Vec::new();
        };

        let mut conflicts: Vec<Conflict> = self
            .installed
            .iter()
            .filter(|other| &other.id != id && pattern.overlaps(&other.pattern))
            .map(|other| Conflict::Package {
                entry: other.id.clone(),
            })
            .collect();

        for node_type in &self.host {
            if !pattern.matches(&node_type.name) {
                continue;
            }
            // Types from any catalog package (this one or another) are
            // covered by the pairwise check.
            let owned = node_type
                .provider_dir()
                .is_some_and(|dir| self.owners.contains_key(dir));
            if !owned {
                conflicts.push(Conflict::Host {
                    node_type: node_type.name.clone(),
                    provider: node_type.provider.clone(),
                });
            }
        }

        conflicts.sort();
        conflicts.dedup();
        conflicts
    }
}

/// Directory names under `custom_nodes/` a package's artifacts occupy, as
/// the host would name their modules.
pub(crate) fn owned_dirs(package: &Package) -> Vec<String> {
    package
        .artifacts()
        .unwrap_or_default()
        .iter()
        .filter_map(|a| a.relative_path.file_name())
        .map(|name| {
            let name = name.to_string_lossy();
            name.strip_suffix(".py").unwrap_or(&name).to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installed(reference: &str, pattern: &str) -> InstalledPattern {
        InstalledPattern {
            id: EntryId::package(reference),
            pattern: NodePattern::parse(pattern).unwrap(),
        }
    }

    #[test]
    fn test_detect_is_symmetric_and_skips_self() {
        let a = installed("https://github.com/x/a", "foo.*");
        let b = installed("https://github.com/x/b", "foo.bar");
        let detector = ConflictDetector::new(vec![a.clone(), b.clone()], HashMap::new(), vec![]);

        assert_eq!(
            detector.detect(&a.id, Some(&a.pattern)),
            vec![Conflict::Package { entry: b.id.clone() }]
        );
        assert_eq!(
            detector.detect(&b.id, Some(&b.pattern)),
            vec![Conflict::Package { entry: a.id.clone() }]
        );
    }

    #[test]
    fn test_absent_pattern_never_conflicts() {
        let a = installed("https://github.com/x/a", "*");
        let detector = ConflictDetector::new(vec![a], HashMap::new(), vec![]);
        assert!(detector
            .detect(&EntryId::package("https://github.com/x/b"), None)
            .is_empty());
    }

    #[test]
    fn test_no_transitive_conflicts() {
        let a = installed("https://github.com/x/a", "alpha*");
        let b = installed("https://github.com/x/b", "*beta");
        let c = installed("https://github.com/x/c", "gamma.beta");
        let detector =
            ConflictDetector::new(vec![a.clone(), b.clone(), c.clone()], HashMap::new(), vec![]);

        // a overlaps b ("alphabeta"), b overlaps c, a does not overlap c.
        let conflicts = detector.detect(&a.id, Some(&a.pattern));
        assert_eq!(conflicts, vec![Conflict::Package { entry: b.id.clone() }]);
    }

    #[test]
    fn test_host_types_from_foreign_modules_conflict() {
        let pattern = NodePattern::parse("Impact*").unwrap();
        let own = EntryId::package("https://github.com/x/ComfyUI-Impact-Pack");
        let mut owners = HashMap::new();
        owners.insert("ComfyUI-Impact-Pack".to_string(), own.clone());
        let host = vec![
            HostNodeType::new("ImpactA", Some("custom_nodes.ComfyUI-Impact-Pack")),
            HostNodeType::new("ImpactB", Some("custom_nodes.manually-copied")),
            HostNodeType::new("KSampler", Some("nodes")),
        ];
        let detector = ConflictDetector::new(vec![], owners, host);

        assert_eq!(
            detector.detect(&own, Some(&pattern)),
            vec![Conflict::Host {
                node_type: "ImpactB".to_string(),
                provider: Some("custom_nodes.manually-copied".to_string()),
            }]
        );
    }
}
