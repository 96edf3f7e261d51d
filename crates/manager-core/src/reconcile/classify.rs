//! Version-based classification of a single entry.

use crate::catalog::{CatalogEntry, LocalSnapshot};
use crate::reconcile::EntryState;

/// State of `entry` ignoring conflicts.
pub(crate) fn base_state(entry: &CatalogEntry, local: &LocalSnapshot) -> EntryState {
    let id = entry.id();
    if let Some(record) = local.record(&id) {
        return compare_versions(record.version.as_deref(), entry.version());
    }

    // No record: a complete set of derived paths on disk is an unmanaged
    // install, unless another entry's record already accounts for them.
    let Ok(artifacts) = entry.artifacts() else {
        return EntryState::NotInstalled;
    };
    let paths = || artifacts.iter().map(|a| a.relative_path.as_path());
    if local.all_present(paths()) && paths().all(|p| local.owner_other_than(&id, p).is_none()) {
        EntryState::InstalledUnmanaged
    } else {
        EntryState::NotInstalled
    }
}

fn compare_versions(local: Option<&str>, registry: Option<&str>) -> EntryState {
    match (local, registry) {
        (_, None) => EntryState::InstalledCurrent,
        (None, Some(_)) => EntryState::InstalledUnmanaged,
        (Some(l), Some(r)) if l.trim() == r.trim() => EntryState::InstalledCurrent,
        (Some(l), Some(r)) => match (lenient_semver(l), lenient_semver(r)) {
            (Some(l), Some(r)) if l >= r => EntryState::InstalledCurrent,
            _ => EntryState::UpdateAvailable,
        },
    }
}

/// Parse `v1.2`, `1.2.3`, `1` and friends as semver; `None` for revisions
/// like commit hashes or dates.
fn lenient_semver(version: &str) -> Option<semver::Version> {
    let trimmed = version.trim().trim_start_matches(['v', 'V']);
    if let Ok(parsed) = semver::Version::parse(trimmed) {
        return Some(parsed);
    }
    let parts: Vec<&str> = trimmed.split('.').collect();
    let numeric = |p: &&str| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit());
    if parts.len() > 3 || !parts.iter().all(numeric) {
        return None;
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    semver::Version::parse(&padded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ResourceKind;
    use crate::metadata::LocalRecord;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn utils_fork(owner: &str) -> CatalogEntry {
        let reference = format!("https://github.com/{}/Utils", owner);
        serde_json::from_value(serde_json::json!({
            "kind": "package",
            "reference": reference,
            "title": "Utils",
            "files": [reference],
            "install_type": "git-clone"
        }))
        .unwrap()
    }

    #[test]
    fn test_another_records_paths_are_not_an_unmanaged_install() {
        let alice = utils_fork("alice");
        let bob = utils_fork("bob");
        let present: std::collections::BTreeSet<PathBuf> =
            [PathBuf::from("custom_nodes/Utils")].into_iter().collect();
        let record = LocalRecord {
            kind: ResourceKind::Package,
            version: None,
            hash: None,
            files: vec![PathBuf::from("custom_nodes/Utils")],
            install_type: None,
            nodename_pattern: None,
            installed_at: chrono::Utc::now(),
            size: None,
        };

        let local = LocalSnapshot::new(
            [(alice.id(), record)].into_iter().collect(),
            present.clone(),
        );
        assert_eq!(base_state(&alice, &local), EntryState::InstalledCurrent);
        assert_eq!(base_state(&bob, &local), EntryState::NotInstalled);

        // Without a record the directory could be either fork's.
        let unrecorded = LocalSnapshot::new(BTreeMap::new(), present);
        assert_eq!(base_state(&bob, &unrecorded), EntryState::InstalledUnmanaged);
    }

    #[test]
    fn test_equal_versions_are_current() {
        assert_eq!(compare_versions(Some("1.0"), Some("1.0")), EntryState::InstalledCurrent);
        assert_eq!(compare_versions(Some("abc123"), Some("abc123")), EntryState::InstalledCurrent);
    }

    #[test]
    fn test_newer_registry_means_update() {
        assert_eq!(compare_versions(Some("1.0"), Some("1.1")), EntryState::UpdateAvailable);
        assert_eq!(compare_versions(Some("v1.9.0"), Some("1.10.0")), EntryState::UpdateAvailable);
        assert_eq!(compare_versions(Some("abc123"), Some("def456")), EntryState::UpdateAvailable);
    }

    #[test]
    fn test_newer_local_is_current() {
        assert_eq!(compare_versions(Some("2.0.0"), Some("1.5")), EntryState::InstalledCurrent);
    }

    #[test]
    fn test_missing_versions() {
        assert_eq!(compare_versions(None, None), EntryState::InstalledCurrent);
        assert_eq!(compare_versions(Some("1.0"), None), EntryState::InstalledCurrent);
        assert_eq!(compare_versions(None, Some("1.0")), EntryState::InstalledUnmanaged);
    }

    #[test]
    fn test_lenient_semver() {
        assert_eq!(lenient_semver("1.2"), Some(semver::Version::new(1, 2, 0)));
        assert_eq!(lenient_semver("v3"), Some(semver::Version::new(3, 0, 0)));
        assert!(lenient_semver("2024-05-01").is_none());
        assert!(lenient_semver("deadbeef").is_none());
    }
}
