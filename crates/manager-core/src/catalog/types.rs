//! Catalog entity types: packages, models, and their identities.
//!
//! Field names follow the registry documents (`custom-node-list.json`,
//! `model-list.json`) so entries deserialize straight from the wire.

use crate::catalog::pattern::NodePattern;
use crate::config::PathsConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Stable identity of a catalog entry.
///
/// Rendered as `package:<reference>` or `model:<save_path>/<filename>`; that
/// string form is also the manifest key and the RPC parameter format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntryId {
    Package { reference: String },
    Model { save_path: String, filename: String },
}

impl EntryId {
    pub fn package(reference: impl Into<String>) -> Self {
        EntryId::Package {
            reference: reference.into(),
        }
    }

    pub fn model(save_path: impl Into<String>, filename: impl Into<String>) -> Self {
        EntryId::Model {
            save_path: save_path.into(),
            filename: filename.into(),
        }
    }

    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            EntryId::Package { .. } => ResourceKind::Package,
            EntryId::Model { .. } => ResourceKind::Model,
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryId::Package { reference } => write!(f, "package:{}", reference),
            EntryId::Model {
                save_path,
                filename,
            } => write!(f, "model:{}/{}", save_path, filename),
        }
    }
}

impl FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(reference) = s.strip_prefix("package:") {
            if reference.is_empty() {
                return Err("package identity has an empty reference".to_string());
            }
            return Ok(EntryId::package(reference));
        }
        if let Some(rest) = s.strip_prefix("model:") {
            let (save_path, filename) = rest
                .rsplit_once('/')
                .ok_or_else(|| format!("model identity '{}' lacks save_path/filename", s))?;
            if save_path.is_empty() || filename.is_empty() {
                return Err(format!("model identity '{}' has an empty component", s));
            }
            return Ok(EntryId::model(save_path, filename));
        }
        Err(format!("unrecognized entry identity '{}'", s))
    }
}

impl TryFrom<String> for EntryId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.to_string()
    }
}

/// The two resource kinds the catalog manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Package,
    Model,
}

/// Mutating operations the orchestrator executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Install,
    Update,
    Uninstall,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Update => "update",
            OperationKind::Uninstall => "uninstall",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "install" => Some(OperationKind::Install),
            "update" => Some(OperationKind::Update),
            "uninstall" | "remove" => Some(OperationKind::Uninstall),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a package's artifacts are acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallType {
    /// Download files (or archives, which are unpacked) into `custom_nodes/`.
    #[serde(alias = "copy", alias = "unzip")]
    ArchiveCopy,
    /// Clone the source repository.
    #[serde(alias = "git-clone")]
    SourceCheckout,
    /// Hand the reference to the node registry's own installer.
    #[serde(alias = "cnr")]
    RegistryManaged,
}

/// An installable node-extension package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub reference: String,
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub install_type: InstallType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodename_pattern: Option<NodePattern>,
    /// Registry revision used for update detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Registry-reported install flag. Advisory only, never trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<String>,
}

/// An installable model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(rename = "type", default)]
    pub model_type: String,
    #[serde(default)]
    pub base: String,
    pub save_path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference: String,
    pub filename: String,
    pub url: String,
    /// Registry revision used for update detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Display size as published by the registry (e.g. "2.1GB").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    /// Registry-reported install flag. Advisory only, never trusted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<String>,
}

/// Either kind of catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CatalogEntry {
    Package(Package),
    Model(Model),
}

/// How a single artifact is acquired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMethod {
    /// Plain file download to the target path.
    Download,
    /// Download an archive and unpack it into the target directory.
    Archive,
    /// Clone a source repository into the target directory.
    GitCheckout,
    /// Delegate to the node registry's installer.
    Registry,
}

/// One unit of acquisition: where it comes from and where it lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub source: String,
    pub method: AcquireMethod,
    /// Destination relative to the manager root.
    pub relative_path: PathBuf,
}

impl Package {
    pub fn id(&self) -> EntryId {
        EntryId::package(&self.reference)
    }

    /// Derive where each listed file lands under `custom_nodes/`.
    ///
    /// The `files` list is the only authority for what a package owns on
    /// disk; nothing outside these paths is ever written or removed.
    pub fn artifacts(&self) -> Result<Vec<Artifact>, String> {
        if self.files.is_empty() {
            return Err(format!("package '{}' lists no files", self.reference));
        }

        let base = PathBuf::from(PathsConfig::CUSTOM_NODES_DIR_NAME);
        let mut artifacts = Vec::with_capacity(self.files.len());
        for source in &self.files {
            let artifact = match self.install_type {
                InstallType::SourceCheckout => Artifact {
                    source: source.clone(),
                    method: AcquireMethod::GitCheckout,
                    relative_path: base.join(safe_name(&repo_name_from_url(source))?),
                },
                InstallType::ArchiveCopy => {
                    let file_name = last_url_segment(source);
                    match archive_stem(&file_name) {
                        Some(stem) => Artifact {
                            source: source.clone(),
                            method: AcquireMethod::Archive,
                            relative_path: base.join(safe_name(stem)?),
                        },
                        None => Artifact {
                            source: source.clone(),
                            method: AcquireMethod::Download,
                            relative_path: base.join(safe_name(&file_name)?),
                        },
                    }
                }
                InstallType::RegistryManaged => {
                    let name = archive_stem(&last_url_segment(source))
                        .map(String::from)
                        .unwrap_or_else(|| repo_name_from_url(source));
                    Artifact {
                        source: source.clone(),
                        method: AcquireMethod::Registry,
                        relative_path: base.join(safe_name(&name)?),
                    }
                }
            };
            if artifacts
                .iter()
                .any(|a: &Artifact| a.relative_path == artifact.relative_path)
            {
                return Err(format!(
                    "package '{}' maps two files onto {}",
                    self.reference,
                    artifact.relative_path.display()
                ));
            }
            artifacts.push(artifact);
        }
        Ok(artifacts)
    }
}

impl Model {
    pub fn id(&self) -> EntryId {
        EntryId::model(&self.save_path, &self.filename)
    }

    /// Rewrite `save_path` in canonical form (`./a//b/` becomes `a/b`) so
    /// that spellings of one directory share an identity.
    pub fn normalize_save_path(&mut self) -> Result<(), String> {
        let normalized = safe_relative_path(&self.save_path)?;
        self.save_path = normalized
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Ok(())
    }

    /// The single file a model owns, under `models/<save_path>/<filename>`.
    pub fn artifacts(&self) -> Result<Vec<Artifact>, String> {
        let save_path = safe_relative_path(&self.save_path)?;
        let filename = safe_name(&self.filename)?;
        if self.url.trim().is_empty() {
            return Err(format!("model '{}' has no download url", self.filename));
        }
        Ok(vec![Artifact {
            source: self.url.clone(),
            method: AcquireMethod::Download,
            relative_path: PathBuf::from(PathsConfig::MODELS_DIR_NAME)
                .join(save_path)
                .join(filename),
        }])
    }
}

impl CatalogEntry {
    pub fn id(&self) -> EntryId {
        match self {
            CatalogEntry::Package(p) => p.id(),
            CatalogEntry::Model(m) => m.id(),
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            CatalogEntry::Package(p) => p.version.as_deref(),
            CatalogEntry::Model(m) => m.version.as_deref(),
        }
    }

    pub fn artifacts(&self) -> Result<Vec<Artifact>, String> {
        match self {
            CatalogEntry::Package(p) => p.artifacts(),
            CatalogEntry::Model(m) => m.artifacts(),
        }
    }

    pub fn nodename_pattern(&self) -> Option<&NodePattern> {
        match self {
            CatalogEntry::Package(p) => p.nodename_pattern.as_ref(),
            CatalogEntry::Model(_) => None,
        }
    }

    pub fn as_package(&self) -> Option<&Package> {
        match self {
            CatalogEntry::Package(p) => Some(p),
            CatalogEntry::Model(_) => None,
        }
    }
}

/// Extract the repository name from a git URL.
///
/// - `https://github.com/user/ComfyUI-CustomNode.git` -> `ComfyUI-CustomNode`
/// - `git@github.com:user/ComfyUI-CustomNode.git` -> `ComfyUI-CustomNode`
pub fn repo_name_from_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    let name = url.rsplit('/').next().unwrap_or(url);
    let name = name.rsplit(':').next().unwrap_or(name);
    let name = name.strip_suffix(".git").unwrap_or(name);
    name.to_string()
}

/// Last path segment of a URL, ignoring query string and fragment.
pub(crate) fn last_url_segment(source: &str) -> String {
    match url::Url::parse(source) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(String::from))
            .unwrap_or_default(),
        Err(_) => source
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(source)
            .to_string(),
    }
}

fn archive_stem(file_name: &str) -> Option<&str> {
    let lower = file_name.to_ascii_lowercase();
    [".tar.gz", ".tgz", ".zip"]
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map(|ext| &file_name[..file_name.len() - ext.len()])
        .filter(|stem| !stem.is_empty())
}

/// Validate a single path component taken from untrusted registry data.
fn safe_name(name: &str) -> Result<&str, String> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(name)
    } else {
        Err(format!("unsafe file name '{}'", name))
    }
}

/// Validate a relative directory path taken from untrusted registry data.
fn safe_relative_path(path: &str) -> Result<PathBuf, String> {
    let candidate = Path::new(path);
    if path.is_empty() || path.contains(['\\', '\0']) || candidate.is_absolute() {
        return Err(format!("unsafe save_path '{}'", path));
    }
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => return Err(format!("unsafe save_path '{}'", path)),
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(format!("unsafe save_path '{}'", path));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(install_type: InstallType, files: &[&str]) -> Package {
        Package {
            reference: "https://github.com/user/ComfyUI-Foo".to_string(),
            title: "Foo".to_string(),
            author: "user".to_string(),
            description: String::new(),
            files: files.iter().map(|f| f.to_string()).collect(),
            install_type,
            nodename_pattern: None,
            version: None,
            installed: None,
        }
    }

    #[test]
    fn test_entry_id_display_and_parse() {
        let id = EntryId::model("checkpoints/sdxl", "v1.safetensors");
        assert_eq!(id.to_string(), "model:checkpoints/sdxl/v1.safetensors");
        assert_eq!(id.to_string().parse::<EntryId>().unwrap(), id);

        let pkg: EntryId = "package:https://github.com/a/b".parse().unwrap();
        assert_eq!(pkg, EntryId::package("https://github.com/a/b"));

        assert!("model:nofilename".parse::<EntryId>().is_err());
        assert!("widget:x".parse::<EntryId>().is_err());
    }

    #[test]
    fn test_entry_id_serializes_as_string() {
        let id = EntryId::package("https://github.com/a/b");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            "\"package:https://github.com/a/b\""
        );
    }

    #[test]
    fn test_repo_name_from_url() {
        assert_eq!(
            repo_name_from_url("https://github.com/user/ComfyUI-Manager.git"),
            "ComfyUI-Manager"
        );
        assert_eq!(
            repo_name_from_url("https://github.com/user/ComfyUI-Manager/"),
            "ComfyUI-Manager"
        );
        assert_eq!(
            repo_name_from_url("git@github.com:user/ComfyUI-Manager.git"),
            "ComfyUI-Manager"
        );
    }

    #[test]
    fn test_source_checkout_artifacts() {
        let pkg = package(
            InstallType::SourceCheckout,
            &["https://github.com/user/ComfyUI-Foo"],
        );
        let artifacts = pkg.artifacts().unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].method, AcquireMethod::GitCheckout);
        assert_eq!(
            artifacts[0].relative_path,
            PathBuf::from("custom_nodes/ComfyUI-Foo")
        );
    }

    #[test]
    fn test_archive_copy_artifacts() {
        let pkg = package(
            InstallType::ArchiveCopy,
            &[
                "https://example.com/nodes/foo_nodes.py?raw=1",
                "https://example.com/bundles/bar.tar.gz",
            ],
        );
        let artifacts = pkg.artifacts().unwrap();
        assert_eq!(artifacts[0].method, AcquireMethod::Download);
        assert_eq!(
            artifacts[0].relative_path,
            PathBuf::from("custom_nodes/foo_nodes.py")
        );
        assert_eq!(artifacts[1].method, AcquireMethod::Archive);
        assert_eq!(artifacts[1].relative_path, PathBuf::from("custom_nodes/bar"));
    }

    #[test]
    fn test_artifacts_reject_collisions_and_empty() {
        let pkg = package(
            InstallType::ArchiveCopy,
            &["https://a.example/x.py", "https://b.example/x.py"],
        );
        assert!(pkg.artifacts().is_err());
        assert!(package(InstallType::ArchiveCopy, &[]).artifacts().is_err());
    }

    #[test]
    fn test_model_artifact_and_path_safety() {
        let mut model = Model {
            name: "v1".to_string(),
            model_type: "checkpoint".to_string(),
            base: "SD1.5".to_string(),
            save_path: "checkpoints".to_string(),
            description: String::new(),
            reference: String::new(),
            filename: "v1.safetensors".to_string(),
            url: "https://example.com/v1.safetensors".to_string(),
            version: None,
            size: None,
            installed: None,
        };
        assert_eq!(
            model.artifacts().unwrap()[0].relative_path,
            PathBuf::from("models/checkpoints/v1.safetensors")
        );

        model.save_path = "../../etc".to_string();
        assert!(model.artifacts().is_err());

        model.save_path = "checkpoints".to_string();
        model.filename = "..".to_string();
        assert!(model.artifacts().is_err());
    }

    #[test]
    fn test_install_type_wire_aliases() {
        let parsed: InstallType = serde_json::from_str("\"git-clone\"").unwrap();
        assert_eq!(parsed, InstallType::SourceCheckout);
        let parsed: InstallType = serde_json::from_str("\"copy\"").unwrap();
        assert_eq!(parsed, InstallType::ArchiveCopy);
        let parsed: InstallType = serde_json::from_str("\"cnr\"").unwrap();
        assert_eq!(parsed, InstallType::RegistryManaged);
    }
}
