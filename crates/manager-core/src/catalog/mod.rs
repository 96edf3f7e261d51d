//! Catalog: registry entries, local install state, and the store that owns
//! both snapshots.

mod local;
mod pattern;
mod provider;
pub(crate) mod recovery;
mod store;
mod types;

pub use local::{LocalSnapshot, RecoveryNote};
pub(crate) use local::paths_overlap;
pub use pattern::NodePattern;
pub use provider::{
    FileRegistryProvider, HttpRegistryProvider, RegistryDocuments, RegistryProvider,
    RegistrySnapshot, RegistryWarning, StaticRegistryProvider,
};
pub use store::CatalogStore;
pub(crate) use types::last_url_segment;
pub use types::{
    repo_name_from_url, AcquireMethod, Artifact, CatalogEntry, EntryId, InstallType, Model,
    OperationKind, Package, ResourceKind,
};
