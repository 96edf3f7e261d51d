//! API implementation submodules.
//!
//! Each submodule contains `impl NodeManager` blocks that extend the public
//! API. The struct definition remains in `lib.rs`.

mod builder;
mod catalog;
mod operations;
mod state;

pub use builder::NodeManagerBuilder;
pub use catalog::{CatalogItem, CatalogView, LocalStateSummary, RegistrySummary};
pub(crate) use state::ManagerState;
