//! Namespaced, transactional key-value store
//!
//! A [`Store`] hands out [`StoreNamespace`]s by name. Each namespace is an
//! independently locked key space backed by memory, an append-only log,
//! a directory of files, a SQLite table or nothing at all.

mod config;
mod entry;
mod error;
mod file;
pub mod flows;
mod log;
mod memory;
mod namespace;
mod null;
mod registry;
mod sql;

pub use config::{NamespaceConfig, NamespaceKind, StoreConfig};
pub use entry::{ModifiedBy, ReadableEntry, SearchQuery, StoreEntry};
pub use error::{StoreError, StoreResult};
pub use file::FileNamespace;
pub use flows::{FlowRepository, StoreFlowRepository};
pub use log::LogNamespace;
pub use memory::MemoryNamespace;
pub use namespace::{StoreNamespace, TransactionFn, Update};
pub use null::NullNamespace;
pub use registry::{sanitize_identifier, Store};
pub use sql::SqlNamespace;
