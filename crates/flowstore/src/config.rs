use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Backend of a namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    #[default]
    Memory,
    Log,
    #[serde(alias = "file")]
    Files,
    Sql,
    Null,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    #[serde(rename = "type")]
    pub kind: NamespaceKind,
    /// Directory of a `files` namespace; defaults to a folder below the
    /// system temp dir
    pub directory: Option<PathBuf>,
    /// Table of a `sql` namespace; defaults to the namespace name
    pub table: Option<String>,
    /// Entry bound of a `log` namespace; `0` disables auto-trim
    pub auto_trim: usize,
}

impl NamespaceConfig {
    pub fn new(kind: NamespaceKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }
}

/// Store settings. Namespaces without an entry in `namespaces` are kept
/// in memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub namespaces: HashMap<String, NamespaceConfig>,
    /// Database file shared by all `sql` namespaces; an in-memory database
    /// is used when unset
    pub sqlite_path: Option<PathBuf>,
    pub execution_log: String,
    pub error_log: String,
    pub max_error_log_size: usize,
    pub flow_namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespaces: HashMap::new(),
            sqlite_path: None,
            execution_log: "_execution_log".to_string(),
            error_log: "_error_log".to_string(),
            max_error_log_size: 1000,
            flow_namespace: "_flows".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn with_namespace(mut self, name: impl Into<String>, config: NamespaceConfig) -> Self {
        self.namespaces.insert(name.into(), config);
        self
    }

    /// Settings of a namespace; lookup ignores case
    pub fn namespace(&self, name: &str) -> Option<&NamespaceConfig> {
        self.namespaces
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, c)| c)
    }
}
