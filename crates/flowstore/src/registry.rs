use crate::config::{NamespaceConfig, NamespaceKind, StoreConfig};
use crate::error::{StoreError, StoreResult};
use crate::file::FileNamespace;
use crate::log::LogNamespace;
use crate::memory::MemoryNamespace;
use crate::namespace::StoreNamespace;
use crate::null::NullNamespace;
use crate::sql::SqlNamespace;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

/// A created namespace and the name it was first asked for
struct Registered {
    name: String,
    ns: Arc<dyn StoreNamespace>,
}

/// Registry of namespaces, created on first use from the store config
pub struct Store {
    config: StoreConfig,
    namespaces: Mutex<HashMap<String, Registered>>,
}

impl Store {
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        let uses_sql = config
            .namespaces
            .values()
            .any(|ns| ns.kind == NamespaceKind::Sql);
        match (&config.sqlite_path, uses_sql) {
            (Some(path), true) => tracing::info!("SQL namespaces are stored in {}", path.display()),
            (None, true) => tracing::warn!("No sqlite_path configured, sql namespaces are kept in memory"),
            _ => {}
        }
        Ok(Self {
            config,
            namespaces: Mutex::new(HashMap::new()),
        })
    }

    /// A store where every namespace lives in memory
    pub fn in_memory() -> Self {
        Self {
            config: StoreConfig::default(),
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the namespace, creating it if it does not exist yet.
    ///
    /// Names are case-insensitive. Two different names that sanitize to
    /// the same identifier would share storage, so the later one is
    /// refused with a conflict.
    pub fn namespace(&self, name: &str) -> StoreResult<Arc<dyn StoreNamespace>> {
        let id = sanitize_identifier(name);
        let mut namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(registered) = namespaces.get(&id) {
            if !registered.name.eq_ignore_ascii_case(name) {
                return Err(StoreError::Conflict(format!(
                    "Namespace \"{}\" collides with namespace \"{}\"",
                    name, registered.name
                )));
            }
            return Ok(Arc::clone(&registered.ns));
        }
        let config = self.config.namespace(name).cloned().unwrap_or_default();
        let ns = self.create(&id, &config)?;
        tracing::debug!("Created {:?} namespace {}", config.kind, id);
        namespaces.insert(
            id,
            Registered {
                name: name.to_string(),
                ns: Arc::clone(&ns),
            },
        );
        Ok(ns)
    }

    /// Names of the namespaces created so far and of all configured ones,
    /// as they were first asked for
    pub fn namespace_names(&self) -> Vec<String> {
        let namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: BTreeMap<String, String> = namespaces
            .iter()
            .map(|(id, registered)| (id.clone(), registered.name.clone()))
            .collect();
        for name in self.config.namespaces.keys() {
            names.entry(sanitize_identifier(name)).or_insert_with(|| name.clone());
        }
        names.into_values().collect()
    }

    /// The namespace if it was created or configured before; never
    /// creates an unknown one
    pub fn existing_namespace(&self, name: &str) -> Option<Arc<dyn StoreNamespace>> {
        let known = {
            let namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
            namespaces.contains_key(&sanitize_identifier(name))
        };
        if !known && self.config.namespace(name).is_none() {
            return None;
        }
        self.namespace(name).ok()
    }

    fn create(&self, id: &str, config: &NamespaceConfig) -> StoreResult<Arc<dyn StoreNamespace>> {
        let ns: Arc<dyn StoreNamespace> = match config.kind {
            NamespaceKind::Memory => Arc::new(MemoryNamespace::new()),
            NamespaceKind::Log => Arc::new(LogNamespace::new(config.auto_trim)),
            NamespaceKind::Null => Arc::new(NullNamespace),
            NamespaceKind::Files => {
                let dir = config
                    .directory
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("flowhub").join(id));
                Arc::new(FileNamespace::new(dir)?)
            }
            NamespaceKind::Sql => {
                let table = config
                    .table
                    .as_deref()
                    .map(sanitize_identifier)
                    .unwrap_or_else(|| id.to_string());
                match &self.config.sqlite_path {
                    Some(path) => Arc::new(SqlNamespace::open(path, table)?),
                    None => Arc::new(SqlNamespace::open_in_memory(table)?),
                }
            }
        };
        Ok(ns)
    }
}

/// Lower-case alphanumerics and `_`; anything else becomes `_`. A leading
/// digit gets a `_` prefix so the result is a valid SQL identifier.
pub fn sanitize_identifier(name: &str) -> String {
    let mut id: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if id.is_empty() || id.starts_with(|c: char| c.is_ascii_digit()) {
        id.insert(0, '_');
    }
    id
}
