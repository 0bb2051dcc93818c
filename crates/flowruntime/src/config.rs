use flowcore::FlowError;
use flowstore::StoreConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Tasks draining the fire-and-forget queue
    pub workers: usize,
    pub queue_capacity: usize,
    pub event_buffer_size: usize,
    /// Files or directories of flows loaded read-only at startup
    pub flow_dirs: Vec<PathBuf>,
    /// Write flows added at runtime to the store's flow namespace
    pub persist_flows: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            event_buffer_size: 1000,
            flow_dirs: Vec::new(),
            persist_flows: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorSettings {
    pub enabled: bool,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Settings of the HTTP front door
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_address: String,
    /// Seconds a request waits for its flow before answering 503
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Everything a hub process reads from its config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub runtime: RuntimeConfig,
    pub store: StoreConfig,
    pub server: ServerSettings,
    /// Per-operator settings, keyed by operator name
    pub operators: HashMap<String, OperatorSettings>,
}

impl HubConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Operators are enabled unless their settings say otherwise
    pub fn operator_enabled(&self, name: &str) -> bool {
        self.operators
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, s)| s.enabled)
            .unwrap_or(true)
    }
}
