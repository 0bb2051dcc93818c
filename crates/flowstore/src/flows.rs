//! Persistence of flow descriptors in a store namespace

use crate::namespace::StoreNamespace;
use crate::registry::Store;
use flowcore::{Context, FlowDesc, FlowError, Output};
use std::sync::Arc;

/// Where the engine keeps the flows it is asked to persist
pub trait FlowRepository: Send + Sync {
    /// Every stored flow, by id
    fn load_all(&self) -> Result<Vec<(String, FlowDesc)>, FlowError>;

    fn save(&self, id: &str, flow: &FlowDesc) -> Result<(), FlowError>;

    fn delete(&self, id: &str) -> Result<(), FlowError>;
}

/// Stores each flow as a pretty-printed JSON document under its id
pub struct StoreFlowRepository {
    namespace: Arc<dyn StoreNamespace>,
}

impl StoreFlowRepository {
    pub fn new(namespace: Arc<dyn StoreNamespace>) -> Self {
        Self { namespace }
    }

    /// Repository on the store's configured flow namespace
    pub fn from_store(store: &Store) -> Result<Self, FlowError> {
        let namespace = store
            .namespace(&store.config().flow_namespace)
            .map_err(|e| FlowError::Persistence(e.to_string()))?;
        Ok(Self::new(namespace))
    }
}

fn persistence(e: impl ToString) -> FlowError {
    FlowError::Persistence(e.to_string())
}

impl FlowRepository for StoreFlowRepository {
    fn load_all(&self) -> Result<Vec<(String, FlowDesc)>, FlowError> {
        let mut flows = Vec::new();
        for id in self.namespace.keys().map_err(persistence)? {
            let Some(entry) = self.namespace.get(&id).map_err(persistence)? else {
                continue;
            };
            match entry.data().parse_json::<FlowDesc>() {
                Ok(desc) => flows.push((id, desc)),
                Err(e) => tracing::warn!("Skipping stored flow {}: {}", id, e),
            }
        }
        Ok(flows)
    }

    fn save(&self, id: &str, flow: &FlowDesc) -> Result<(), FlowError> {
        let mut stored = flow.clone();
        stored.source = None;
        let json = serde_json::to_vec_pretty(&stored)?;
        let ctx = Context::new(format!("save flow {}", id));
        self.namespace
            .set(id, Output::bytes_with_content_type(json, "application/json"), &ctx)
            .map_err(persistence)?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), FlowError> {
        self.namespace.delete(id).map_err(persistence)
    }
}
