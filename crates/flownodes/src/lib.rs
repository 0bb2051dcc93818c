//! Built-in operators
//!
//! `system`, `flow`, `flowbytag`, `store` and `utils`, plus the store hook
//! that records executions and failed operations.

pub mod flow;
pub mod store;
pub mod store_hook;
pub mod system;
pub mod utils;

pub use store::StoreOperator;
pub use store_hook::{CollectedError, CollectedErrors, ExecutionSummary, StoreHook};

use flowcore::{AdaptedOperator, FlowError, OperatorHandler};
use flowruntime::{FlowEngine, HubConfig};
use flowstore::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn add<O: OperatorHandler>(engine: &FlowEngine, operator: Option<AdaptedOperator<O>>) {
    if let Some(operator) = operator {
        engine.add_operator(Arc::new(operator));
    }
}

/// Registers every built-in operator the configuration leaves enabled and
/// the store hook. Operators that need the engine only keep a weak
/// reference to it.
pub fn register_all(
    engine: &Arc<FlowEngine>,
    store: &Arc<Store>,
    config: &HubConfig,
    cancel: CancellationToken,
) -> Result<(), FlowError> {
    let hook = StoreHook::new(store).map_err(|e| FlowError::Persistence(e.to_string()))?;
    let weak = Arc::downgrade(engine);
    add(
        engine,
        system::operator(weak.clone(), hook.errors(), cancel, config.operator_enabled("system"))?,
    );
    add(engine, flow::flow_operator(weak.clone(), config.operator_enabled("flow"))?);
    add(engine, flow::flow_by_tag_operator(weak, config.operator_enabled("flowbytag"))?);
    add(engine, store::operator(Arc::clone(store), config.operator_enabled("store"))?);
    add(engine, utils::operator(config.operator_enabled("utils"))?);

    engine.add_hook(Arc::new(hook));
    tracing::info!("Registered operators: {}", engine.operator_names().join(", "));
    Ok(())
}
