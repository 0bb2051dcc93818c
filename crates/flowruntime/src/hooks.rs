use async_trait::async_trait;
use flowcore::{status, Context, FunctionArguments, OperationDesc, Output};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),
}

impl HookError {
    pub fn status_code(&self) -> u16 {
        status::INTERNAL_SERVER_ERROR
    }
}

/// Observer of flow executions and of changes to the flow registry.
///
/// Every callback is optional. A failing hook is logged and never affects
/// the execution it observes.
#[async_trait]
pub trait FlowHook: Send + Sync {
    /// Hooks are keyed by name; adding a hook with a known name replaces it
    fn name(&self) -> &str;

    async fn on_execute(
        &self,
        _ctx: &Context,
        _flow_id: &str,
        _args: &FunctionArguments,
        _input: &Output,
    ) -> Result<(), HookError> {
        Ok(())
    }

    /// Called after each operation that was invoked or failed while its
    /// call was prepared
    async fn on_execute_operation(
        &self,
        _ctx: &Context,
        _flow_id: &str,
        _operation: &OperationDesc,
        _input: &Output,
        _output: &Output,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_execution_finished(
        &self,
        _ctx: &Context,
        _flow_id: &str,
        _args: &FunctionArguments,
        _input: &Output,
        _result: &Output,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_flow_changed(
        &self,
        _ctx: &Context,
        _added: &[String],
        _removed: &[String],
    ) -> Result<(), HookError> {
        Ok(())
    }
}
