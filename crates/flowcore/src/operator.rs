use crate::{Context, FunctionArguments, Output};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Suggested values for an argument, keyed by display label
pub type Suggestions = BTreeMap<String, String>;

/// A registered, named capability exposing one or more functions.
///
/// This is the contract the flow engine and every transport consume. Most
/// operators are not written against it directly but built with
/// [`OperatorBuilder`](crate::OperatorBuilder).
#[async_trait]
pub trait Operator: Send + Sync {
    /// Operator name as registered with the engine (e.g. "store", "system")
    fn name(&self) -> &str;

    async fn execute(
        &self,
        ctx: &Context,
        function: &str,
        args: FunctionArguments,
        input: &Output,
    ) -> Output;

    fn functions(&self) -> Vec<String>;

    fn parameters(&self, function: &str) -> Vec<String>;

    /// Must never fail and never change state, whatever `other_args` holds
    fn suggest_values(&self, function: &str, arg: &str, other_args: &FunctionArguments) -> Suggestions;

    /// Optional: open connections, subscribe to devices, start timers
    async fn start_listening(&self, _ctx: &Context) {}

    /// Optional: release what `start_listening` acquired
    async fn shutdown(&self, _ctx: &Context) {}
}

/// Functions that are only known at runtime, e.g. one per stored flow or
/// one per device command.
#[async_trait]
pub trait DynamicFunctions: Send + Sync {
    fn dynamic_functions(&self) -> Vec<String>;

    fn dynamic_parameters(&self, function: &str) -> Vec<String>;

    fn suggest_dynamic_values(
        &self,
        function: &str,
        arg: &str,
        other_args: &FunctionArguments,
    ) -> Suggestions;

    async fn execute_dynamic(
        &self,
        ctx: &Context,
        function: &str,
        args: FunctionArguments,
        input: &Output,
    ) -> Output;
}

/// Turns a plain list of values into suggestions labelled by themselves
pub fn to_suggestions<I, S>(values: I) -> Suggestions
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values
        .into_iter()
        .map(|v| {
            let v = v.into();
            (v.clone(), v)
        })
        .collect()
}
