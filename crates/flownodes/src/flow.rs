//! Operators exposing the engine's own flows as functions: `flow` has one
//! function per stored flow, `flowbytag` one per tag.

use async_trait::async_trait;
use flowcore::{
    status, to_suggestions, AdaptedOperator, Context, DynamicFunctions, FlowError,
    FunctionArguments, OperatorBuilder, OperatorHandler, Output, Suggestions,
};
use flowruntime::FlowEngine;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

const ADDITIONAL_TAGS: &str = "additionalTags";

fn unavailable() -> Output {
    Output::error(status::SERVICE_UNAVAILABLE, "Flow engine is not running")
}

pub struct Flows {
    engine: Weak<FlowEngine>,
}

impl OperatorHandler for Flows {
    fn dynamic(&self) -> Option<&dyn DynamicFunctions> {
        Some(self)
    }
}

impl Flows {
    fn engine(&self) -> Option<Arc<FlowEngine>> {
        self.engine.upgrade()
    }
}

#[async_trait]
impl DynamicFunctions for Flows {
    fn dynamic_functions(&self) -> Vec<String> {
        self.engine().map(|e| e.flow_ids()).unwrap_or_default()
    }

    /// Everything the operations taking the main arguments accept
    fn dynamic_parameters(&self, function: &str) -> Vec<String> {
        let Some(engine) = self.engine() else {
            return Vec::new();
        };
        let Some(desc) = engine.flow_desc(function) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        desc.operations
            .iter()
            .filter(|op| op.use_main_args)
            .filter_map(|op| engine.operator(&op.operator).map(|o| o.parameters(&op.function)))
            .flatten()
            .filter(|p| seen.insert(p.to_lowercase()))
            .collect()
    }

    fn suggest_dynamic_values(&self, function: &str, arg: &str, other_args: &FunctionArguments) -> Suggestions {
        let mut suggestions = Suggestions::new();
        let Some(engine) = self.engine() else {
            return suggestions;
        };
        let Some(desc) = engine.flow_desc(function) else {
            return suggestions;
        };
        for op in desc.operations.iter().filter(|op| op.use_main_args) {
            let Some(operator) = engine.operator(&op.operator) else {
                continue;
            };
            // the arguments this operation would see on execution
            let mut op_args = op.arguments.clone();
            op_args.merge_from(other_args);
            suggestions.extend(operator.suggest_values(&op.function, arg, &op_args));
        }
        suggestions
    }

    async fn execute_dynamic(
        &self,
        ctx: &Context,
        function: &str,
        args: FunctionArguments,
        input: &Output,
    ) -> Output {
        // an operator feeding this call has already failed
        if input.is_error() {
            return input.clone();
        }
        match self.engine() {
            Some(engine) => engine.execute_flow(ctx, function, args, input.clone()).await,
            None => unavailable(),
        }
    }
}

pub struct FlowsByTag {
    engine: Weak<FlowEngine>,
}

impl OperatorHandler for FlowsByTag {
    fn dynamic(&self) -> Option<&dyn DynamicFunctions> {
        Some(self)
    }
}

impl FlowsByTag {
    fn tags(&self) -> Vec<String> {
        self.engine
            .upgrade()
            .map(|e| e.tags().into_iter().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DynamicFunctions for FlowsByTag {
    fn dynamic_functions(&self) -> Vec<String> {
        self.tags()
    }

    fn dynamic_parameters(&self, _function: &str) -> Vec<String> {
        vec![ADDITIONAL_TAGS.to_string()]
    }

    fn suggest_dynamic_values(&self, _function: &str, arg: &str, _other_args: &FunctionArguments) -> Suggestions {
        if arg.eq_ignore_ascii_case(ADDITIONAL_TAGS) {
            to_suggestions(self.tags())
        } else {
            Suggestions::new()
        }
    }

    /// Runs every flow carrying the function's tag and all of
    /// `additionalTags`. The flows get neither the arguments nor the input.
    async fn execute_dynamic(
        &self,
        ctx: &Context,
        function: &str,
        args: FunctionArguments,
        input: &Output,
    ) -> Output {
        if input.is_error() {
            return input.clone();
        }
        let Some(engine) = self.engine.upgrade() else {
            return unavailable();
        };
        let mut tags = Vec::new();
        if !function.is_empty() {
            tags.push(function.to_string());
        }
        if let Some(additional) = args.get_combined(ADDITIONAL_TAGS) {
            tags.extend(
                additional
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from),
            );
        }
        engine
            .execute_by_tags(ctx, &tags, FunctionArguments::new(), Output::empty())
            .await
    }
}

pub fn flow_operator(engine: Weak<FlowEngine>, enabled: bool) -> Result<Option<AdaptedOperator<Flows>>, FlowError> {
    OperatorBuilder::new("flow", Flows { engine })
        .enabled(enabled)
        .build()
}

pub fn flow_by_tag_operator(
    engine: Weak<FlowEngine>,
    enabled: bool,
) -> Result<Option<AdaptedOperator<FlowsByTag>>, FlowError> {
    OperatorBuilder::new("flowbytag", FlowsByTag { engine })
        .enabled(enabled)
        .build()
}
