use crate::engine::FlowEngine;
use chrono::Utc;
use flowcore::{
    status, CompleteFlow, Context, ExecutionEvent, FunctionArguments, OperationDesc, Output,
    ROOT_SYMBOL,
};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::Instrument;

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("variable pattern is valid"))
}

/// What happened to one operation
enum Step {
    /// Record the output under the operation name and go on
    Record(Output),
    /// Stop the run; the output is the flow result
    Abort(Output),
}

/// State of one execution of a validated flow. Nothing survives the run.
pub(crate) struct FlowRun<'a> {
    engine: &'a FlowEngine,
    flow: &'a CompleteFlow,
    outputs: HashMap<String, Output>,
}

impl<'a> FlowRun<'a> {
    pub(crate) fn new(engine: &'a FlowEngine, flow: &'a CompleteFlow) -> Self {
        Self {
            engine,
            flow,
            outputs: HashMap::new(),
        }
    }

    /// Runs the operations in declaration order and returns the recorded
    /// output of the flow's output source, or the error that stopped the run
    pub(crate) async fn execute(mut self, ctx: &Context, args: &FunctionArguments, input: &Output) -> Output {
        self.engine.metrics.count_flow();
        tracing::debug!(
            "Executing flow \"{}\" (\"{}\") with arguments {:?}",
            self.flow.id(),
            self.flow.desc().display_name,
            args.original_case_map()
        );
        self.outputs.insert(ROOT_SYMBOL.to_string(), input.clone());

        for op in self.flow.operations() {
            let op_ctx = ctx.child(&op.name);
            let step = self
                .execute_operation(&op_ctx, op, args)
                .instrument(op_ctx.span().clone())
                .await;
            match step {
                Step::Record(output) => {
                    self.outputs.insert(op.name.clone(), output);
                }
                Step::Abort(output) => {
                    tracing::debug!(
                        "Flow \"{}\" stopped at \"{}\": {}",
                        self.flow.id(),
                        op.name,
                        output
                    );
                    return output;
                }
            }
        }

        let output_from = self.flow.output_from();
        match self.outputs.remove(output_from) {
            Some(output) => output,
            None => {
                tracing::error!("Output from \"{}\" not found", output_from);
                Output::error(
                    status::INTERNAL_SERVER_ERROR,
                    format!("Output from \"{}\" not found", output_from),
                )
            }
        }
    }

    fn recorded(&self, name: &str) -> Option<&Output> {
        self.outputs.get(name)
    }

    fn errored(&self, name: &str) -> bool {
        self.recorded(name).map(Output::is_error).unwrap_or(false)
    }

    async fn execute_operation(&self, ctx: &Context, op: &OperationDesc, main_args: &FunctionArguments) -> Step {
        let input = op
            .input_from
            .as_deref()
            .and_then(|source| self.recorded(source))
            .cloned()
            .unwrap_or_default();
        if input.is_error() && op.execute_on_fail_of.is_none() {
            if input.status_code() != status::EXPECTATION_FAILED {
                tracing::debug!(
                    "Not executing operation \"{}\", because \"{}\" returned an error",
                    op.name,
                    op.input_from.as_deref().unwrap_or_default()
                );
            }
            return Step::Abort(input);
        }

        if let Some(source) = &op.execute_on_success_of {
            if self.errored(source) {
                return Step::Record(Output::error(
                    status::EXPECTATION_FAILED,
                    format!("Operation not executed because \"{}\" did not succeed", source),
                ));
            }
        }
        if let Some(source) = &op.execute_on_fail_of {
            if !self.errored(source) {
                return Step::Record(Output::error(
                    status::EXPECTATION_FAILED,
                    format!("Operation not executed because \"{}\" did not fail", source),
                ));
            }
        }

        let mut args = match self.substitute(&op.arguments) {
            Ok(args) => args,
            Err(message) => {
                let error = Output::error(status::NOT_FOUND, message);
                return Step::Record(self.operation_failed(ctx, op, &input, error).await);
            }
        };
        if op.use_main_args {
            for key in args.merge_from(main_args) {
                tracing::warn!("Argument {} of \"{}\" overwritten by main arg", key, op.name);
            }
        }
        if let Some(source) = &op.arguments_from {
            let Some(source_output) = self.recorded(source) else {
                let error = Output::error(
                    status::NOT_FOUND,
                    format!(
                        "Output of \"{}\" cannot be used as arguments, because there is no such output",
                        source
                    ),
                );
                return Step::Record(self.operation_failed(ctx, op, &input, error).await);
            };
            if source_output.is_error() {
                return Step::Abort(source_output.clone());
            }
            match source_output.to_args_map() {
                Ok(collected) => {
                    for (key, value) in collected {
                        args.set(key, value);
                    }
                }
                Err(e) => {
                    let error = Output::error(
                        status::INTERNAL_SERVER_ERROR,
                        format!("Output of \"{}\" cannot be used as arguments: {}", source, e),
                    );
                    return Step::Record(self.operation_failed(ctx, op, &input, error).await);
                }
            }
        }

        let Some(operator) = self.engine.operator(&op.operator) else {
            let error = Output::error(
                status::NOT_FOUND,
                format!("No operator with name \"{}\" found", op.operator),
            );
            return Step::Record(self.operation_failed(ctx, op, &input, error).await);
        };

        tracing::debug!(
            "Calling operator \"{}\", function \"{}\" with arguments {:?}",
            op.operator,
            op.function,
            args.original_case_map()
        );
        self.engine.metrics.count_operation();
        let started = Instant::now();
        let output = operator.execute(ctx, &op.function, args, &input).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.engine.events().emit(ExecutionEvent::OperationCompleted {
            context_id: ctx.id(),
            flow_id: self.flow.id().to_string(),
            operation: op.name.clone(),
            operator: op.operator.clone(),
            function: op.function.clone(),
            status: output.status_code(),
            duration_ms,
            timestamp: Utc::now(),
        });
        if output.is_error() && output.status_code() != status::EXPECTATION_FAILED {
            tracing::warn!(
                context = %ctx.id(),
                "Operation \"{}\" ({}/{}) failed: {}",
                op.name,
                op.operator,
                op.function,
                output
            );
        }
        self.engine
            .trigger_operation_hooks(ctx, self.flow.id(), op, &input, &output)
            .await;
        Step::Record(output)
    }

    async fn operation_failed(&self, ctx: &Context, op: &OperationDesc, input: &Output, error: Output) -> Output {
        tracing::debug!("Operation \"{}\" failed with error \"{}\"", op.name, error);
        self.engine
            .trigger_operation_hooks(ctx, self.flow.id(), op, input, &error)
            .await;
        error
    }

    /// Replaces `${name}` with the text of a recorded output and
    /// `${name.key}` with one entry of its flattened argument view
    fn substitute(&self, args: &FunctionArguments) -> Result<FunctionArguments, String> {
        let mut substituted = FunctionArguments::new();
        for (key, values) in args.iter() {
            for value in values {
                substituted.append(key, self.substitute_value(value)?);
            }
        }
        Ok(substituted)
    }

    fn substitute_value(&self, value: &str) -> Result<String, String> {
        let mut failure = None;
        let replaced = variable_pattern().replace_all(value, |caps: &Captures| {
            match self.resolve(&caps[1]) {
                Ok(text) => text,
                Err(message) => {
                    failure.get_or_insert(message);
                    String::new()
                }
            }
        });
        match failure {
            Some(message) => Err(message),
            None => Ok(replaced.into_owned()),
        }
    }

    fn resolve(&self, variable: &str) -> Result<String, String> {
        if let Some(output) = self.recorded(variable) {
            return Ok(output.to_text());
        }
        let Some((name, key)) = variable.split_once('.') else {
            return Err(format!("Output \"{}\" not found", variable));
        };
        let output = self
            .recorded(name)
            .ok_or_else(|| format!("Output \"{}\" not found", name))?;
        let map = output
            .to_args_map()
            .map_err(|e| format!("Cannot get \"{}\" from \"{}\": {}", key, name, e))?;
        map.get(key)
            .cloned()
            .ok_or_else(|| format!("Variable \"{}\" not found in output \"{}\"", key, name))
    }
}
