//! Builds uniformly invokable operators from typed handler functions.
//!
//! An operator author lists its functions explicitly in an
//! [`OperatorBuilder`], choosing one of five call shapes per function. The
//! resulting [`AdaptedOperator`] implements [`Operator`]: it binds caller
//! arguments to typed records, routes unknown names to an optional
//! [`DynamicFunctions`] implementation and answers discovery queries.

mod binding;
mod suggest;

pub use binding::{bind_arguments, ArgField, ArgKind, ArgumentRecord, BindMode, NoArguments};
pub use suggest::fallback_suggestions;

use crate::error::{ArgumentError, FlowError};
use crate::operator::{to_suggestions, DynamicFunctions, Operator, Suggestions};
use crate::{Context, FunctionArguments, Output};
use async_trait::async_trait;
use binding::{Binder, RecordBinder, RecordCall};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;

/// Names that belong to the operator lifecycle and are never functions
const RESERVED_NAMES: &[&str] = &[
    "getname",
    "name",
    "execute",
    "startlistening",
    "shutdown",
    "gethook",
    "functions",
    "parameters",
    "suggestvalues",
    "getdefaultconfig",
    "initcopyofoperator",
];

const SUGGESTIONS_SUFFIX: &str = "suggestions";

/// Parameter shape of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FunctionShape {
    /// `fn(&op)`
    Simple,
    /// `fn(&op, &ctx)`
    ContextOnly,
    /// `fn(&op, &ctx, &input)`
    ContextAndInput,
    /// `fn(&op, &ctx, &input, record)`
    WithArguments,
    /// `fn(&op, &ctx, &input, record, leftover_args)`
    FullSignature,
}

/// Hooks an adapted operator may provide besides its function table
#[async_trait]
pub trait OperatorHandler: Send + Sync + 'static {
    /// Operator-wide suggestions for an argument, consulted after the
    /// argument record's own suggestions
    fn suggest(&self, _arg: &str, _other_args: &FunctionArguments) -> Option<Vec<String>> {
        None
    }

    fn dynamic(&self) -> Option<&dyn DynamicFunctions> {
        None
    }

    async fn start_listening(&self, _ctx: &Context) {}

    async fn shutdown(&self, _ctx: &Context) {}
}

type SimpleFn<O> = Box<dyn for<'a> Fn(&'a O) -> BoxFuture<'a, Output> + Send + Sync>;
type ContextFn<O> = Box<dyn for<'a> Fn(&'a O, &'a Context) -> BoxFuture<'a, Output> + Send + Sync>;
type InputFn<O> =
    Box<dyn for<'a> Fn(&'a O, &'a Context, &'a Output) -> BoxFuture<'a, Output> + Send + Sync>;

enum Handler<O> {
    Simple(SimpleFn<O>),
    ContextOnly(ContextFn<O>),
    ContextAndInput(InputFn<O>),
    WithArguments(Box<dyn Binder<O>>),
    FullSignature(Box<dyn Binder<O>>),
}

impl<O> Handler<O> {
    fn shape(&self) -> FunctionShape {
        match self {
            Handler::Simple(_) => FunctionShape::Simple,
            Handler::ContextOnly(_) => FunctionShape::ContextOnly,
            Handler::ContextAndInput(_) => FunctionShape::ContextAndInput,
            Handler::WithArguments(_) => FunctionShape::WithArguments,
            Handler::FullSignature(_) => FunctionShape::FullSignature,
        }
    }

    fn binder(&self) -> Option<&dyn Binder<O>> {
        match self {
            Handler::WithArguments(b) | Handler::FullSignature(b) => Some(b.as_ref()),
            _ => None,
        }
    }
}

struct FunctionEntry<O> {
    name: String,
    handler: Handler<O>,
}

/// Explicit function table of an operator under construction
pub struct OperatorBuilder<O> {
    name: String,
    handler: O,
    functions: Vec<FunctionEntry<O>>,
    strict: bool,
    enabled: bool,
}

impl<O: OperatorHandler> OperatorBuilder<O> {
    pub fn new(name: impl Into<String>, handler: O) -> Self {
        Self {
            name: name.into(),
            handler,
            functions: Vec::new(),
            strict: true,
            enabled: true,
        }
    }

    /// Strict operators reject calls whose optional arguments fail to
    /// convert; lenient ones ignore such arguments
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn simple<F>(self, name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&'a O) -> BoxFuture<'a, Output> + Send + Sync + 'static,
    {
        self.push(name, Handler::Simple(Box::new(f)))
    }

    pub fn context_only<F>(self, name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&'a O, &'a Context) -> BoxFuture<'a, Output> + Send + Sync + 'static,
    {
        self.push(name, Handler::ContextOnly(Box::new(f)))
    }

    pub fn context_and_input<F>(self, name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&'a O, &'a Context, &'a Output) -> BoxFuture<'a, Output>
            + Send
            + Sync
            + 'static,
    {
        self.push(name, Handler::ContextAndInput(Box::new(f)))
    }

    pub fn with_arguments<R, F>(self, name: &str, f: F) -> Self
    where
        R: ArgumentRecord<O>,
        F: for<'a> Fn(&'a O, &'a Context, &'a Output, R) -> BoxFuture<'a, Output>
            + Send
            + Sync
            + 'static,
    {
        let binder = RecordBinder {
            fields: R::fields(),
            call: RecordCall::Record(Box::new(f)),
        };
        self.push(name, Handler::WithArguments(Box::new(binder)))
    }

    pub fn full_signature<R, F>(self, name: &str, f: F) -> Self
    where
        R: ArgumentRecord<O>,
        F: for<'a> Fn(&'a O, &'a Context, &'a Output, R, FunctionArguments) -> BoxFuture<'a, Output>
            + Send
            + Sync
            + 'static,
    {
        let binder = RecordBinder {
            fields: R::fields(),
            call: RecordCall::RecordAndRest(Box::new(f)),
        };
        self.push(name, Handler::FullSignature(Box::new(binder)))
    }

    fn push(mut self, name: &str, handler: Handler<O>) -> Self {
        self.functions.push(FunctionEntry {
            name: name.to_string(),
            handler,
        });
        self
    }

    /// Finalizes the function table.
    ///
    /// Returns `Ok(None)` for a disabled operator. Ineligible entries are
    /// skipped with a warning; an enabled operator left without any
    /// function is an error.
    pub fn build(self) -> Result<Option<AdaptedOperator<O>>, FlowError> {
        if !self.enabled {
            tracing::info!("Operator {} is disabled", self.name);
            return Ok(None);
        }

        let mut functions = BTreeMap::new();
        for entry in self.functions {
            let key = entry.name.to_lowercase();
            if key.is_empty() || RESERVED_NAMES.contains(&key.as_str()) {
                tracing::warn!("{}: \"{}\" is a reserved name, skipping", self.name, entry.name);
                continue;
            }
            if key.ends_with(SUGGESTIONS_SUFFIX) {
                tracing::warn!("{}: \"{}\" looks like a suggestion provider, skipping", self.name, entry.name);
                continue;
            }
            if functions.contains_key(&key) {
                tracing::warn!("{}: function \"{}\" is defined twice, skipping", self.name, entry.name);
                continue;
            }
            functions.insert(key, entry);
        }

        if functions.is_empty() && self.handler.dynamic().is_none() {
            return Err(FlowError::NoFunctions(self.name));
        }

        tracing::debug!("Operator {} provides {} functions", self.name, functions.len());
        Ok(Some(AdaptedOperator {
            name: self.name,
            handler: self.handler,
            functions,
            strict: self.strict,
        }))
    }
}

/// An operator produced by [`OperatorBuilder`]
pub struct AdaptedOperator<O> {
    name: String,
    handler: O,
    functions: BTreeMap<String, FunctionEntry<O>>,
    strict: bool,
}

impl<O: OperatorHandler> AdaptedOperator<O> {
    pub fn handler(&self) -> &O {
        &self.handler
    }

    /// Shape of a statically registered function
    pub fn shape(&self, function: &str) -> Option<FunctionShape> {
        self.functions
            .get(&function.to_lowercase())
            .map(|entry| entry.handler.shape())
    }

    fn entry(&self, function: &str) -> Option<&FunctionEntry<O>> {
        self.functions.get(&function.to_lowercase())
    }
}

#[async_trait]
impl<O: OperatorHandler> Operator for AdaptedOperator<O> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        ctx: &Context,
        function: &str,
        args: FunctionArguments,
        input: &Output,
    ) -> Output {
        let Some(entry) = self.entry(function) else {
            return match self.handler.dynamic() {
                Some(dynamic) => dynamic.execute_dynamic(ctx, function, args, input).await,
                None => ArgumentError::UnknownFunction(function.to_string()).into(),
            };
        };

        let mode = if self.strict {
            BindMode::Strict
        } else {
            BindMode::Tolerant
        };
        match &entry.handler {
            Handler::Simple(f) => f(&self.handler).await,
            Handler::ContextOnly(f) => f(&self.handler, ctx).await,
            Handler::ContextAndInput(f) => f(&self.handler, ctx, input).await,
            Handler::WithArguments(binder) | Handler::FullSignature(binder) => {
                binder.invoke(&self.handler, ctx, input, args, mode).await
            }
        }
    }

    fn functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.values().map(|e| e.name.clone()).collect();
        if let Some(dynamic) = self.handler.dynamic() {
            for name in dynamic.dynamic_functions() {
                if !self.functions.contains_key(&name.to_lowercase()) {
                    names.push(name);
                }
            }
        }
        names
    }

    fn parameters(&self, function: &str) -> Vec<String> {
        match self.entry(function) {
            Some(entry) => entry
                .handler
                .binder()
                .map(|b| b.parameters())
                .unwrap_or_default(),
            None => self
                .handler
                .dynamic()
                .map(|d| d.dynamic_parameters(function))
                .unwrap_or_default(),
        }
    }

    fn suggest_values(&self, function: &str, arg: &str, other_args: &FunctionArguments) -> Suggestions {
        let Some(entry) = self.entry(function) else {
            return self
                .handler
                .dynamic()
                .map(|d| d.suggest_dynamic_values(function, arg, other_args))
                .unwrap_or_default();
        };
        let binder = entry.handler.binder();

        if let Some(values) = binder.and_then(|b| b.record_suggestions(&self.handler, arg, other_args)) {
            if !values.is_empty() {
                return to_suggestions(values);
            }
        }
        if let Some(values) = self.handler.suggest(arg, other_args) {
            if !values.is_empty() {
                return to_suggestions(values);
            }
        }
        binder
            .and_then(|b| b.field_kind(arg))
            .map(|kind| fallback_suggestions(kind, arg))
            .unwrap_or_default()
    }

    async fn start_listening(&self, ctx: &Context) {
        self.handler.start_listening(ctx).await
    }

    async fn shutdown(&self, ctx: &Context) {
        self.handler.shutdown(ctx).await
    }
}
