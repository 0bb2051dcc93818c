//! Core abstractions for the flow hub
//!
//! This crate provides the types every other component speaks: the
//! [`Output`] envelope, the execution [`Context`], [`FunctionArguments`],
//! the [`Operator`] contract with its builder-based adapter, and flow
//! descriptors with their validation rules. It has no runtime of its own.

pub mod adapter;
mod arguments;
mod context;
pub mod duration;
mod error;
pub mod events;
mod flow;
mod operator;
pub mod output;
pub mod tags;

pub use adapter::{
    AdaptedOperator, ArgField, ArgKind, ArgumentRecord, BindMode, FunctionShape, NoArguments,
    OperatorBuilder, OperatorHandler,
};
pub use arguments::FunctionArguments;
pub use context::Context;
pub use error::{ArgumentError, ConversionError, FlowError, ValidationError};
pub use events::{EventBus, ExecutionEvent};
pub use flow::{CompleteFlow, FlowDesc, OperationDesc, ROOT_SYMBOL};
pub use operator::{to_suggestions, DynamicFunctions, Operator, Suggestions};
pub use output::{status, Output, OutputKind, Payload, FORM_CONTENT_TYPE};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
