//! Flow execution runtime
//!
//! This crate provides the [`FlowEngine`] that holds operators, flows and
//! hooks and executes flows, plus the fire-and-forget [`Dispatcher`], the
//! flow file loader and the hub configuration.

mod config;
pub mod dispatch;
mod engine;
mod executor;
mod hooks;
pub mod loader;

pub use config::{HubConfig, OperatorSettings, RuntimeConfig, ServerSettings};
pub use dispatch::{DispatchError, Dispatcher, Job, JobQueue, Target};
pub use engine::{EngineMetrics, FlowEngine};
pub use flowstore::FlowRepository;
pub use hooks::{FlowHook, HookError};
