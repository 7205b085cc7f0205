//! distexp - distributed experiment driver
//!
//! Experiments are async functions run on a single-threaded scheduler. They
//! start shell commands on remote agents, route the output lines into sinks
//! (console, files, closures, CSV aggregators) and decide per parameter
//! combination whether they are done or want to be restarted.

pub mod agent;
pub mod config;
pub mod core;
pub mod error;
pub mod experiment;
pub mod output;
pub mod session;

// Re-exports
pub use crate::config::{Inventory, RunPolicy};
pub use crate::core::{
    sleep, Command, ReturnCode, RunOptions, Scheduler, Selector, Server, ServerList, Slice,
};
pub use crate::error::{DriverError, DriverResult};
pub use crate::experiment::{
    Action, Driver, Experiment, ExperimentRegistry, ParamValue, ParameterGrid, Params,
};
pub use crate::output::{
    Callable, Console, CsvGenerator, FileSink, Output, Sink, SinkFactory,
};
pub use crate::session::RunSummary;

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
