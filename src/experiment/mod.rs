//! Experiments - parameter grids, registration and the run controller

mod controller;
mod grid;
mod registry;

pub use controller::Driver;
pub use grid::{ParamValue, ParameterGrid, Params};
pub use registry::{Action, Experiment, ExperimentRegistry};
