//! Experiment registration - user bodies bound to servers, a grid and policy

use super::grid::{ParameterGrid, Params};
use crate::core::ServerList;
use crate::error::{DriverError, DriverResult};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// What an experiment body asks the controller to do next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Action {
    /// The combination is finished
    #[default]
    Done,
    /// Run the same combination again
    Restart,
}

type BodyFuture = Pin<Box<dyn Future<Output = anyhow::Result<Action>>>>;
type Body = Box<dyn Fn(ServerList, Params) -> BodyFuture>;

/// A registered experiment
pub struct Experiment {
    name: String,
    servers: ServerList,
    grid: Option<ParameterGrid>,
    raise_on_rc: bool,
    max_restarts: u32,
    body: Body,
}

impl Experiment {
    /// Bind `body` to `servers`; it runs once, or once per grid combination
    pub fn new<F, Fut>(name: impl Into<String>, servers: ServerList, body: F) -> Self
    where
        F: Fn(ServerList, Params) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<Action>> + 'static,
    {
        Self {
            name: name.into(),
            servers,
            grid: None,
            raise_on_rc: true,
            max_restarts: 0,
            body: Box::new(move |servers, params| Box::pin(body(servers, params))),
        }
    }

    pub fn params(mut self, grid: ParameterGrid) -> Self {
        self.grid = Some(grid);
        self
    }

    /// Whether non-zero exits raise inside the body by default
    pub fn raise_on_rc(mut self, raise: bool) -> Self {
        self.raise_on_rc = raise;
        self
    }

    /// Restarts allowed per combination before the experiment fails
    pub fn max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn servers(&self) -> &ServerList {
        &self.servers
    }

    pub fn grid(&self) -> Option<&ParameterGrid> {
        self.grid.as_ref()
    }

    pub fn raises_on_rc(&self) -> bool {
        self.raise_on_rc
    }

    pub fn restart_limit(&self) -> u32 {
        self.max_restarts
    }

    /// Every combination to run; a missing grid is one empty combination
    pub fn combinations(&self) -> DriverResult<Vec<Params>> {
        match &self.grid {
            Some(grid) => grid.combinations(),
            None => Ok(vec![Params::new()]),
        }
    }

    pub(crate) fn invoke(&self, params: Params) -> BodyFuture {
        (self.body)(self.servers.clone(), params)
    }
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.name)
            .field("servers", &self.servers.ids())
            .field("grid", &self.grid)
            .field("raise_on_rc", &self.raise_on_rc)
            .field("max_restarts", &self.max_restarts)
            .finish()
    }
}

/// Ordered set of experiments for one driver run
#[derive(Debug, Default)]
pub struct ExperimentRegistry {
    experiments: Vec<Experiment>,
}

impl ExperimentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an experiment; names must be unique and grids well formed
    pub fn register(&mut self, experiment: Experiment) -> DriverResult<()> {
        if experiment.name.is_empty() {
            return Err(DriverError::Config("experiment name cannot be empty".into()));
        }
        if self.experiments.iter().any(|e| e.name == experiment.name) {
            return Err(DriverError::Config(format!(
                "experiment `{}` registered twice",
                experiment.name
            )));
        }
        if let Some(grid) = &experiment.grid {
            grid.validate()?;
        }
        log::debug!("registered experiment `{}`", experiment.name);
        self.experiments.push(experiment);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.experiments.iter().map(|e| e.name()).collect()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Experiment> {
        self.experiments.iter()
    }
}

impl IntoIterator for ExperimentRegistry {
    type Item = Experiment;
    type IntoIter = std::vec::IntoIter<Experiment>;

    fn into_iter(self) -> Self::IntoIter {
        self.experiments.into_iter()
    }
}
