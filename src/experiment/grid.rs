//! Parameter grid - Cartesian product of named axes plus derived values

use crate::error::{DriverError, DriverResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Scalar bound to one axis in one combination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl ParamValue {
    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ParamValue::Int(_) => "int",
            ParamValue::Float(_) => "float",
            ParamValue::Bool(_) => "bool",
            ParamValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Str(v) => f.write_str(v),
        }
    }
}

macro_rules! int_param {
    ($($t:ty),*) => {$(
        impl From<$t> for ParamValue {
            fn from(v: $t) -> Self {
                ParamValue::Int(v as i64)
            }
        }
    )*};
}

int_param!(i32, i64, u8, u16, u32, usize);

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// One combination: axis name to value, in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    values: Vec<(String, ParamValue)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a binding
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name.into(), value.into());
        self
    }

    fn insert(&mut self, name: String, value: ParamValue) {
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Value bound to `name`; unknown names are an error
    pub fn get(&self, name: &str) -> DriverResult<&ParamValue> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| {
                let known: Vec<&str> = self.values.iter().map(|(n, _)| n.as_str()).collect();
                DriverError::Parameter(format!(
                    "unknown parameter `{}` (known: {})",
                    name,
                    known.join(", ")
                ))
            })
    }

    pub fn int(&self, name: &str) -> DriverResult<i64> {
        let value = self.get(name)?;
        value.as_int().ok_or_else(|| mismatch(name, "int", value))
    }

    pub fn float(&self, name: &str) -> DriverResult<f64> {
        let value = self.get(name)?;
        value.as_float().ok_or_else(|| mismatch(name, "float", value))
    }

    pub fn bool(&self, name: &str) -> DriverResult<bool> {
        let value = self.get(name)?;
        value.as_bool().ok_or_else(|| mismatch(name, "bool", value))
    }

    pub fn str(&self, name: &str) -> DriverResult<&str> {
        let value = self.get(name)?;
        value.as_str().ok_or_else(|| mismatch(name, "string", value))
    }
}

fn mismatch(name: &str, wanted: &str, value: &ParamValue) -> DriverError {
    DriverError::Parameter(format!(
        "parameter `{}` is {} `{}`, not {}",
        name,
        value.kind(),
        value,
        wanted
    ))
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        Ok(())
    }
}

type Derivation = Arc<dyn Fn(&Params) -> anyhow::Result<ParamValue> + Send + Sync>;

/// Named axes whose Cartesian product drives an experiment
#[derive(Clone, Default)]
pub struct ParameterGrid {
    axes: Vec<(String, Vec<ParamValue>)>,
    derived: Vec<(String, Derivation)>,
}

impl ParameterGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a plain axis; earlier axes vary slower
    pub fn axis<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParamValue>,
    {
        self.axes
            .push((name.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Declare an axis computed from the plain axes of each combination
    pub fn derived<F, V>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Params) -> anyhow::Result<V> + Send + Sync + 'static,
        V: Into<ParamValue>,
    {
        let derive: Derivation = Arc::new(move |params| f(params).map(Into::into));
        self.derived.push((name.into(), derive));
        self
    }

    pub fn axis_names(&self) -> Vec<&str> {
        self.axes
            .iter()
            .map(|(n, _)| n.as_str())
            .chain(self.derived.iter().map(|(n, _)| n.as_str()))
            .collect()
    }

    /// Reject duplicate or empty axis names
    pub fn validate(&self) -> DriverResult<()> {
        let mut seen = HashSet::new();
        for name in self.axis_names() {
            if name.is_empty() {
                return Err(DriverError::Grid("axis name cannot be empty".into()));
            }
            if !seen.insert(name) {
                return Err(DriverError::Grid(format!("axis `{}` declared twice", name)));
            }
        }
        for (name, values) in &self.axes {
            if values.is_empty() {
                log::warn!("axis `{}` has no values; the grid is empty", name);
            }
        }
        Ok(())
    }

    /// Number of combinations: product of the plain axis lengths
    pub fn len(&self) -> usize {
        self.axes.iter().map(|(_, v)| v.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combination number `n` with its derived values bound
    pub fn combination(&self, n: usize) -> DriverResult<Params> {
        let total = self.len();
        if n >= total {
            return Err(DriverError::Grid(format!(
                "combination {} out of range for {} combinations",
                n, total
            )));
        }

        let mut params = Params::new();
        let mut stride = total;
        for (name, values) in &self.axes {
            stride /= values.len();
            params.insert(name.clone(), values[(n / stride) % values.len()].clone());
        }

        // derived axes only see plain values
        let plain = params.clone();
        for (name, derive) in &self.derived {
            let value = derive(&plain).map_err(|e| {
                DriverError::Parameter(format!("derived axis `{}` for {}: {:#}", name, plain, e))
            })?;
            params.insert(name.clone(), value);
        }
        Ok(params)
    }

    /// Every combination in order, last axis varying fastest
    pub fn combinations(&self) -> DriverResult<Vec<Params>> {
        self.validate()?;
        (0..self.len()).map(|n| self.combination(n)).collect()
    }
}

impl fmt::Debug for ParameterGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterGrid")
            .field("axes", &self.axes)
            .field(
                "derived",
                &self.derived.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_last_axis_fastest() {
        let grid = ParameterGrid::new()
            .axis("a", [1, 2])
            .axis("b", [10, 20]);
        let combos: Vec<(i64, i64)> = grid
            .combinations()
            .unwrap()
            .iter()
            .map(|p| (p.int("a").unwrap(), p.int("b").unwrap()))
            .collect();
        assert_eq!(combos, [(1, 10), (1, 20), (2, 10), (2, 20)]);
    }

    #[test]
    fn test_len_is_product() {
        let grid = ParameterGrid::new()
            .axis("workers", [2, 4, 8])
            .axis("sf", [1, 10])
            .axis("mode", ["a", "b", "c", "d"]);
        assert_eq!(grid.len(), 24);
        assert_eq!(grid.combinations().unwrap().len(), 24);
        assert_eq!(ParameterGrid::new().len(), 1);
    }

    #[test]
    fn test_empty_axis_gives_no_combinations() {
        let grid = ParameterGrid::new()
            .axis("a", [1, 2])
            .axis("b", Vec::<i64>::new());
        assert!(grid.is_empty());
        assert!(grid.combinations().unwrap().is_empty());
    }

    #[test]
    fn test_derived_axis_sees_plain_values() {
        let grid = ParameterGrid::new()
            .derived("slots", |p| Ok(p.int("workers")? * p.int("per_worker")?))
            .axis("workers", [2, 4])
            .axis("per_worker", [3]);
        let combos = grid.combinations().unwrap();
        assert_eq!(combos[0].int("slots").unwrap(), 6);
        assert_eq!(combos[1].int("slots").unwrap(), 12);
        assert_eq!(combos[1].to_string(), "workers=4, per_worker=3, slots=12");
    }

    #[test]
    fn test_derived_cannot_see_other_derived() {
        let grid = ParameterGrid::new()
            .axis("a", [1])
            .derived("b", |p| Ok(p.int("a")? + 1))
            .derived("c", |p| Ok(p.int("b")? + 1));
        assert!(matches!(
            grid.combinations(),
            Err(DriverError::Parameter(_))
        ));
    }

    #[test]
    fn test_duplicate_axis_rejected() {
        let grid = ParameterGrid::new()
            .axis("a", [1])
            .derived("a", |_| Ok(2));
        assert!(matches!(grid.validate(), Err(DriverError::Grid(_))));
    }

    #[test]
    fn test_typed_getters() {
        let p = Params::new()
            .with("n", 3)
            .with("ratio", 0.5)
            .with("verbose", true)
            .with("engine", "hyrise");
        assert_eq!(p.int("n").unwrap(), 3);
        assert_eq!(p.float("n").unwrap(), 3.0);
        assert_eq!(p.float("ratio").unwrap(), 0.5);
        assert!(p.bool("verbose").unwrap());
        assert_eq!(p.str("engine").unwrap(), "hyrise");
        assert!(p.int("engine").is_err());
        assert!(p.get("missing").is_err());
    }
}
