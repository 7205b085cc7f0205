//! CSV generator - harvest numbers from output lines into result rows
//!
//! Each `ColumnSpec` is a regex with named capture groups; every named group
//! becomes a column aggregated according to the column kind:
//! - `Latest`: most recent capture wins
//! - `Array`: all captures, in match order, joined with `|`
//! - `Sum`: running numeric total
//! - `SortedArray`: all captures, sorted once at render time
//!
//! A `SortedArray` pattern with two named groups sorts by the first and
//! emits the second, e.g. `value=(?P<i>\d+),other=(?P<sorted_other>\d+)`.

use super::Sink;
use crate::error::{DriverError, DriverResult};
use anyhow::Result;
use regex::Regex;
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::Path;

/// Separator for `Array` and `SortedArray` values
pub const ARRAY_DELIMITER: &str = "|";

/// Aggregation strategy of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Latest,
    Array,
    Sum,
    SortedArray,
}

/// A regex plus the aggregation applied to its named groups
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub kind: ColumnKind,
    pub pattern: String,
}

impl ColumnSpec {
    pub fn latest(pattern: impl Into<String>) -> Self {
        Self::new(ColumnKind::Latest, pattern)
    }

    pub fn array(pattern: impl Into<String>) -> Self {
        Self::new(ColumnKind::Array, pattern)
    }

    pub fn sum(pattern: impl Into<String>) -> Self {
        Self::new(ColumnKind::Sum, pattern)
    }

    pub fn sorted_array(pattern: impl Into<String>) -> Self {
        Self::new(ColumnKind::SortedArray, pattern)
    }

    fn new(kind: ColumnKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
        }
    }
}

/// Bare patterns aggregate as `Latest`
impl From<&str> for ColumnSpec {
    fn from(pattern: &str) -> Self {
        Self::latest(pattern)
    }
}

#[derive(Debug, Clone)]
enum Aggregate {
    Latest(Option<String>),
    Array(Vec<String>),
    Sum(f64),
    SortedArray(Vec<(String, String)>),
    Constant(String),
}

impl Aggregate {
    fn empty(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Latest => Self::Latest(None),
            ColumnKind::Array => Self::Array(Vec::new()),
            ColumnKind::Sum => Self::Sum(0.0),
            ColumnKind::SortedArray => Self::SortedArray(Vec::new()),
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Latest(value) => value.clone().unwrap_or_default(),
            Self::Array(values) => values.join(ARRAY_DELIMITER),
            Self::Sum(total) => render_number(*total),
            Self::SortedArray(entries) => {
                let mut entries = entries.clone();
                sort_by_key_text(&mut entries);
                entries
                    .into_iter()
                    .map(|(_, value)| value)
                    .collect::<Vec<_>>()
                    .join(ARRAY_DELIMITER)
            }
            Self::Constant(value) => value.clone(),
        }
    }
}

fn render_number(total: f64) -> String {
    if total.fract() == 0.0 && total.abs() < 1e15 {
        format!("{}", total as i64)
    } else {
        format!("{}", total)
    }
}

/// Numeric order when every key is a number, text order otherwise
fn sort_by_key_text(entries: &mut [(String, String)]) {
    let numeric: Option<Vec<f64>> = entries.iter().map(|(k, _)| k.parse().ok()).collect();
    match numeric {
        Some(keys) => {
            let mut indexed: Vec<(f64, (String, String))> =
                keys.into_iter().zip(entries.iter().cloned()).collect();
            indexed.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
            for (slot, (_, entry)) in entries.iter_mut().zip(indexed) {
                *slot = entry;
            }
        }
        None => entries.sort_by(|a, b| a.0.cmp(&b.0)),
    }
}

#[derive(Debug, Clone)]
struct Column {
    name: String,
    aggregate: Aggregate,
}

/// One compiled pattern feeding one or more columns
#[derive(Debug, Clone)]
struct Rule {
    regex: Regex,
    /// (group name, column index)
    targets: Vec<(String, usize)>,
    /// Sort key group of a two-group `SortedArray`
    key_group: Option<String>,
}

/// Aggregates regex captures from output lines into one CSV row
#[derive(Debug, Clone)]
pub struct CsvGenerator {
    columns: Vec<Column>,
    rules: Vec<Rule>,
}

impl CsvGenerator {
    pub fn new<I, C>(specs: I) -> DriverResult<Self>
    where
        I: IntoIterator<Item = C>,
        C: Into<ColumnSpec>,
    {
        let mut generator = Self {
            columns: Vec::new(),
            rules: Vec::new(),
        };
        for spec in specs {
            generator.add_spec(spec.into())?;
        }
        Ok(generator)
    }

    fn add_spec(&mut self, spec: ColumnSpec) -> DriverResult<()> {
        let regex = Regex::new(&spec.pattern)
            .map_err(|e| DriverError::Format(format!("column pattern {:?}: {}", spec.pattern, e)))?;
        let groups: Vec<String> = regex.capture_names().flatten().map(str::to_string).collect();
        if groups.is_empty() {
            return Err(DriverError::Format(format!(
                "column pattern {:?} has no named group",
                spec.pattern
            )));
        }

        let (key_group, value_groups) = match spec.kind {
            ColumnKind::SortedArray if groups.len() == 2 => {
                (Some(groups[0].clone()), vec![groups[1].clone()])
            }
            ColumnKind::SortedArray if groups.len() > 2 => {
                return Err(DriverError::Format(format!(
                    "sorted column pattern {:?} takes one value group and an optional key group",
                    spec.pattern
                )));
            }
            _ => (None, groups),
        };

        let mut targets = Vec::with_capacity(value_groups.len());
        for group in value_groups {
            let index = self.push_column(&group, Aggregate::empty(spec.kind))?;
            targets.push((group, index));
        }

        self.rules.push(Rule {
            regex,
            targets,
            key_group,
        });
        Ok(())
    }

    fn push_column(&mut self, name: &str, aggregate: Aggregate) -> DriverResult<usize> {
        if self.columns.iter().any(|c| c.name == name) {
            return Err(DriverError::Format(format!("duplicate column {:?}", name)));
        }
        self.columns.push(Column {
            name: name.to_string(),
            aggregate,
        });
        Ok(self.columns.len() - 1)
    }

    /// Add a fixed-value column, e.g. a parameter of the current combination
    pub fn constant(mut self, name: &str, value: impl ToString) -> DriverResult<Self> {
        self.push_column(name, Aggregate::Constant(value.to_string()))?;
        Ok(self)
    }

    /// Column names in declaration order
    pub fn columns(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Rendered values in declaration order
    pub fn values(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.aggregate.render()).collect()
    }

    /// Comma-joined column names
    pub fn header(&self) -> String {
        let names: Vec<String> = self.columns.iter().map(|c| c.name.clone()).collect();
        csv_line(&names)
    }

    /// Comma-joined rendered aggregates
    pub fn row(&self) -> String {
        csv_line(&self.values())
    }

    /// Feed one output line to every column pattern
    pub fn feed(&mut self, line: &str) {
        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(line) else {
                continue;
            };
            let key = rule
                .key_group
                .as_deref()
                .and_then(|g| caps.name(g))
                .map(|m| m.as_str().to_string());

            for (group, index) in &rule.targets {
                let Some(value) = caps.name(group) else {
                    continue;
                };
                let value = value.as_str();
                match &mut self.columns[*index].aggregate {
                    Aggregate::Latest(latest) => *latest = Some(value.to_string()),
                    Aggregate::Array(values) => values.push(value.to_string()),
                    Aggregate::Sum(total) => match value.trim().parse::<f64>() {
                        Ok(v) => *total += v,
                        Err(_) => log::warn!("Column {} ignores non-numeric {:?}", group, value),
                    },
                    Aggregate::SortedArray(entries) => {
                        let key = key.clone().unwrap_or_else(|| value.to_string());
                        entries.push((key, value.to_string()));
                    }
                    Aggregate::Constant(_) => {}
                }
            }
        }
    }

    /// Append the row to `path`, writing the header first when the file is new.
    ///
    /// On failure the aggregates stay in memory and the unwritten row is
    /// logged and carried by the error.
    pub fn write(&self, path: impl AsRef<Path>) -> DriverResult<()> {
        let path = path.as_ref();
        let header = self.header();
        let row = self.row();

        self.append_row(path, &header, &row).map_err(|reason| {
            log::error!(
                "Could not write CSV {}: {}\n{}\n{}",
                path.display(),
                reason,
                header,
                row
            );
            DriverError::CsvWrite {
                path: path.to_path_buf(),
                reason,
                row: row.clone(),
            }
        })
    }

    fn append_row(&self, path: &Path, header: &str, row: &str) -> Result<(), String> {
        let needs_header = match File::open(path) {
            Ok(file) => {
                let mut first = String::new();
                BufReader::new(file)
                    .read_line(&mut first)
                    .map_err(|e| e.to_string())?;
                let first = first.trim_end_matches(['\r', '\n']);
                if first.is_empty() {
                    true
                } else if first == header {
                    false
                } else {
                    return Err(format!("existing header {:?} differs from {:?}", first, header));
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => return Err(e.to_string()),
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| e.to_string())?;
        if needs_header {
            writeln!(file, "{}", header).map_err(|e| e.to_string())?;
        }
        writeln!(file, "{}", row).map_err(|e| e.to_string())?;
        Ok(())
    }
}

impl Sink for CsvGenerator {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.feed(line);
        Ok(())
    }
}

/// One CSV record without the line terminator
fn csv_line(fields: &[String]) -> String {
    let mut writer = ::csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    let rendered = writer
        .write_record(fields)
        .map_err(|e| e.to_string())
        .and_then(|_| writer.into_inner().map_err(|e| e.to_string()))
        .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()));

    match rendered {
        Ok(line) => line.trim_end_matches(['\r', '\n']).to_string(),
        Err(e) => {
            log::debug!("csv encoding failed ({}), joining raw fields", e);
            fields.join(",")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_generator() -> CsvGenerator {
        CsvGenerator::new([
            ColumnSpec::latest(r"value=(?P<value>\d+)"),
            ColumnSpec::array(r"other=(?P<other>\d+)"),
            ColumnSpec::sum(r"other=(?P<other_sum>\d+)"),
            ColumnSpec::sorted_array(r"value=(?P<i>\d+),other=(?P<sorted_other>\d+)"),
        ])
        .unwrap()
    }

    #[test]
    fn test_two_lines_aggregate() {
        let mut csv = example_generator();
        csv.feed("value=1,other=2");
        csv.feed("value=3,other=4");

        assert_eq!(csv.header(), "value,other,other_sum,sorted_other");
        assert_eq!(csv.row(), "3,2|4,6,2|4");
    }

    #[test]
    fn test_countdown_sorted_by_key() {
        let mut csv = example_generator();
        for i in (1..=10).rev() {
            csv.feed(&format!("value={},other={}", i, i * 2));
        }

        assert_eq!(
            csv.row(),
            "1,20|18|16|14|12|10|8|6|4|2,110,2|4|6|8|10|12|14|16|18|20"
        );
    }

    #[test]
    fn test_single_group_sorted_array_sorts_values_numerically() {
        let mut csv = CsvGenerator::new([ColumnSpec::sorted_array(r"lat=(?P<lat>\d+)")]).unwrap();
        for v in ["100", "9", "25"] {
            csv.feed(&format!("lat={}", v));
        }
        assert_eq!(csv.row(), "9|25|100");
    }

    #[test]
    fn test_one_regex_many_groups() {
        let mut csv =
            CsvGenerator::new([r"tx=(?P<tx>\d+) aborts=(?P<aborts>\d+)"]).unwrap();
        csv.feed("tx=10 aborts=1");
        csv.feed("noise");
        csv.feed("tx=12 aborts=0");

        assert_eq!(csv.columns(), ["tx", "aborts"]);
        assert_eq!(csv.values(), ["12", "0"]);
    }

    #[test]
    fn test_no_matches_render_empty_or_zero() {
        let csv = example_generator();
        assert_eq!(csv.row(), ",,0,");
    }

    #[test]
    fn test_fractional_sum() {
        let mut csv = CsvGenerator::new([ColumnSpec::sum(r"t=(?P<t>[\d.]+)")]).unwrap();
        csv.feed("t=0.5");
        csv.feed("t=1.25");
        assert_eq!(csv.row(), "1.75");
    }

    #[test]
    fn test_constant_columns_follow_declaration_order() {
        let mut csv = CsvGenerator::new([r"tps=(?P<tps>\d+)"])
            .unwrap()
            .constant("nodes", 4)
            .unwrap();
        csv.feed("tps=900");
        assert_eq!(csv.header(), "tps,nodes");
        assert_eq!(csv.row(), "900,4");
    }

    #[test]
    fn test_rejects_bad_patterns() {
        assert!(CsvGenerator::new([r"value=\d+"]).is_err());
        assert!(CsvGenerator::new([r"value=(?P<v>\d+"]).is_err());
        assert!(CsvGenerator::new([r"a=(?P<x>\d+)", r"b=(?P<x>\d+)"]).is_err());
    }

    #[test]
    fn test_write_header_once_then_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.csv");

        let mut first = example_generator();
        first.feed("value=1,other=2");
        first.write(&path).unwrap();

        let mut second = example_generator();
        second.feed("value=5,other=6");
        second.write(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "value,other,other_sum,sorted_other\n1,2,2,2\n5,6,6,6\n"
        );
    }

    #[test]
    fn test_write_refuses_foreign_header_and_keeps_aggregates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.csv");
        std::fs::write(&path, "something,else\n1,2\n").unwrap();

        let mut csv = example_generator();
        csv.feed("value=7,other=8");
        let err = csv.write(&path).unwrap_err();

        match err {
            DriverError::CsvWrite { row, .. } => assert_eq!(row, "7,8,8,8"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(csv.row(), "7,8,8,8");
    }

    #[test]
    fn test_sink_feeds_generator() {
        let mut csv = example_generator();
        csv.write_line("value=9,other=1").unwrap();
        assert_eq!(csv.values()[0], "9");
    }
}
