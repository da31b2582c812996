//! Path filter language for projecting fields out of JSON responses.
//!
//! A filter path is an ordered list of steps, written in configuration as a
//! JSON array:
//!
//! - `"name"`: look up a key in an object
//! - `"3"`: index into an array (any string that parses as an integer)
//! - `"*"`: switch to list mode; must be the last step, or be followed by a
//!   single mapping step `{"field": [...path...], ...}` that is applied to
//!   every list element
//!
//! A key that does not match is a *soft miss*: it is logged and the whole
//! path evaluates to [`OutputValue::Missing`]. Misusing the wildcard is a
//! hard [`AppError::InvalidFilter`] error.

use std::fmt;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::AppError;
use crate::value::{OutputValue, Record};

/// Step value that switches the interpreter into list mode.
pub const WILDCARD: &str = "*";

/// Single-step path marking an output field as the raw download target.
pub const RAW_RESPONSE: &str = "<raw_response>";

/// One step of a [`FilterPath`].
#[derive(Debug, Clone, PartialEq)]
pub enum FilterStep {
    /// Object key, or array index when the string parses as an integer.
    Key(String),
    /// `"*"`
    Wildcard,
    /// Per-element projection, only valid directly after a wildcard.
    Mapping(IndexMap<String, FilterPath>),
}

/// An ordered list of filter steps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterPath {
    steps: Vec<FilterStep>,
}

impl FilterPath {
    /// Build a path from steps without validating wildcard placement.
    ///
    /// Placement is checked again on every [`apply`](Self::apply).
    pub fn new(steps: Vec<FilterStep>) -> Self {
        Self { steps }
    }

    /// Path consisting only of key steps.
    pub fn keys<S: AsRef<str>>(keys: &[S]) -> Self {
        Self::new(keys.iter().map(|k| step_from_str(k.as_ref())).collect())
    }

    /// Parse and validate a path from its JSON configuration form.
    pub fn from_json(value: &Value) -> Result<Self, AppError> {
        let items = value.as_array().ok_or_else(|| {
            AppError::InvalidFilter(format!("a filter path must be a JSON array, got {value}"))
        })?;

        let mut steps = Vec::with_capacity(items.len());
        for item in items {
            let step = match item {
                Value::String(s) => step_from_str(s),
                Value::Number(n) => FilterStep::Key(n.to_string()),
                Value::Object(fields) => {
                    let mut mapping = IndexMap::with_capacity(fields.len());
                    for (name, inner) in fields {
                        mapping.insert(name.clone(), FilterPath::from_json(inner)?);
                    }
                    FilterStep::Mapping(mapping)
                }
                other => {
                    return Err(AppError::InvalidFilter(format!(
                        "a filter path must only contain strings, the list operator, or a \
                         filter object, got {other}"
                    )));
                }
            };
            steps.push(step);
        }

        let path = Self::new(steps);
        path.validate()?;
        Ok(path)
    }

    pub fn steps(&self) -> &[FilterStep] {
        &self.steps
    }

    /// True for the `["<raw_response>"]` sentinel.
    pub fn is_raw_response(&self) -> bool {
        matches!(self.steps.as_slice(), [FilterStep::Key(k)] if k == RAW_RESPONSE)
    }

    /// Check wildcard and mapping placement, recursing into mappings.
    pub fn validate(&self) -> Result<(), AppError> {
        let len = self.steps.len();
        for (pos, step) in self.steps.iter().enumerate() {
            match step {
                FilterStep::Wildcard => {
                    if pos + 2 < len {
                        return Err(AppError::InvalidFilter(format!(
                            "the list operator must be the last or second-last step of {self}"
                        )));
                    }
                    if pos + 2 == len && !matches!(self.steps[pos + 1], FilterStep::Mapping(_)) {
                        return Err(AppError::InvalidFilter(format!(
                            "the list operator must be followed by a filter object in {self}"
                        )));
                    }
                }
                FilterStep::Mapping(mapping) => {
                    if pos == 0 || self.steps[pos - 1] != FilterStep::Wildcard {
                        return Err(AppError::InvalidFilter(format!(
                            "a filter object must directly follow the list operator in {self}"
                        )));
                    }
                    for inner in mapping.values() {
                        inner.validate()?;
                    }
                }
                FilterStep::Key(_) => {}
            }
        }
        Ok(())
    }

    /// Evaluate the path against a JSON value.
    ///
    /// Returns `Ok(OutputValue::Missing)` on a soft miss and `Ok(OutputValue::Null)`
    /// when the final step lands on an explicit `null`.
    pub fn apply(&self, value: &Value) -> Result<OutputValue, AppError> {
        self.validate()?;

        let mut current = value;
        for (pos, step) in self.steps.iter().enumerate() {
            match step {
                FilterStep::Wildcard => {
                    let items = current.as_array().ok_or_else(|| {
                        AppError::InvalidFilter(format!(
                            "list operator reached in {self}, but the current value is {}",
                            kind(current)
                        ))
                    })?;
                    return match self.steps.get(pos + 1) {
                        None => Ok(OutputValue::List(
                            items.iter().map(OutputValue::from).collect(),
                        )),
                        Some(FilterStep::Mapping(mapping)) => {
                            let mut records = Vec::with_capacity(items.len());
                            for item in items {
                                records.push(OutputValue::Record(project(item, mapping)?));
                            }
                            Ok(OutputValue::List(records))
                        }
                        Some(_) => Err(AppError::InvalidFilter(format!(
                            "the list operator must be followed by a filter object in {self}"
                        ))),
                    };
                }
                FilterStep::Mapping(_) => {
                    return Err(AppError::InvalidFilter(format!(
                        "a filter object must directly follow the list operator in {self}"
                    )));
                }
                FilterStep::Key(key) => match lookup(current, key) {
                    Some(next) => current = next,
                    None => {
                        tracing::warn!(
                            step = %key,
                            path = %self,
                            found = kind(current),
                            "Could not apply filter step"
                        );
                        return Ok(OutputValue::Missing);
                    }
                },
            }
        }

        Ok(OutputValue::from(current))
    }
}

fn step_from_str(s: &str) -> FilterStep {
    if s == WILDCARD {
        FilterStep::Wildcard
    } else {
        FilterStep::Key(s.to_string())
    }
}

fn lookup<'a>(current: &'a Value, key: &str) -> Option<&'a Value> {
    match current {
        Value::Object(fields) => fields.get(key),
        Value::Array(items) => {
            let index = key.parse::<i64>().ok()?;
            let index = if index < 0 {
                items.len().checked_sub(index.unsigned_abs() as usize)?
            } else {
                index as usize
            };
            items.get(index)
        }
        _ => None,
    }
}

fn project(item: &Value, mapping: &IndexMap<String, FilterPath>) -> Result<Record, AppError> {
    let mut record = Record::with_capacity(mapping.len());
    for (name, path) in mapping {
        record.insert(name.clone(), path.apply(item)?);
    }
    Ok(record)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

impl fmt::Display for FilterStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterStep::Key(key) => write!(f, "{key:?}"),
            FilterStep::Wildcard => write!(f, "\"{WILDCARD}\""),
            FilterStep::Mapping(mapping) => {
                write!(f, "{{")?;
                for (i, (name, path)) in mapping.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name:?}: {path}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl fmt::Display for FilterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{step}")?;
        }
        write!(f, "]")
    }
}
