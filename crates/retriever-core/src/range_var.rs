use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// A numeric URI template variable, written `{name|start;stop;step}`.
///
/// Expands one entity into one entity per value of `start..stop` by `step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeVar {
    pub name: String,
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeVar {
    /// Values in `[start, stop)`, advancing by `step`.
    pub fn values(&self) -> impl Iterator<Item = i64> + '_ {
        // step is validated to be positive on parse
        (self.start..self.stop).step_by(self.step as usize)
    }

    /// Number of values, i.e. `ceil((stop - start) / step)`.
    pub fn len(&self) -> usize {
        if self.stop <= self.start {
            return 0;
        }
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let len = (stop - start + step - 1) / step;
        usize::try_from(len).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromStr for RangeVar {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let illegal = || AppError::config(format!("Illegal range variable: {s}"));

        let (name, range) = s.split_once('|').ok_or_else(illegal)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(illegal());
        }

        let parts: Vec<&str> = range.split(';').collect();
        let [start, stop, step] = parts.as_slice() else {
            return Err(illegal());
        };
        let parse = |part: &str| part.trim().parse::<i64>().map_err(|_| illegal());
        let (start, stop, step) = (parse(start)?, parse(stop)?, parse(step)?);
        if step <= 0 {
            return Err(AppError::config(format!(
                "Range variable {name} must have a positive step, got {step}"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            start,
            stop,
            step,
        })
    }
}

impl fmt::Display for RangeVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{};{};{}", self.name, self.start, self.stop, self.step)
    }
}
