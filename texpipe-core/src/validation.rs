//! Cross-field validation for pipeline settings.
//!
//! Every settings type implements [`Validate`]. Issues are collected rather
//! than returned one at a time so a caller sees the whole list before any
//! image I/O happens.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validation issue found in a settings value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Dotted path of the offending field (e.g. `green.toksvig.composite_power`)
    pub field: String,
    pub message: String,
}

impl Issue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub(crate) fn join_issues(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Settings that can check their own invariants
pub trait Validate {
    /// Push every violated invariant into `issues`.
    fn collect_issues(&self, issues: &mut Vec<Issue>);

    /// Fails with [`Error::Validation`] when any issue was found.
    fn validate(&self) -> Result<()> {
        let issues = self.issues();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(issues))
        }
    }

    fn issues(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        self.collect_issues(&mut issues);
        issues
    }
}

/// Collects issues of a nested value under `prefix`.
pub(crate) fn collect_nested<V: Validate + ?Sized>(
    value: &V,
    prefix: &str,
    issues: &mut Vec<Issue>,
) {
    for issue in value.issues() {
        issues.push(Issue::new(format!("{}.{}", prefix, issue.field), issue.message));
    }
}

pub(crate) fn check_range<T>(issues: &mut Vec<Issue>, field: &str, value: T, min: T, max: T)
where
    T: PartialOrd + fmt::Display + Copy,
{
    // NaN fails both comparisons, so it is reported as well
    if !(value >= min && value <= max) {
        issues.push(Issue::new(
            field,
            format!("{} is out of range ({}..={})", value, min, max),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Knob(f32);

    impl Validate for Knob {
        fn collect_issues(&self, issues: &mut Vec<Issue>) {
            check_range(issues, "knob", self.0, 0.0, 1.0);
        }
    }

    #[test]
    fn check_range_reports_out_of_range_and_nan() {
        assert!(Knob(0.5).validate().is_ok());
        assert_eq!(Knob(1.5).issues().len(), 1);
        assert_eq!(Knob(f32::NAN).issues().len(), 1);
    }

    #[test]
    fn nested_issues_are_prefixed() {
        let mut issues = Vec::new();
        collect_nested(&Knob(-1.0), "red", &mut issues);
        assert_eq!(issues[0].field, "red.knob");
    }

    #[test]
    fn validation_error_lists_every_issue() {
        let err = Error::Validation(vec![Issue::new("a", "bad"), Issue::new("b", "worse")]);
        assert_eq!(err.to_string(), "Invalid settings: a: bad; b: worse");
    }
}
