//! Matrix expansion: axes → one instance per combination.
//!
//! Expansion order is lexicographic over axis declaration order (the first
//! axis varies slowest), so logs and result listings are reproducible.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::types::MatrixConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatrixError {
    #[error("matrix declares no axes")]
    NoAxes,
    #[error("matrix axis '{0}' has no values")]
    EmptyAxis(String),
    #[error("matrix axis name must not be empty")]
    UnnamedAxis,
    #[error("matrix axis '{0}' is declared more than once")]
    DuplicateAxis(String),
    #[error("matrix axis '{axis}' lists value '{value}' more than once")]
    DuplicateValue { axis: String, value: String },
    #[error("matrix exclude references unknown axis '{0}'")]
    UnknownExcludeAxis(String),
    #[error("matrix exclude rules remove every combination")]
    AllExcluded,
}

/// One concrete combination of axis values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Position in expansion order.
    pub index: usize,
    /// `(axis, value)` pairs in axis declaration order.
    pub values: Vec<(String, String)>,
}

impl InstanceSpec {
    /// The single instance of a pipeline without a matrix.
    #[must_use]
    pub fn solo() -> Self {
        Self {
            index: 0,
            values: Vec::new(),
        }
    }

    /// Human-readable label, e.g. `python=3.8,os=linux`.
    #[must_use]
    pub fn label(&self) -> String {
        if self.values.is_empty() {
            return "default".to_string();
        }
        self.values
            .iter()
            .map(|(axis, value)| format!("{axis}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Filesystem-safe directory name, unique within a run.
    #[must_use]
    pub fn slug(&self) -> String {
        let cleaned: String = self
            .label()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{:03}-{cleaned}", self.index)
    }

    #[must_use]
    pub fn value(&self, axis: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }
}

/// Expand a matrix into its ordered instances.
///
/// A pipeline without a matrix yields exactly one instance.
///
/// # Errors
///
/// Returns a [`MatrixError`] for any configuration that would silently
/// produce zero instances or ambiguous ones.
pub fn expand(matrix: Option<&MatrixConfig>) -> Result<Vec<InstanceSpec>, MatrixError> {
    let Some(matrix) = matrix else {
        return Ok(vec![InstanceSpec::solo()]);
    };
    check_axes(matrix)?;

    let axes = &matrix.axes;
    let total: usize = axes.iter().map(|a| a.values.len()).product();
    let mut instances = Vec::with_capacity(total);
    let mut cursor = vec![0usize; axes.len()];

    for _ in 0..total {
        let values: Vec<(String, String)> = axes
            .iter()
            .zip(&cursor)
            .map(|(axis, &i)| (axis.name.clone(), axis.values[i].clone()))
            .collect();

        let excluded = matrix.exclude.iter().any(|rule| {
            rule.iter().all(|(axis, wanted)| {
                values
                    .iter()
                    .any(|(name, value)| name == axis && value == wanted)
            })
        });
        if !excluded {
            instances.push(InstanceSpec {
                index: instances.len(),
                values,
            });
        }

        // Odometer increment: the last axis varies fastest.
        for pos in (0..axes.len()).rev() {
            cursor[pos] += 1;
            if cursor[pos] < axes[pos].values.len() {
                break;
            }
            cursor[pos] = 0;
        }
    }

    if instances.is_empty() {
        return Err(MatrixError::AllExcluded);
    }
    Ok(instances)
}

fn check_axes(matrix: &MatrixConfig) -> Result<(), MatrixError> {
    if matrix.axes.is_empty() {
        return Err(MatrixError::NoAxes);
    }
    let mut names = HashSet::new();
    for axis in &matrix.axes {
        if axis.name.trim().is_empty() {
            return Err(MatrixError::UnnamedAxis);
        }
        if !names.insert(axis.name.as_str()) {
            return Err(MatrixError::DuplicateAxis(axis.name.clone()));
        }
        if axis.values.is_empty() {
            return Err(MatrixError::EmptyAxis(axis.name.clone()));
        }
        let mut seen = HashSet::new();
        for value in &axis.values {
            if !seen.insert(value.as_str()) {
                return Err(MatrixError::DuplicateValue {
                    axis: axis.name.clone(),
                    value: value.clone(),
                });
            }
        }
    }
    for rule in &matrix.exclude {
        if let Some(unknown) = rule.keys().find(|k| !names.contains(k.as_str())) {
            return Err(MatrixError::UnknownExcludeAxis(unknown.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::types::AxisConfig;

    fn axis(name: &str, values: &[&str]) -> AxisConfig {
        AxisConfig {
            name: name.into(),
            values: values.iter().map(|v| (*v).to_string()).collect(),
        }
    }

    fn matrix(axes: Vec<AxisConfig>) -> MatrixConfig {
        MatrixConfig {
            axes,
            exclude: Vec::new(),
            max_parallel: None,
        }
    }

    #[test]
    fn two_versions_one_os_in_declaration_order() {
        let m = matrix(vec![axis("version", &["A", "B"]), axis("os", &["L"])]);
        let instances = expand(Some(&m)).unwrap();
        let labels: Vec<_> = instances.iter().map(InstanceSpec::label).collect();
        assert_eq!(labels, vec!["version=A,os=L", "version=B,os=L"]);
        assert_eq!(instances[1].index, 1);
        assert_eq!(instances[1].value("version"), Some("B"));
    }

    #[test]
    fn first_axis_varies_slowest() {
        let m = matrix(vec![axis("a", &["1", "2"]), axis("b", &["x", "y"])]);
        let labels: Vec<_> = expand(Some(&m))
            .unwrap()
            .iter()
            .map(InstanceSpec::label)
            .collect();
        assert_eq!(labels, vec!["a=1,b=x", "a=1,b=y", "a=2,b=x", "a=2,b=y"]);
    }

    #[test]
    fn no_matrix_is_one_default_instance() {
        let instances = expand(None).unwrap();
        assert_eq!(instances, vec![InstanceSpec::solo()]);
        assert_eq!(instances[0].label(), "default");
    }

    #[test]
    fn empty_axis_is_an_error() {
        let m = matrix(vec![axis("python", &["3.8"]), axis("os", &[])]);
        assert_eq!(
            expand(Some(&m)).unwrap_err(),
            MatrixError::EmptyAxis("os".into())
        );
    }

    #[test]
    fn no_axes_is_an_error() {
        assert_eq!(expand(Some(&matrix(vec![]))).unwrap_err(), MatrixError::NoAxes);
    }

    #[test]
    fn duplicates_are_errors() {
        let m = matrix(vec![axis("a", &["1"]), axis("a", &["2"])]);
        assert_eq!(
            expand(Some(&m)).unwrap_err(),
            MatrixError::DuplicateAxis("a".into())
        );
        let m = matrix(vec![axis("a", &["1", "1"])]);
        assert!(matches!(
            expand(Some(&m)).unwrap_err(),
            MatrixError::DuplicateValue { .. }
        ));
    }

    #[test]
    fn exclude_drops_matching_combinations_and_reindexes() {
        let mut m = matrix(vec![axis("py", &["3.7", "3.8"]), axis("os", &["linux", "mac"])]);
        m.exclude = vec![BTreeMap::from([
            ("py".to_string(), "3.7".to_string()),
            ("os".to_string(), "mac".to_string()),
        ])];
        let instances = expand(Some(&m)).unwrap();
        let labels: Vec<_> = instances.iter().map(InstanceSpec::label).collect();
        assert_eq!(labels, vec!["py=3.7,os=linux", "py=3.8,os=linux", "py=3.8,os=mac"]);
        assert_eq!(
            instances.iter().map(|i| i.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn excluding_everything_is_an_error() {
        let mut m = matrix(vec![axis("py", &["3.7"])]);
        m.exclude = vec![BTreeMap::from([("py".to_string(), "3.7".to_string())])];
        assert_eq!(expand(Some(&m)).unwrap_err(), MatrixError::AllExcluded);
    }

    #[test]
    fn exclude_on_unknown_axis_is_an_error() {
        let mut m = matrix(vec![axis("py", &["3.7"])]);
        m.exclude = vec![BTreeMap::from([("os".to_string(), "mac".to_string())])];
        assert_eq!(
            expand(Some(&m)).unwrap_err(),
            MatrixError::UnknownExcludeAxis("os".into())
        );
    }

    #[test]
    fn slug_is_filesystem_safe() {
        let spec = InstanceSpec {
            index: 3,
            values: vec![("os".into(), "ubuntu latest/x86".into())],
        };
        assert_eq!(spec.slug(), "003-os_ubuntu_latest_x86");
    }
}
