//! Stage dependency graph for one pipeline instance.

use std::collections::HashMap;

use crate::config::types::StageConfig;

/// Resolved predecessor lists, indexed by stage position.
///
/// Every edge points at an earlier stage, so declaration order is already a
/// valid topological order and the graph cannot contain a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageGraph {
    deps: Vec<Vec<usize>>,
}

impl StageGraph {
    /// Resolve `needs` into indices.
    ///
    /// An absent `needs` means "the previous stage"; the first stage has no
    /// predecessors.
    ///
    /// # Errors
    ///
    /// Returns every unknown, forward or self reference found.
    pub fn build(stages: &[StageConfig]) -> Result<Self, Vec<String>> {
        let positions: HashMap<&str, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        let mut errors = Vec::new();
        let mut deps = Vec::with_capacity(stages.len());

        for (i, stage) in stages.iter().enumerate() {
            let resolved = match &stage.needs {
                None if i == 0 => Vec::new(),
                None => vec![i - 1],
                Some(names) => {
                    let mut resolved = Vec::with_capacity(names.len());
                    for name in names {
                        match positions.get(name.as_str()) {
                            None => errors.push(format!(
                                "Stage '{}' needs unknown stage '{name}'",
                                stage.name
                            )),
                            Some(&j) if j == i => errors
                                .push(format!("Stage '{}' cannot need itself", stage.name)),
                            Some(&j) if j > i => errors.push(format!(
                                "Stage '{}' needs '{name}', which is declared after it",
                                stage.name
                            )),
                            Some(&j) => {
                                if !resolved.contains(&j) {
                                    resolved.push(j);
                                }
                            }
                        }
                    }
                    resolved
                }
            };
            deps.push(resolved);
        }

        if errors.is_empty() {
            Ok(Self { deps })
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    #[must_use]
    pub fn deps(&self, stage: usize) -> &[usize] {
        &self.deps[stage]
    }
}
