//! Declared learning-rate groups over a model's named parameters.

use std::collections::BTreeSet;

use candle_core::Var;

use crate::{config::ParameterGroupConfig, TrainingError};

/// Implicit group holding every parameter no declared group claims.
pub const BASE_GROUP: &str = "base";

#[derive(Debug, Clone)]
pub struct ParameterGroup {
    pub name: String,
    pub lr_multiplier: f64,
    pub parameters: Vec<(String, Var)>,
}

impl ParameterGroup {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|(name, _)| name.as_str())
    }
}

/// Every trainable parameter lands in exactly one group.
#[derive(Debug, Clone)]
pub struct ParameterPartition {
    groups: Vec<ParameterGroup>,
}

impl ParameterPartition {
    /// Single `base` group at multiplier 1.0.
    pub fn uniform(named_parameters: Vec<(String, Var)>) -> Result<Self, TrainingError> {
        Self::build(named_parameters, &[], 1.0)
    }

    /// Assigns each parameter to the declared group whose prefix matches it.
    /// A parameter claimed by two groups is a configuration error; one
    /// claimed by none joins `base`.
    pub fn build(
        named_parameters: Vec<(String, Var)>,
        declared: &[ParameterGroupConfig],
        low_rate_multiplier: f64,
    ) -> Result<Self, TrainingError> {
        let mut seen = BTreeSet::new();
        let mut errors = Vec::new();
        for (name, _) in &named_parameters {
            if !seen.insert(name.clone()) {
                errors.push(format!("parameter '{name}' is exposed twice by the model"));
            }
        }

        let mut groups: Vec<ParameterGroup> = declared
            .iter()
            .map(|group| ParameterGroup {
                name: group.name.clone(),
                lr_multiplier: group.lr_multiplier.unwrap_or(low_rate_multiplier),
                parameters: Vec::new(),
            })
            .collect();
        let mut base = ParameterGroup {
            name: BASE_GROUP.to_string(),
            lr_multiplier: 1.0,
            parameters: Vec::new(),
        };

        for (name, var) in named_parameters {
            let owners: Vec<usize> = declared
                .iter()
                .enumerate()
                .filter(|(_, group)| {
                    group
                        .prefixes
                        .iter()
                        .any(|prefix| matches_prefix(&name, prefix))
                })
                .map(|(idx, _)| idx)
                .collect();
            match owners.as_slice() {
                [] => base.parameters.push((name, var)),
                [owner] => groups[*owner].parameters.push((name, var)),
                many => {
                    let names = many
                        .iter()
                        .map(|idx| declared[*idx].name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    errors.push(format!(
                        "parameter '{name}' matches several groups: {names}"
                    ));
                }
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        groups.push(base);
        groups.retain(|group| !group.parameters.is_empty());
        if groups.is_empty() {
            return Err(TrainingError::initialization(
                "parameter partition requires at least one parameter",
            ));
        }
        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[ParameterGroup] {
        &self.groups
    }

    pub fn group_of(&self, parameter: &str) -> Option<&ParameterGroup> {
        self.groups
            .iter()
            .find(|group| group.names().any(|name| name == parameter))
    }

    pub fn parameter_count(&self) -> usize {
        self.groups.iter().map(|group| group.parameters.len()).sum()
    }

    /// All parameters in group order.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        self.groups
            .iter()
            .flat_map(|group| group.parameters.iter().cloned())
            .collect()
    }

    pub fn into_groups(self) -> Vec<ParameterGroup> {
        self.groups
    }
}

fn matches_prefix(name: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('.');
    if prefix.is_empty() {
        return false;
    }
    name == prefix
        || name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}
