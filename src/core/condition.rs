//! Stage activation predicates

use crate::core::{config::ConditionConfig, context::RunContext, error::PipelineError};
use regex::Regex;

/// Pattern for matching a branch name or variable value (not serializable due to Regex)
#[derive(Debug, Clone)]
pub enum ConditionPattern {
    /// Whole-string equality
    Exact(String),
    /// Regular expression match
    Regex(Regex),
}

impl ConditionPattern {
    /// Check if the pattern matches the given text
    pub fn matches(&self, text: &str) -> bool {
        match self {
            ConditionPattern::Exact(expected) => text == expected,
            ConditionPattern::Regex(regex) => regex.is_match(text),
        }
    }

    fn regex(pattern: &str) -> Result<Self, PipelineError> {
        Regex::new(pattern)
            .map(ConditionPattern::Regex)
            .map_err(|e| PipelineError::Configuration(format!("invalid pattern '{}': {}", pattern, e)))
    }
}

/// Decides whether a stage runs for the current pipeline run
#[derive(Debug, Clone)]
pub enum ActivationPredicate {
    Always,
    /// Branch name matches
    Branch(ConditionPattern),
    /// A run flag (e.g. `force_release`) is set
    Flag(String),
    /// A run variable matches
    Variable { name: String, pattern: ConditionPattern },
    AllOf(Vec<ActivationPredicate>),
    AnyOf(Vec<ActivationPredicate>),
    Not(Box<ActivationPredicate>),
}

impl Default for ActivationPredicate {
    fn default() -> Self {
        ActivationPredicate::Always
    }
}

impl ActivationPredicate {
    /// Build a predicate from its configuration. Every field present must hold.
    pub fn from_config(config: &ConditionConfig) -> Result<Self, PipelineError> {
        let mut all = Vec::new();

        if let Some(branch) = &config.branch {
            all.push(ActivationPredicate::Branch(ConditionPattern::Exact(branch.clone())));
        }
        if let Some(pattern) = &config.branch_matches {
            all.push(ActivationPredicate::Branch(ConditionPattern::regex(pattern)?));
        }
        if let Some(flag) = &config.flag {
            all.push(ActivationPredicate::Flag(flag.clone()));
        }
        if let Some(var) = &config.variable {
            let pattern = match (&var.equals, &var.matches) {
                (Some(value), None) => ConditionPattern::Exact(value.clone()),
                (None, Some(pattern)) => ConditionPattern::regex(pattern)?,
                _ => {
                    return Err(PipelineError::Configuration(format!(
                        "variable condition on '{}' needs exactly one of 'equals' or 'matches'",
                        var.name
                    )))
                }
            };
            all.push(ActivationPredicate::Variable {
                name: var.name.clone(),
                pattern,
            });
        }
        if !config.any_of.is_empty() {
            let any = config
                .any_of
                .iter()
                .map(ActivationPredicate::from_config)
                .collect::<Result<Vec<_>, _>>()?;
            all.push(ActivationPredicate::AnyOf(any));
        }
        if !config.all_of.is_empty() {
            let nested = config
                .all_of
                .iter()
                .map(ActivationPredicate::from_config)
                .collect::<Result<Vec<_>, _>>()?;
            all.push(ActivationPredicate::AllOf(nested));
        }
        if let Some(not) = &config.not {
            all.push(ActivationPredicate::Not(Box::new(ActivationPredicate::from_config(not)?)));
        }

        Ok(match all.len() {
            0 => ActivationPredicate::Always,
            1 => all.remove(0),
            _ => ActivationPredicate::AllOf(all),
        })
    }

    /// Evaluate against the run context
    pub fn evaluate(&self, context: &RunContext) -> bool {
        match self {
            ActivationPredicate::Always => true,
            ActivationPredicate::Branch(pattern) => context
                .branch
                .as_deref()
                .is_some_and(|branch| pattern.matches(branch)),
            ActivationPredicate::Flag(flag) => context.flag(flag),
            ActivationPredicate::Variable { name, pattern } => context
                .get_variable(name)
                .is_some_and(|value| pattern.matches(value)),
            ActivationPredicate::AllOf(predicates) => predicates.iter().all(|p| p.evaluate(context)),
            ActivationPredicate::AnyOf(predicates) => predicates.iter().any(|p| p.evaluate(context)),
            ActivationPredicate::Not(predicate) => !predicate.evaluate(context),
        }
    }
}
