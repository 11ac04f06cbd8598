//! Gate policy configuration

use crate::core::finding::{Category, Severity};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// What a threshold breach does to the stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Enforcement {
    /// Breach fails the stage
    #[default]
    Hard,
    /// Breach marks the stage unstable
    Soft,
}

/// Maximum allowed count for one severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Threshold {
    pub max: u32,
    pub enforcement: Enforcement,
}

impl Threshold {
    pub fn hard(max: u32) -> Self {
        Self {
            max,
            enforcement: Enforcement::Hard,
        }
    }

    pub fn soft(max: u32) -> Self {
        Self {
            max,
            enforcement: Enforcement::Soft,
        }
    }
}

/// Accepts either `high: 0` (hard) or `high: { max: 5, enforcement: soft }`
impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Detailed {
            max: u32,
            #[serde(default)]
            enforcement: Enforcement,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Max(u32),
            Detailed(Detailed),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Max(max) => Threshold::hard(max),
            Repr::Detailed(d) => Threshold {
                max: d.max,
                enforcement: d.enforcement,
            },
        })
    }
}

/// Thresholds per severity for one scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<Threshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<Threshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<Threshold>,
}

impl SeverityThresholds {
    pub fn get(&self, severity: Severity) -> Option<Threshold> {
        match severity {
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }

    fn escalate(&mut self) {
        for threshold in [&mut self.high, &mut self.medium, &mut self.low]
            .into_iter()
            .flatten()
        {
            threshold.enforcement = Enforcement::Hard;
        }
    }
}

/// Severity-count gate applied to aggregated findings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePolicy {
    /// A disabled gate always passes
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Thresholds per finding category
    #[serde(default)]
    pub thresholds: BTreeMap<Category, SeverityThresholds>,

    /// Thresholds applied to the sum over all categories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<SeverityThresholds>,
}

fn default_enabled() -> bool {
    true
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: BTreeMap::new(),
            total: None,
        }
    }
}

impl GatePolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_threshold(
        mut self,
        category: Category,
        severity: Severity,
        threshold: Threshold,
    ) -> Self {
        let entry = self.thresholds.entry(category).or_default();
        match severity {
            Severity::High => entry.high = Some(threshold),
            Severity::Medium => entry.medium = Some(threshold),
            Severity::Low => entry.low = Some(threshold),
        }
        self
    }

    /// Same limits with every soft threshold turned hard
    pub fn escalated(&self) -> Self {
        let mut policy = self.clone();
        for thresholds in policy.thresholds.values_mut() {
            thresholds.escalate();
        }
        if let Some(total) = policy.total.as_mut() {
            total.escalate();
        }
        policy
    }
}

/// Outcome of evaluating a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateDecision {
    Pass,
    Unstable,
    Fail,
}

/// One threshold that was exceeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breach {
    /// `None` for the all-categories total
    pub category: Option<Category>,
    pub severity: Severity,
    pub count: u32,
    pub max: u32,
    pub enforcement: Enforcement,
}

impl std::fmt::Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scope = match self.category {
            Some(category) => category.to_string(),
            None => "total".to_string(),
        };
        write!(
            f,
            "{} {} findings: {} > {} ({:?})",
            scope, self.severity, self.count, self.max, self.enforcement
        )
    }
}

/// Gate decision with the breaches that led to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEvaluation {
    pub gate: String,
    pub decision: GateDecision,
    pub breaches: Vec<Breach>,
}

impl GateEvaluation {
    pub fn summary(&self) -> String {
        if self.breaches.is_empty() {
            return format!("gate '{}' passed", self.gate);
        }
        let details: Vec<String> = self.breaches.iter().map(|b| b.to_string()).collect();
        format!("gate '{}' {:?}: {}", self.gate, self.decision, details.join("; "))
    }
}
