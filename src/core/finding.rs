//! Normalized scanner findings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of issue a finding describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DependencyVulnerability,
    CodeSecurityIssue,
    LintIssue,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::DependencyVulnerability => "dependency_vulnerability",
            Category::CodeSecurityIssue => "code_security_issue",
            Category::LintIssue => "lint_issue",
        };
        f.write_str(label)
    }
}

/// Canonical severity. Ordered so that `High` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Map a scanner-specific severity label onto the canonical levels.
    ///
    /// Missing or unrecognised labels default to `Medium`.
    pub fn normalize(raw: Option<&str>) -> Severity {
        let Some(raw) = raw else {
            return Severity::Medium;
        };

        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "high" | "error" | "blocker" | "severe" | "fatal" => Severity::High,
            "medium" | "moderate" | "warning" | "warn" | "major" => Severity::Medium,
            "low" | "info" | "informational" | "note" | "minor" | "negligible" | "convention"
            | "refactor" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        };
        f.write_str(label)
    }
}

/// Source location of a finding
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.file, line),
            None => f.write_str(&self.file),
        }
    }
}

/// A single normalized issue record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Scanner rule or advisory identifier, when the report has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Which scanner produced the finding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner: Option<String>,
}

impl Finding {
    pub fn new(category: Category, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            description: description.into(),
            location: None,
            rule: None,
            scanner: None,
        }
    }

    pub fn at(mut self, file: impl Into<String>, line: Option<u32>) -> Self {
        self.location = Some(Location {
            file: file.into(),
            line,
        });
        self
    }

    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    /// Total order used to make aggregation output independent of report order
    pub(crate) fn sort_key(&self) -> (Category, Severity, Option<&Location>, &str, Option<&str>) {
        (
            self.category,
            self.severity,
            self.location.as_ref(),
            self.description.as_str(),
            self.rule.as_deref(),
        )
    }
}

/// High/Medium/Low counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub high: u32,
    pub medium: u32,
    pub low: u32,
}

impl SeverityCounts {
    pub fn new(high: u32, medium: u32, low: u32) -> Self {
        Self { high, medium, low }
    }

    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    pub fn get(&self, severity: Severity) -> u32 {
        match severity {
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }

    pub fn total(&self) -> u32 {
        self.high + self.medium + self.low
    }

    fn add(&mut self, other: &SeverityCounts) {
        self.high += other.high;
        self.medium += other.medium;
        self.low += other.low;
    }
}

/// Severity counts per category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryCounts(BTreeMap<Category, SeverityCounts>);

impl CategoryCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_findings<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> Self {
        let mut counts = Self::new();
        for finding in findings {
            counts.record(finding.category, finding.severity);
        }
        counts
    }

    pub fn record(&mut self, category: Category, severity: Severity) {
        self.0.entry(category).or_default().record(severity);
    }

    pub fn set(&mut self, category: Category, counts: SeverityCounts) {
        self.0.insert(category, counts);
    }

    /// Counts for a category; categories with no findings count as zero
    pub fn for_category(&self, category: Category) -> SeverityCounts {
        self.0.get(&category).copied().unwrap_or_default()
    }

    /// Sum over every category
    pub fn total(&self) -> SeverityCounts {
        let mut total = SeverityCounts::default();
        for counts in self.0.values() {
            total.add(counts);
        }
        total
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Category, &SeverityCounts)> {
        self.0.iter()
    }
}
