//! Scanner report parsers
//!
//! Each parser turns one scanner's raw output into canonical [`Finding`]s.
//! Parsers only understand shapes; sentinel and missing-report handling lives
//! in the aggregator.

use crate::core::finding::{Category, Finding, Severity};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Why a report could not be parsed
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected report shape: {0}")]
    Shape(String),

    #[error("unparseable line {line}: {text}")]
    Line { line: usize, text: String },
}

/// Parser for one report format
pub trait ReportParser: Send + Sync {
    /// Format name used in pipeline configuration
    fn format(&self) -> &'static str;

    /// Parse raw report content. Every finding takes the report's category.
    fn parse(&self, content: &str, category: Category) -> Result<Vec<Finding>, ParseError>;
}

/// Parsers keyed by format name
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn ReportParser>>,
}

impl ParserRegistry {
    /// Registry without any parser
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with the built-in formats
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(GenericJsonParser);
        registry.register(BanditParser);
        registry.register(SafetyParser);
        registry.register(PylintJsonParser);
        registry.register(Flake8Parser);
        registry
    }

    /// Add or replace a parser
    pub fn register<P: ReportParser + 'static>(&mut self, parser: P) {
        self.parsers
            .insert(parser.format().to_string(), Arc::new(parser));
    }

    pub fn get(&self, format: &str) -> Option<Arc<dyn ReportParser>> {
        self.parsers.get(format).cloned()
    }

    /// Registered format names, sorted
    pub fn formats(&self) -> Vec<&str> {
        let mut formats: Vec<&str> = self.parsers.keys().map(String::as_str).collect();
        formats.sort_unstable();
        formats
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserRegistry")
            .field("formats", &self.formats())
            .finish()
    }
}

/// Generic JSON: an array of issue objects, or an object holding one under
/// `findings`, `issues`, `results` or `vulnerabilities`.
pub struct GenericJsonParser;

const GENERIC_LIST_KEYS: [&str; 4] = ["findings", "issues", "results", "vulnerabilities"];

impl GenericJsonParser {
    fn entries(value: &Value) -> Result<&Vec<Value>, ParseError> {
        match value {
            Value::Array(items) => Ok(items),
            Value::Object(map) => GENERIC_LIST_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_array))
                .ok_or_else(|| {
                    ParseError::Shape(format!(
                        "expected an array or one of {:?}",
                        GENERIC_LIST_KEYS
                    ))
                }),
            other => Err(ParseError::Shape(format!("expected an array, got {}", kind_of(other)))),
        }
    }

    fn finding(entry: &Value, category: Category) -> Result<Finding, ParseError> {
        let Value::Object(map) = entry else {
            return Err(ParseError::Shape(format!(
                "expected an issue object, got {}",
                kind_of(entry)
            )));
        };

        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|key| map.get(*key).and_then(scalar_text))
        };

        let description = text(&["description", "message", "title", "issue_text", "advisory"])
            .ok_or_else(|| ParseError::Shape("issue without a description".to_string()))?;
        let severity = Severity::normalize(text(&["severity", "level", "issue_severity"]).as_deref());

        let mut finding = Finding::new(category, severity, description);
        if let Some(file) = text(&["file", "filename", "path"]) {
            let line = ["line", "line_number"]
                .iter()
                .find_map(|key| map.get(*key).and_then(line_number));
            finding = finding.at(file, line);
        }
        if let Some(rule) = text(&["rule", "rule_id", "id", "code", "test_id"]) {
            finding = finding.with_rule(rule);
        }
        Ok(finding)
    }
}

impl ReportParser for GenericJsonParser {
    fn format(&self) -> &'static str {
        "generic-json"
    }

    fn parse(&self, content: &str, category: Category) -> Result<Vec<Finding>, ParseError> {
        let value: Value = serde_json::from_str(content)?;
        Self::entries(&value)?
            .iter()
            .map(|entry| Self::finding(entry, category))
            .collect()
    }
}

/// Bandit `-f json` output
pub struct BanditParser;

#[derive(Deserialize)]
struct BanditReport {
    results: Vec<BanditResult>,
}

#[derive(Deserialize)]
struct BanditResult {
    filename: String,
    #[serde(default)]
    line_number: Option<u32>,
    #[serde(default)]
    issue_severity: Option<String>,
    issue_text: String,
    #[serde(default)]
    test_id: Option<String>,
}

impl ReportParser for BanditParser {
    fn format(&self) -> &'static str {
        "bandit"
    }

    fn parse(&self, content: &str, category: Category) -> Result<Vec<Finding>, ParseError> {
        let report: BanditReport = serde_json::from_str(content)?;
        Ok(report
            .results
            .into_iter()
            .map(|result| {
                let mut finding = Finding::new(
                    category,
                    Severity::normalize(result.issue_severity.as_deref()),
                    result.issue_text,
                )
                .at(result.filename, result.line_number);
                if let Some(test_id) = result.test_id {
                    finding = finding.with_rule(test_id);
                }
                finding
            })
            .collect())
    }
}

/// Safety `check --json` output, both the legacy list-of-lists shape and the
/// `vulnerabilities` object shape.
pub struct SafetyParser;

impl SafetyParser {
    fn legacy_entry(entry: &Value, category: Category) -> Result<Finding, ParseError> {
        let fields = entry
            .as_array()
            .ok_or_else(|| ParseError::Shape("legacy entry is not a list".to_string()))?;
        if fields.len() < 4 {
            return Err(ParseError::Shape(format!(
                "legacy entry has {} fields, expected at least 4",
                fields.len()
            )));
        }
        let field = |i: usize| fields.get(i).and_then(scalar_text).unwrap_or_default();

        let description = format!("{} {}: {}", field(0), field(2), field(3));
        let mut finding = Finding::new(category, Severity::Medium, description);
        if let Some(id) = fields.get(4).and_then(scalar_text) {
            finding = finding.with_rule(id);
        }
        Ok(finding)
    }

    fn vulnerability(entry: &Value, category: Category) -> Result<Finding, ParseError> {
        let map = entry
            .as_object()
            .ok_or_else(|| ParseError::Shape("vulnerability is not an object".to_string()))?;
        let text = |key: &str| map.get(key).and_then(scalar_text);

        let package = text("package_name")
            .ok_or_else(|| ParseError::Shape("vulnerability without package_name".to_string()))?;
        let advisory = text("advisory").unwrap_or_else(|| "known vulnerability".to_string());
        let installed = text("analyzed_version").unwrap_or_default();

        let severity = match map.get("severity") {
            Some(Value::String(raw)) => Severity::normalize(Some(raw)),
            Some(Value::Object(scores)) => Severity::normalize(
                ["cvssv3", "cvssv2"]
                    .iter()
                    .find_map(|key| scores.get(*key)?.get("base_severity")?.as_str()),
            ),
            _ => Severity::Medium,
        };

        let mut finding = Finding::new(
            category,
            severity,
            format!("{} {}: {}", package, installed, advisory).replace("  ", " "),
        );
        if let Some(id) = text("vulnerability_id").or_else(|| text("CVE")) {
            finding = finding.with_rule(id);
        }
        Ok(finding)
    }
}

impl ReportParser for SafetyParser {
    fn format(&self) -> &'static str {
        "safety"
    }

    fn parse(&self, content: &str, category: Category) -> Result<Vec<Finding>, ParseError> {
        let value: Value = serde_json::from_str(content)?;
        match &value {
            Value::Array(entries) => entries
                .iter()
                .map(|entry| Self::legacy_entry(entry, category))
                .collect(),
            Value::Object(map) => match map.get("vulnerabilities") {
                Some(Value::Array(entries)) => entries
                    .iter()
                    .map(|entry| Self::vulnerability(entry, category))
                    .collect(),
                _ => Err(ParseError::Shape("missing 'vulnerabilities' list".to_string())),
            },
            other => Err(ParseError::Shape(format!("expected a list or object, got {}", kind_of(other)))),
        }
    }
}

/// Pylint `--output-format=json` output
pub struct PylintJsonParser;

#[derive(Deserialize)]
struct PylintMessage {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    line: Option<u32>,
    message: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default, rename = "message-id")]
    message_id: Option<String>,
}

impl ReportParser for PylintJsonParser {
    fn format(&self) -> &'static str {
        "pylint-json"
    }

    fn parse(&self, content: &str, category: Category) -> Result<Vec<Finding>, ParseError> {
        let messages: Vec<PylintMessage> = serde_json::from_str(content)?;
        Ok(messages
            .into_iter()
            .map(|message| {
                let mut finding =
                    Finding::new(category, Severity::normalize(Some(&message.kind)), message.message)
                        .at(message.path, message.line);
                if let Some(rule) = message.message_id.or(message.symbol) {
                    finding = finding.with_rule(rule);
                }
                finding
            })
            .collect())
    }
}

/// Flake8 default text output: `path:line:col: CODE message`
pub struct Flake8Parser;

fn flake8_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<file>.+?):(?P<line>\d+):(?:\d+:)?\s*(?P<code>[A-Z]+\d+)\s+(?P<message>.*)$")
            .expect("flake8 pattern is valid")
    })
}

impl Flake8Parser {
    /// Syntax errors and undefined names break at runtime; style and
    /// complexity codes do not.
    fn severity(code: &str) -> Severity {
        const FATAL: [&str; 4] = ["E9", "F63", "F7", "F82"];
        if FATAL.iter().any(|prefix| code.starts_with(prefix)) {
            Severity::High
        } else if code.starts_with('W') || code.starts_with('C') {
            Severity::Low
        } else {
            Severity::Medium
        }
    }
}

impl ReportParser for Flake8Parser {
    fn format(&self) -> &'static str {
        "flake8"
    }

    fn parse(&self, content: &str, category: Category) -> Result<Vec<Finding>, ParseError> {
        let mut findings = Vec::new();
        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            // `--count` appends a bare total
            if line.is_empty() || line.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let captures = flake8_line().captures(line).ok_or_else(|| ParseError::Line {
                line: index + 1,
                text: line.to_string(),
            })?;

            let code = &captures["code"];
            findings.push(
                Finding::new(category, Self::severity(code), captures["message"].trim())
                    .at(&captures["file"], captures["line"].parse().ok())
                    .with_rule(code),
            );
        }
        Ok(findings)
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn line_number(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
