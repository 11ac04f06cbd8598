//! Finding aggregator
//!
//! Turns raw scanner reports into one sorted list of canonical findings plus
//! per-category severity counts. A report that is missing, empty or
//! unreadable contributes zero findings and, where something was actually
//! wrong, a warning. Aggregation itself never fails.

pub mod gate;
pub mod parsers;

pub use gate::evaluate_gate;
pub use parsers::{ParseError, ParserRegistry, ReportParser};

use crate::core::finding::{CategoryCounts, Finding};
use crate::core::stage::{ReportSource, ScannerOutput};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::{debug, warn};

/// Content scanners emit when they found nothing
const NO_ISSUE_SENTINELS: [&str; 7] = ["", "[]", "{}", "null", "no issues", "no issues found", "none"];

/// Aggregated findings for one stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub findings: Vec<Finding>,
    pub counts: CategoryCounts,
    pub warnings: Vec<String>,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Aggregate every report. Output order does not depend on report order.
pub fn aggregate(reports: &[ScannerOutput], registry: &ParserRegistry) -> Aggregation {
    let mut aggregation = Aggregation::default();

    for report in reports {
        match parse_report(report, registry) {
            Ok(findings) => {
                debug!(report = %report.describe(), count = findings.len(), "parsed scanner report");
                aggregation.findings.extend(findings);
            }
            Err(warning) => {
                warn!(report = %report.describe(), %warning, "scanner report ignored");
                aggregation.warnings.push(warning);
            }
        }
    }

    aggregation.findings.sort_by(|a, b| {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.scanner.cmp(&b.scanner))
    });
    aggregation.counts = CategoryCounts::from_findings(&aggregation.findings);
    aggregation
}

/// Findings of one report, or the warning explaining why it has none
fn parse_report(report: &ScannerOutput, registry: &ParserRegistry) -> Result<Vec<Finding>, String> {
    let content: Cow<'_, str> = match &report.source {
        ReportSource::Inline(content) => Cow::Borrowed(content),
        ReportSource::File(path) => match std::fs::read_to_string(path) {
            Ok(content) => Cow::Owned(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(format!("{}: report not found", report.describe()));
            }
            Err(e) => return Err(format!("{}: cannot read report: {}", report.describe(), e)),
        },
    };

    if is_no_issue_sentinel(&content) {
        return Ok(Vec::new());
    }

    let parser = registry.get(&report.format).ok_or_else(|| {
        format!(
            "{}: unknown report format '{}' (known: {})",
            report.describe(),
            report.format,
            registry.formats().join(", ")
        )
    })?;

    let scanner = report
        .scanner
        .clone()
        .unwrap_or_else(|| report.format.clone());

    parser
        .parse(&content, report.category)
        .map(|findings| {
            findings
                .into_iter()
                .map(|mut finding| {
                    finding.scanner = Some(scanner.clone());
                    finding
                })
                .collect()
        })
        .map_err(|e| format!("{}: malformed report: {}", report.describe(), e))
}

fn is_no_issue_sentinel(content: &str) -> bool {
    let normalized = content.trim().trim_end_matches('.').to_ascii_lowercase();
    NO_ISSUE_SENTINELS.contains(&normalized.as_str())
}
