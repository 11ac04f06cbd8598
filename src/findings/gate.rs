//! Severity-count gate evaluation

use crate::core::finding::{Category, CategoryCounts, Severity, SeverityCounts};
use crate::core::policy::{
    Breach, Enforcement, GateDecision, GateEvaluation, GatePolicy, SeverityThresholds,
};

const SEVERITIES: [Severity; 3] = [Severity::High, Severity::Medium, Severity::Low];

/// Compare counts against a policy.
///
/// Any hard breach fails the gate, any soft breach makes it unstable. The
/// result depends only on `counts` and `policy`.
pub fn evaluate_gate(gate: &str, counts: &CategoryCounts, policy: &GatePolicy) -> GateEvaluation {
    if !policy.enabled {
        return GateEvaluation {
            gate: gate.to_string(),
            decision: GateDecision::Pass,
            breaches: Vec::new(),
        };
    }

    let mut breaches = Vec::new();
    for (category, thresholds) in &policy.thresholds {
        collect_breaches(
            Some(*category),
            thresholds,
            counts.for_category(*category),
            &mut breaches,
        );
    }
    if let Some(total) = &policy.total {
        collect_breaches(None, total, counts.total(), &mut breaches);
    }

    let decision = if breaches.iter().any(|b| b.enforcement == Enforcement::Hard) {
        GateDecision::Fail
    } else if !breaches.is_empty() {
        GateDecision::Unstable
    } else {
        GateDecision::Pass
    };

    GateEvaluation {
        gate: gate.to_string(),
        decision,
        breaches,
    }
}

fn collect_breaches(
    category: Option<Category>,
    thresholds: &SeverityThresholds,
    counts: SeverityCounts,
    breaches: &mut Vec<Breach>,
) {
    for severity in SEVERITIES {
        let Some(threshold) = thresholds.get(severity) else {
            continue;
        };
        let count = counts.get(severity);
        if count > threshold.max {
            breaches.push(Breach {
                category,
                severity,
                count,
                max: threshold.max,
                enforcement: threshold.enforcement,
            });
        }
    }
}
