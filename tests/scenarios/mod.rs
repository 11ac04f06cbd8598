//! Scenario-based tests for release-pipeline

mod blue_green_release;
mod gate_decisions;
mod pipeline_timeout;
mod stage_ordering;
