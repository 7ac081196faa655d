//! Scenario report.
//!
//! Accumulated by the orchestrator while a scenario runs and rendered to
//! `report.txt` during cleanup, whether the scenario passed or not.

use crate::measurement::Measurement;
use crate::types::{Mode, OsFamily};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

/// One timeline entry (`BUILD`, `START`, `READY`, `STOP`, ...).
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    /// Iteration label, empty for scenario-level steps.
    pub iteration: String,
    pub duration_ms: Option<u64>,
    pub message: String,
}

impl StepRecord {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: kind.into(),
            iteration: String::new(),
            duration_ms: None,
            message: String::new(),
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration.to_string();
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    fn to_line(&self) -> String {
        let duration = self
            .duration_ms
            .map(|d| format!("{d}ms"))
            .unwrap_or_default();
        format!(
            "{}  {:<10} {:>4} {:>9}  {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.kind,
            self.iteration,
            duration,
            sanitize(&self.message),
        )
    }
}

/// Collapse line breaks so one step stays one line.
fn sanitize(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// Final state of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Running,
    Passed,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
        }
    }
}

/// Everything needed to reconstruct what a scenario did.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub app: String,
    pub mode: Mode,
    pub os: OsFamily,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Outcome,
    pub error: Option<String>,
    /// Commands as run, space-joined.
    pub commands: Vec<String>,
    pub steps: Vec<StepRecord>,
    #[serde(skip)]
    pub measurements: Vec<Measurement>,
    pub trimmed_rss_kb: Option<i64>,
    pub trimmed_time_to_first_ok_request_ms: Option<i64>,
    /// Where the logs were archived, once cleanup has run.
    pub archive: Option<String>,
}

impl ScenarioReport {
    pub fn new(app: impl Into<String>, mode: Mode, os: OsFamily) -> Self {
        Self {
            app: app.into(),
            mode,
            os,
            started_at: Utc::now(),
            finished_at: None,
            outcome: Outcome::Running,
            error: None,
            commands: Vec::new(),
            steps: Vec::new(),
            measurements: Vec::new(),
            trimmed_rss_kb: None,
            trimmed_time_to_first_ok_request_ms: None,
            archive: None,
        }
    }

    pub fn step(&mut self, step: StepRecord) {
        self.steps.push(step);
    }

    pub fn command(&mut self, display: impl Into<String>) {
        self.commands.push(display.into());
    }

    pub fn finish(&mut self, error: Option<String>) {
        self.finished_at = Some(Utc::now());
        self.outcome = if error.is_some() {
            Outcome::Failed
        } else {
            Outcome::Passed
        };
        self.error = error;
    }

    /// Plain-text rendering for `report.txt`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Scenario: {} ({}) on {}", self.app, self.mode, self.os);
        let _ = writeln!(out, "Started:  {}", self.started_at.to_rfc3339());
        if let Some(finished) = self.finished_at {
            let _ = writeln!(out, "Finished: {}", finished.to_rfc3339());
        }
        let _ = writeln!(out, "Outcome:  {}", self.outcome.as_str());
        if let Some(error) = &self.error {
            let _ = writeln!(out, "\nFailure:\n{error}");
        }

        if !self.commands.is_empty() {
            out.push_str("\nCommands:\n");
            for command in &self.commands {
                let _ = writeln!(out, "  {command}");
            }
        }

        if !self.steps.is_empty() {
            out.push_str("\nTimeline:\n");
            for step in &self.steps {
                let _ = writeln!(out, "  {}", step.to_line());
            }
        }

        if let Some(first) = self.measurements.first() {
            out.push_str("\nMeasurements:\n");
            let _ = writeln!(out, "{}", first.header_markdown());
            let _ = writeln!(out, "{}", first.divider_markdown());
            for m in &self.measurements {
                let _ = writeln!(out, "{}", m.line_markdown());
            }
        }

        if self.trimmed_rss_kb.is_some() || self.trimmed_time_to_first_ok_request_ms.is_some() {
            out.push_str("\nTrimmed means:\n");
            if let Some(rss) = self.trimmed_rss_kb {
                let _ = writeln!(out, "  RSSKb: {rss}");
            }
            if let Some(ttfr) = self.trimmed_time_to_first_ok_request_ms {
                let _ = writeln!(out, "  timeToFirstOKRequestMs: {ttfr}");
            }
        }

        out
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.render())
    }
}
