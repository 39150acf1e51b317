//! Run reporting
//!
//! A [`Reporter`] is created at the start of a run and handed to every
//! phase. It owns the run span, opens one child span per phase and records
//! how each phase ended, so the end-of-run summary is built from what the
//! phases actually reported rather than from global state.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info, info_span, warn, Span};
use uuid::Uuid;

/// The phases of one run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SpecUpdate,
    Join,
    Summarise,
    Unload,
    Sync,
    Transport,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecUpdate => "spec_update",
            Self::Join => "join",
            Self::Summarise => "summarise",
            Self::Unload => "unload",
            Self::Sync => "sync",
            Self::Transport => "transport",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a phase ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PhaseOutcome {
    Completed { detail: String },
    /// Not run: disabled, or a precondition failed elsewhere
    Skipped { reason: String },
    Failed { cause: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    #[serde(flatten)]
    pub outcome: PhaseOutcome,
}

/// Everything a run reported, returned by [`Reporter::finish`].
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub phases: Vec<PhaseRecord>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl RunReport {
    pub fn outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.phases
            .iter()
            .rev()
            .find(|r| r.phase == phase)
            .map(|r| &r.outcome)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PhaseRecord> {
        self.phases
            .iter()
            .filter(|r| matches!(r.outcome, PhaseOutcome::Failed { .. }))
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

pub struct Reporter {
    run_id: Uuid,
    span: Span,
    started: Instant,
    phases: Vec<PhaseRecord>,
}

impl Reporter {
    pub fn start() -> Self {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        span.in_scope(|| info!("Starting accounting run"));
        Self {
            run_id,
            span,
            started: Instant::now(),
            phases: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Child span for one phase; enter it while the phase runs.
    pub fn phase_span(&self, phase: Phase) -> Span {
        info_span!(parent: &self.span, "phase", phase = phase.as_str())
    }

    pub fn completed(&mut self, phase: Phase, detail: impl Into<String>) {
        let detail = detail.into();
        self.span
            .in_scope(|| info!(phase = phase.as_str(), "Phase completed: {}", detail));
        self.record(phase, PhaseOutcome::Completed { detail });
    }

    pub fn skipped(&mut self, phase: Phase, reason: impl Into<String>) {
        let reason = reason.into();
        self.span
            .in_scope(|| info!(phase = phase.as_str(), "Phase skipped: {}", reason));
        self.record(phase, PhaseOutcome::Skipped { reason });
    }

    pub fn failed(&mut self, phase: Phase, cause: &dyn fmt::Display) {
        let cause = cause.to_string();
        self.span
            .in_scope(|| error!(phase = phase.as_str(), "Phase failed: {}", cause));
        self.record(phase, PhaseOutcome::Failed { cause });
    }

    fn record(&mut self, phase: Phase, outcome: PhaseOutcome) {
        self.phases.push(PhaseRecord { phase, outcome });
    }

    /// Close the run and log a one-line summary.
    pub fn finish(self) -> RunReport {
        let report = RunReport {
            run_id: self.run_id,
            phases: self.phases,
            elapsed: self.started.elapsed(),
        };
        let failures = report.failed().count();
        self.span.in_scope(|| {
            if failures == 0 {
                info!(
                    "Run complete in {:?} ({} phases reported)",
                    report.elapsed,
                    report.phases.len()
                );
            } else {
                let names: Vec<&str> = report.failed().map(|r| r.phase.as_str()).collect();
                warn!(
                    "Run complete in {:?} with {} failed phase(s): {}",
                    report.elapsed,
                    failures,
                    names.join(", ")
                );
            }
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_keeps_phase_order_and_latest_outcome() {
        let mut reporter = Reporter::start();
        reporter.completed(Phase::Join, "3 submissions");
        reporter.failed(Phase::Unload, &"unrecognised interval: weekly");
        reporter.completed(Phase::Sync, "1 message");
        reporter.skipped(Phase::Transport, "sender disabled");

        let report = reporter.finish();
        let order: Vec<Phase> = report.phases.iter().map(|r| r.phase).collect();
        assert_eq!(
            order,
            vec![Phase::Join, Phase::Unload, Phase::Sync, Phase::Transport]
        );
        assert_eq!(report.failed().count(), 1);
        assert!(matches!(
            report.outcome(Phase::Transport),
            Some(PhaseOutcome::Skipped { .. })
        ));
        assert_eq!(report.outcome(Phase::SpecUpdate), None);
    }

    #[test]
    fn test_report_serializes_flat() {
        let mut reporter = Reporter::start();
        reporter.completed(Phase::Summarise, "2 rows");
        let json = serde_json::to_value(reporter.finish()).unwrap();
        assert_eq!(json["phases"][0]["phase"], "summarise");
        assert_eq!(json["phases"][0]["status"], "completed");
        assert_eq!(json["phases"][0]["detail"], "2 rows");
    }
}
