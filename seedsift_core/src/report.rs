use crate::executor::ExitClass;
use crate::oracle::Finding;
use crate::selector::Transition;
use serde::Serialize;

/// Why a library's curation loop stopped taking new candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    #[default]
    Exhausted,
    Converged,
    Budget,
    Stopped,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Exhausted => "exhausted",
            StopReason::Converged => "converged",
            StopReason::Budget => "budget",
            StopReason::Stopped => "stopped",
        }
    }
}

/// Per-library counts for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LibraryReport {
    pub library: String,
    pub processed: u64,
    pub admitted: u64,
    pub rejected: u64,
    /// Seeds retired by a `Replace`.
    pub replaced: u64,
    pub successes: u64,
    pub compile_errors: u64,
    pub crashes: u64,
    pub timeouts: u64,
    pub non_zero: u64,
    pub infra_errors: u64,
    pub generator_errors: u64,
    pub lifecycle_flags: u64,
    pub revalidations: u64,
    pub restored_anchors: u64,
    pub corpus_size: usize,
    pub covered_sites: usize,
    pub aggregate_density: Option<f64>,
    pub stop_reason: StopReason,
    pub warnings: Vec<String>,
    pub findings: Vec<Finding>,
}

impl LibraryReport {
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            ..Self::default()
        }
    }

    pub fn record_exit(&mut self, exit: &ExitClass) {
        match exit {
            ExitClass::Success => self.successes += 1,
            ExitClass::NonZero(_) => self.non_zero += 1,
            ExitClass::Crash { .. } => self.crashes += 1,
            ExitClass::Timeout => self.timeouts += 1,
            ExitClass::CompileError(_) => self.compile_errors += 1,
        }
    }

    pub fn record_transition(&mut self, transition: &Transition) {
        match transition {
            Transition::Rejected => self.rejected += 1,
            Transition::Admitted { replaced, .. } => {
                self.admitted += 1;
                self.replaced += replaced.len() as u64;
            }
        }
    }

    pub fn record_finding(&mut self, finding: Finding) {
        if finding.lifecycle_misuse {
            self.lifecycle_flags += 1;
        }
        self.findings.push(finding);
    }

    pub fn warn(&mut self, message: String) {
        log::warn!("{}: {}", self.library, message);
        self.warnings.push(message);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunReport {
    pub elapsed_ms: u64,
    pub libraries: Vec<LibraryReport>,
}

impl RunReport {
    pub fn library(&self, name: &str) -> Option<&LibraryReport> {
        self.libraries.iter().find(|l| l.library == name)
    }

    pub fn total_admitted(&self) -> u64 {
        self.libraries.iter().map(|l| l.admitted).sum()
    }

    pub fn total_findings(&self) -> usize {
        self.libraries.iter().map(|l| l.findings.len()).sum()
    }

    pub fn has_warnings(&self) -> bool {
        self.libraries.iter().any(|l| !l.warnings.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontier::{SeedRole, StableId};

    #[test]
    fn counts_exits_and_transitions() {
        let mut report = LibraryReport::new("zlib");
        report.record_exit(&ExitClass::Success);
        report.record_exit(&ExitClass::CompileError("boom".into()));
        report.record_exit(&ExitClass::Crash {
            signal: Some(11),
            code: None,
        });
        report.record_transition(&Transition::Rejected);
        report.record_transition(&Transition::Admitted {
            id: StableId(3),
            role: SeedRole::Coverage,
            replaced: vec![StableId(0), StableId(1)],
        });
        assert_eq!(
            (report.successes, report.compile_errors, report.crashes),
            (1, 1, 1)
        );
        assert_eq!((report.admitted, report.rejected, report.replaced), (1, 1, 2));

        let run = RunReport {
            elapsed_ms: 5,
            libraries: vec![report],
        };
        assert_eq!(run.total_admitted(), 1);
        assert!(run.library("zlib").is_some());
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["libraries"][0]["compile-errors"], 1);
        assert_eq!(json["libraries"][0]["stop-reason"], "exhausted");
    }
}
