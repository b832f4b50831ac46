use crate::candidate::{CandidateId, ContentHash};
use crate::executor::{ExecutionResult, ExitClass};
use crate::library::CriticalCallPolicy;
use crate::scorer::QualityRecord;
use serde::Serialize;

const CRASH_SEVERITY: u8 = 10;
const LIFECYCLE_CRASH_SEVERITY: u8 = 12;
const TIMEOUT_SEVERITY: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FindingKind {
    RuntimeCrash,
    Timeout,
}

/// A candidate-level failure worth reporting. Partial coverage of the run has
/// already been scored; the finding only describes what went wrong.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Finding {
    pub kind: FindingKind,
    pub candidate_id: CandidateId,
    pub hash: ContentHash,
    pub description: String,
    /// Critical calls that had not returned when the run ended.
    pub in_progress: Vec<String>,
    /// Acquire calls that were never followed by a release.
    pub unreleased: Vec<String>,
    pub lifecycle_misuse: bool,
    pub severity: u8,
}

/// Examines a finished execution and reports a finding when something went
/// wrong.
pub trait Oracle: Send + Sync {
    fn examine(&self, result: &ExecutionResult, quality: &QualityRecord) -> Option<Finding>;
}

/// Reports crashes and timeouts, flagging crashes that happened mid-way
/// through a resource lifecycle.
#[derive(Debug, Clone, Default)]
pub struct LifecycleOracle {
    policy: CriticalCallPolicy,
}

impl LifecycleOracle {
    pub fn new(policy: CriticalCallPolicy) -> Self {
        Self { policy }
    }
}

impl Oracle for LifecycleOracle {
    fn examine(&self, result: &ExecutionResult, quality: &QualityRecord) -> Option<Finding> {
        let kind = match result.exit() {
            ExitClass::Crash { .. } => FindingKind::RuntimeCrash,
            ExitClass::Timeout => FindingKind::Timeout,
            _ => return None,
        };

        let in_progress: Vec<String> = result
            .trace()
            .in_progress()
            .into_iter()
            .filter(|call| self.policy.is_critical(call))
            .collect();
        let unreleased = self.policy.unmatched_acquires(&quality.critical_calls);
        let lifecycle_misuse =
            kind == FindingKind::RuntimeCrash && (!in_progress.is_empty() || !unreleased.is_empty());

        let mut description = match result.exit() {
            ExitClass::Crash {
                signal: Some(signal),
                ..
            } => format!("terminated by signal {signal}"),
            ExitClass::Crash {
                code: Some(code), ..
            } => format!("sanitizer exit code {code}"),
            ExitClass::Crash { .. } => "exited abnormally".to_string(),
            _ => format!("timed out after {:?}", result.duration()),
        };
        if lifecycle_misuse {
            description.push_str(&format!(
                "; lifecycle misuse (in progress: [{}], unreleased: [{}])",
                in_progress.join(", "),
                unreleased.join(", ")
            ));
        }
        if let Some(line) = result.stderr_tail().lines().find(|l| l.contains("ERROR:")) {
            description.push_str(&format!("; {}", line.trim()));
        }

        let severity = match (kind, lifecycle_misuse) {
            (FindingKind::RuntimeCrash, true) => LIFECYCLE_CRASH_SEVERITY,
            (FindingKind::RuntimeCrash, false) => CRASH_SEVERITY,
            (FindingKind::Timeout, _) => TIMEOUT_SEVERITY,
        };

        Some(Finding {
            kind,
            candidate_id: result.candidate_id(),
            hash: result.hash(),
            description,
            in_progress,
            unreleased,
            lifecycle_misuse,
            severity,
        })
    }
}
