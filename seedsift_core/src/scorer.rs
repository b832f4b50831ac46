use crate::candidate::ContentHash;
use crate::config::ScoringSettings;
use crate::executor::ExecutionResult;
use crate::library::LibraryProfile;
use crate::observer::BranchSite;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Structured quality annotation of one execution, embedded in the seed header.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct QualityRecord {
    pub density: f64,
    #[serde(default = "density_known_default")]
    pub density_known: bool,
    pub unique_branches: BTreeMap<BranchSite, u64>,
    pub library_calls: Vec<String>,
    pub critical_calls: Vec<String>,
    pub visited: u64,
}

fn density_known_default() -> bool {
    true
}

impl QualityRecord {
    pub fn branch_set(&self) -> BTreeSet<BranchSite> {
        self.unique_branches.keys().cloned().collect()
    }

    pub fn covers(&self, site: &str) -> bool {
        self.unique_branches.contains_key(site)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub density: f64,
    pub novelty: f64,
    pub staleness: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        ScoringSettings::default().into()
    }
}

impl From<ScoringSettings> for ScoreWeights {
    fn from(settings: ScoringSettings) -> Self {
        Self {
            density: settings.density_weight,
            novelty: settings.novelty_weight,
            staleness: settings.staleness_weight,
        }
    }
}

/// Turns execution results into quality records and scalar scores.
///
/// Both operations are pure: the same result, profile, visit count and
/// novelty always give the same output.
#[derive(Debug, Clone)]
pub struct Scorer {
    profile: LibraryProfile,
    weights: ScoreWeights,
}

impl Scorer {
    pub fn new(profile: LibraryProfile, weights: ScoreWeights) -> Self {
        Self { profile, weights }
    }

    pub fn profile(&self) -> &LibraryProfile {
        &self.profile
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    pub fn score(&self, result: &ExecutionResult, visited: u64) -> QualityRecord {
        let trace = result.trace();
        let unique_branches = trace.branch_hits();

        let symbols = &self.profile.symbols;
        let library_calls: Vec<String> = trace
            .calls()
            .into_iter()
            .filter(|call| symbols.is_empty() || symbols.contains(call))
            .collect();
        let critical_calls: Vec<String> = library_calls
            .iter()
            .filter(|call| self.profile.policy.is_critical(call))
            .cloned()
            .collect();

        let (density, density_known) = match self.profile.total_branch_sites {
            Some(total) if total > 0 => (unique_branches.len() as f64 / total as f64, true),
            _ => (0.0, false),
        };

        QualityRecord {
            density,
            density_known,
            unique_branches,
            library_calls,
            critical_calls,
            visited,
        }
    }

    /// Scalar score given how many of the record's sites are new to the
    /// frontier.
    pub fn rank(&self, quality: &QualityRecord, novel: usize) -> f64 {
        let w = &self.weights;
        w.density * quality.density + w.novelty * (novel as f64).ln_1p()
            - w.staleness * (quality.visited as f64).ln_1p()
    }
}

/// How often each distinct harness (by content hash) has been scored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VisitLedger {
    counts: BTreeMap<ContentHash, u64>,
}

impl VisitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a visit and returns how many times the hash was seen before.
    pub fn visit(&mut self, hash: ContentHash) -> u64 {
        let count = self.counts.entry(hash).or_insert(0);
        let before = *count;
        *count += 1;
        before
    }

    pub fn get(&self, hash: &ContentHash) -> u64 {
        self.counts.get(hash).copied().unwrap_or(0)
    }

    /// Keeps the larger of the stored and restored count.
    pub fn restore(&mut self, hash: ContentHash, count: u64) {
        let entry = self.counts.entry(hash).or_insert(0);
        *entry = (*entry).max(count);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContentHash, &u64)> {
        self.counts.iter()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}
