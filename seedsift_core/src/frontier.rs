use crate::candidate::{Candidate, CandidateId, ContentHash, Origin};
use crate::observer::BranchSite;
use crate::scorer::QualityRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Library-scoped identifier of a persisted seed, rendered as `id_000042`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(pub u64);

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id_{:06}", self.0)
    }
}

/// Why a seed is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SeedRole {
    /// Kept for the branch sites it owns.
    Coverage,
    /// Only seed observed for its critical-call order.
    Lifecycle,
    /// First seed of its origin tag.
    Diversity,
    /// Restored by re-validation to keep a site reachable.
    RegressionAnchor,
}

impl SeedRole {
    /// Anchors are retained even when they own no branch site.
    pub fn is_anchor(&self) -> bool {
        !matches!(self, SeedRole::Coverage)
    }
}

/// A candidate accepted by the selector, ready to be written.
#[derive(Debug, Clone)]
pub struct AdmittedSeed {
    pub candidate: Candidate,
    pub quality: QualityRecord,
    pub score: f64,
    pub role: SeedRole,
}

/// The frontier's view of one seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SeedEntry {
    pub stable_id: StableId,
    pub candidate_id: CandidateId,
    pub hash: ContentHash,
    pub origin: Origin,
    pub role: SeedRole,
    pub score: f64,
    pub quality: QualityRecord,
    pub critical_pattern: Vec<String>,
}

impl SeedEntry {
    /// Tie-break order between seeds or candidates covering the same number
    /// of sites: higher score, then fewer library calls, then earlier id.
    pub fn tie_break(a: (f64, usize, CandidateId), b: (f64, usize, CandidateId)) -> Ordering {
        b.0.total_cmp(&a.0)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    }

    pub fn tie_key(&self) -> (f64, usize, CandidateId) {
        (
            self.score,
            self.quality.library_calls.len(),
            self.candidate_id,
        )
    }
}

/// Per-library union of covered branch sites and the seed owning each.
///
/// Only the selector changes a frontier. Within a run the covered set only
/// grows, and every owner is an active seed.
#[derive(Debug, Clone, Default)]
pub struct Frontier {
    library: String,
    total_branch_sites: Option<u64>,
    owners: BTreeMap<BranchSite, StableId>,
    seeds: BTreeMap<StableId, SeedEntry>,
    retired: BTreeMap<StableId, SeedEntry>,
    patterns: BTreeSet<Vec<String>>,
    origins: BTreeSet<Origin>,
}

impl Frontier {
    pub fn new(library: impl Into<String>, total_branch_sites: Option<u64>) -> Self {
        Self {
            library: library.into(),
            total_branch_sites,
            ..Self::default()
        }
    }

    /// Rebuilds a frontier from persisted entries. Each covered site goes to
    /// the best active coverer under the tie-break order.
    ///
    /// # Arguments
    ///
    /// * `library` - name of the library the entries belong to.
    /// * `total_branch_sites` - size of the instrumented build, when known.
    /// * `active` - seeds that own sites.
    /// * `retired` - seeds kept for re-validation only. They own nothing.
    pub fn restore(
        library: impl Into<String>,
        total_branch_sites: Option<u64>,
        active: impl IntoIterator<Item = SeedEntry>,
        retired: impl IntoIterator<Item = SeedEntry>,
    ) -> Self {
        let mut frontier = Self::new(library, total_branch_sites);
        for entry in active {
            frontier.register(&entry);
            frontier.seeds.insert(entry.stable_id, entry);
        }
        frontier.retired = retired.into_iter().map(|e| (e.stable_id, e)).collect();

        let mut best: BTreeMap<BranchSite, &SeedEntry> = BTreeMap::new();
        for entry in frontier.seeds.values() {
            for site in entry.quality.unique_branches.keys() {
                match best.get(site) {
                    Some(current)
                        if SeedEntry::tie_break(current.tie_key(), entry.tie_key())
                            != Ordering::Greater => {}
                    _ => {
                        best.insert(site.clone(), entry);
                    }
                }
            }
        }
        frontier.owners = best
            .into_iter()
            .map(|(site, entry)| (site, entry.stable_id))
            .collect();
        frontier
    }

    fn register(&mut self, entry: &SeedEntry) {
        if !entry.critical_pattern.is_empty() {
            self.patterns.insert(entry.critical_pattern.clone());
        }
        self.origins.insert(entry.origin.clone());
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    pub fn covered(&self) -> usize {
        self.owners.len()
    }

    pub fn is_covered(&self, site: &str) -> bool {
        self.owners.contains_key(site)
    }

    pub fn covered_sites(&self) -> impl Iterator<Item = &BranchSite> {
        self.owners.keys()
    }

    pub fn owner(&self, site: &str) -> Option<StableId> {
        self.owners.get(site).copied()
    }

    pub fn seed(&self, id: StableId) -> Option<&SeedEntry> {
        self.seeds.get(&id)
    }

    pub fn seeds(&self) -> impl Iterator<Item = &SeedEntry> {
        self.seeds.values()
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn retired(&self) -> impl Iterator<Item = &SeedEntry> {
        self.retired.values()
    }

    pub fn retired_seed(&self, id: StableId) -> Option<&SeedEntry> {
        self.retired.get(&id)
    }

    pub fn owned_by(&self, id: StableId) -> BTreeSet<BranchSite> {
        self.owners
            .iter()
            .filter(|(_, owner)| **owner == id)
            .map(|(site, _)| site.clone())
            .collect()
    }

    /// Sites in `quality` no seed covers yet, in site order.
    pub fn novel_sites(&self, quality: &QualityRecord) -> Vec<BranchSite> {
        quality
            .unique_branches
            .keys()
            .filter(|site| !self.owners.contains_key(*site))
            .cloned()
            .collect()
    }

    pub fn has_pattern(&self, pattern: &[String]) -> bool {
        self.patterns.contains(pattern)
    }

    pub fn has_origin(&self, origin: &Origin) -> bool {
        self.origins.contains(origin)
    }

    pub fn aggregate_density(&self) -> Option<f64> {
        match self.total_branch_sites {
            Some(total) if total > 0 => Some(self.owners.len() as f64 / total as f64),
            _ => None,
        }
    }

    /// Inserts a seed, hands it `claimed` sites and retires `victims`.
    pub(crate) fn admit(&mut self, entry: SeedEntry, claimed: &[BranchSite], victims: &[StableId]) {
        let id = entry.stable_id;
        self.register(&entry);
        self.retired.remove(&id);
        self.seeds.insert(id, entry);
        for site in claimed {
            self.owners.insert(site.clone(), id);
        }
        for victim in victims {
            if let Some(old) = self.seeds.remove(victim) {
                debug_assert!(
                    !self.owners.values().any(|owner| owner == victim),
                    "retired seed {victim} still owns sites"
                );
                self.retired.insert(*victim, old);
            }
        }
    }

    /// Moves ownership of `site` to an active seed.
    pub(crate) fn reassign(&mut self, site: &str, to: StableId) {
        debug_assert!(self.seeds.contains_key(&to));
        if let Some(owner) = self.owners.get_mut(site) {
            *owner = to;
        }
    }

    /// Brings a retired seed back as an active seed with `role`.
    pub(crate) fn reinstate(&mut self, id: StableId, role: SeedRole) -> bool {
        match self.retired.remove(&id) {
            Some(mut entry) => {
                entry.role = role;
                self.register(&entry);
                self.seeds.insert(id, entry);
                true
            }
            None => false,
        }
    }

    /// Replaces the recorded quality of an active or retired seed. Ownership
    /// is left alone.
    pub(crate) fn refresh(&mut self, id: StableId, quality: QualityRecord) -> bool {
        match self.seeds.get_mut(&id).or_else(|| self.retired.get_mut(&id)) {
            Some(entry) => {
                entry.quality = quality;
                true
            }
            None => false,
        }
    }

    /// Summary handed to generators: coverage, call frequency across active
    /// seeds, origins and lifecycle patterns seen so far.
    pub fn snapshot(&self) -> FrontierSnapshot {
        let mut call_frequency: BTreeMap<String, u64> = BTreeMap::new();
        for entry in self.seeds.values() {
            let distinct: BTreeSet<&String> = entry.quality.library_calls.iter().collect();
            for call in distinct {
                *call_frequency.entry(call.clone()).or_insert(0) += 1;
            }
        }
        FrontierSnapshot {
            library: self.library.clone(),
            covered_sites: self.owners.len(),
            seeds: self.seeds.len(),
            call_frequency,
            origins: self.origins.clone(),
            lifecycle_patterns: self.patterns.len(),
            aggregate_density: self.aggregate_density(),
        }
    }
}

/// Read-only summary of a frontier handed to generators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrontierSnapshot {
    pub library: String,
    pub covered_sites: usize,
    pub seeds: usize,
    /// Number of active seeds that call each symbol.
    pub call_frequency: BTreeMap<String, u64>,
    pub origins: BTreeSet<Origin>,
    pub lifecycle_patterns: usize,
    pub aggregate_density: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, score: f64, sites: &[&str], calls: &[&str]) -> SeedEntry {
        SeedEntry {
            stable_id: StableId(id),
            candidate_id: id,
            hash: ContentHash::of(&format!("seed {id}")),
            origin: Origin::Example,
            role: SeedRole::Coverage,
            score,
            quality: QualityRecord {
                unique_branches: sites.iter().map(|s| (s.to_string(), 1)).collect(),
                library_calls: calls.iter().map(|s| s.to_string()).collect(),
                ..QualityRecord::default()
            },
            critical_pattern: Vec::new(),
        }
    }

    #[test]
    fn stable_id_is_zero_padded() {
        assert_eq!(StableId(42).to_string(), "id_000042");
    }

    #[test]
    fn admit_claims_sites_and_retires_victims() {
        let mut frontier = Frontier::new("cjson", Some(10));
        frontier.admit(entry(0, 0.8, &["A", "B"], &[]), &["A".into(), "B".into()], &[]);
        assert_eq!(frontier.covered(), 2);
        assert_eq!(frontier.owner("A"), Some(StableId(0)));

        frontier.admit(
            entry(1, 0.7, &["A", "B", "C"], &[]),
            &["A".into(), "B".into(), "C".into()],
            &[StableId(0)],
        );
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier.covered(), 3);
        assert!(frontier.retired_seed(StableId(0)).is_some());
        assert_eq!(frontier.owned_by(StableId(1)).len(), 3);
        assert_eq!(frontier.aggregate_density(), Some(0.3));
    }

    #[test]
    fn restore_assigns_best_coverer() {
        let frontier = Frontier::restore(
            "zlib",
            None,
            vec![
                entry(3, 0.5, &["A", "B"], &["inflate"]),
                entry(4, 0.9, &["B", "C"], &["inflate", "inflateEnd"]),
                entry(5, 0.5, &["A"], &[]),
            ],
            vec![entry(1, 0.1, &["Z"], &[])],
        );
        assert_eq!(frontier.owner("A"), Some(StableId(5)), "fewer calls wins a score tie");
        assert_eq!(frontier.owner("B"), Some(StableId(4)));
        assert_eq!(frontier.owner("C"), Some(StableId(4)));
        assert!(!frontier.is_covered("Z"));
        assert_eq!(frontier.retired().count(), 1);

        let snapshot = frontier.snapshot();
        assert_eq!(snapshot.covered_sites, 3);
        assert_eq!(snapshot.call_frequency["inflate"], 2);
        assert_eq!(snapshot.aggregate_density, None);
    }

    #[test]
    fn reinstate_brings_back_retired_seed() {
        let mut frontier = Frontier::new("zlib", None);
        frontier.admit(entry(0, 0.8, &["A"], &[]), &["A".into()], &[]);
        frontier.admit(entry(1, 0.9, &["A", "B"], &[]), &["A".into(), "B".into()], &[StableId(0)]);
        assert!(frontier.reinstate(StableId(0), SeedRole::RegressionAnchor));
        frontier.reassign("A", StableId(0));
        assert_eq!(frontier.owner("A"), Some(StableId(0)));
        assert_eq!(
            frontier.seed(StableId(0)).map(|e| e.role),
            Some(SeedRole::RegressionAnchor)
        );
        assert!(!frontier.reinstate(StableId(7), SeedRole::RegressionAnchor));
    }

    #[test]
    fn refresh_updates_quality_but_not_owners() {
        let mut frontier = Frontier::new("zlib", None);
        frontier.admit(entry(0, 0.8, &["A", "B"], &[]), &["A".into(), "B".into()], &[]);
        let shrunk = entry(0, 0.8, &["B"], &[]).quality;
        assert!(frontier.refresh(StableId(0), shrunk.clone()));
        assert_eq!(frontier.seed(StableId(0)).map(|e| &e.quality), Some(&shrunk));
        assert_eq!(frontier.owner("A"), Some(StableId(0)));
        assert!(!frontier.refresh(StableId(9), shrunk));
    }
}
