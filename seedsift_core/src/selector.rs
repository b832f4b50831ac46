use crate::candidate::Candidate;
use crate::executor::ExitClass;
use crate::frontier::{AdmittedSeed, Frontier, SeedEntry, SeedRole, StableId};
use crate::observer::BranchSite;
use crate::scorer::{QualityRecord, Scorer};
use crate::writer::WriterError;
use std::collections::{BTreeMap, BTreeSet};

/// What [`SeedSink::persist`] did with a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    /// A new seed was written under this id.
    Created(StableId),
    /// A seed with the same content was already stored. `reinstated` is set
    /// when it had to come back from retirement.
    Existing { id: StableId, reinstated: bool },
}

impl Persisted {
    pub fn id(&self) -> StableId {
        match self {
            Persisted::Created(id) | Persisted::Existing { id, .. } => *id,
        }
    }
}

/// Where admitted seeds go. Implemented by the on-disk corpus writer.
pub trait SeedSink {
    /// Stores `seed`, or finds the stored seed with the same content.
    ///
    /// # Errors
    ///
    /// Returns an error when nothing could be stored. The sink is unchanged
    /// in that case.
    fn persist(&mut self, seed: &AdmittedSeed) -> Result<Persisted, WriterError>;
    fn retire(&mut self, id: StableId) -> Result<(), WriterError>;
    fn reinstate(&mut self, id: StableId, role: SeedRole) -> Result<(), WriterError>;
    /// Removes a seed created by `persist` that was never committed.
    fn unpersist(&mut self, id: StableId) -> Result<(), WriterError>;
    /// Records the quality a seed reached when it was last re-executed.
    fn refresh(&mut self, id: StableId, quality: &QualityRecord) -> Result<(), WriterError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error("failed to persist seed: {0}")]
    Persist(#[source] WriterError),
    #[error("failed to retire {victim}: {source}")]
    Retire {
        victim: StableId,
        #[source]
        source: WriterError,
    },
    #[error("failed to restore {id} as a regression anchor: {source}")]
    Reinstate {
        id: StableId,
        #[source]
        source: WriterError,
    },
    #[error("failed to record re-validated quality of {id}: {source}")]
    Refresh {
        id: StableId,
        #[source]
        source: WriterError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Reject,
    /// Admit and retire the listed seeds.
    Replace(Vec<StableId>),
}

/// A decision together with everything needed to commit it.
#[derive(Debug, Clone)]
pub struct Plan {
    pub decision: Decision,
    pub role: Option<SeedRole>,
    pub score: f64,
    pub novel: Vec<BranchSite>,
    claimed: Vec<BranchSite>,
    quality: QualityRecord,
}

impl Plan {
    pub fn quality(&self) -> &QualityRecord {
        &self.quality
    }

    fn reject(score: f64, quality: QualityRecord) -> Self {
        Self {
            decision: Decision::Reject,
            role: None,
            score,
            novel: Vec::new(),
            claimed: Vec::new(),
            quality,
        }
    }
}

/// What a committed plan did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Rejected,
    Admitted {
        id: StableId,
        role: SeedRole,
        replaced: Vec<StableId>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevalidationOutcome {
    pub checked: usize,
    pub lost_sites: usize,
    pub reassigned: usize,
    pub restored: Vec<StableId>,
    /// Sites nobody reaches any more. They stay covered, with their old owner.
    pub unrecovered: Vec<BranchSite>,
}

/// Per-library admission policy. Owns the frontier; every change to it goes
/// through `commit` or `revalidate`.
#[derive(Debug, Clone)]
pub struct Selector {
    frontier: Frontier,
    scorer: Scorer,
    prefer_origin_diversity: bool,
}

impl Selector {
    pub fn new(frontier: Frontier, scorer: Scorer) -> Self {
        Self {
            frontier,
            scorer,
            prefer_origin_diversity: false,
        }
    }

    pub fn with_origin_diversity(mut self, enabled: bool) -> Self {
        self.prefer_origin_diversity = enabled;
        self
    }

    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    /// Decides what to do with an executed candidate without changing state.
    ///
    /// # Arguments
    ///
    /// * `candidate` - the executed candidate, for its id and origin.
    /// * `exit` - how the run ended. Anything but `Success` is rejected.
    /// * `quality` - the scored run.
    pub fn plan(&self, candidate: &Candidate, exit: &ExitClass, quality: QualityRecord) -> Plan {
        let novel = self.frontier.novel_sites(&quality);
        let score = self.scorer.rank(&quality, novel.len());
        if *exit != ExitClass::Success {
            return Plan::reject(score, quality);
        }
        self.plan_scored(candidate, quality, score)
    }

    /// Like `plan` for a candidate that ran to completion, with its score
    /// already known.
    pub fn plan_scored(&self, candidate: &Candidate, quality: QualityRecord, score: f64) -> Plan {
        if quality.unique_branches.is_empty() {
            return Plan::reject(score, quality);
        }
        let sites = quality.branch_set();
        let novel = self.frontier.novel_sites(&quality);
        let cand_key = (score, quality.library_calls.len(), candidate.id);

        let mut victims: BTreeSet<StableId> = BTreeSet::new();
        for seed in self.frontier.seeds() {
            if seed.role.is_anchor() {
                continue;
            }
            let owned = self.frontier.owned_by(seed.stable_id);
            if owned.is_empty() || !owned.is_subset(&sites) {
                continue;
            }
            let theirs = seed.quality.unique_branches.len();
            let dominates = sites.len() > theirs
                || (sites.len() == theirs
                    && SeedEntry::tie_break(cand_key, seed.tie_key()).is_lt());
            if dominates {
                victims.insert(seed.stable_id);
            }
        }

        let role = if !victims.is_empty() || !novel.is_empty() {
            SeedRole::Coverage
        } else {
            let pattern = self
                .scorer
                .profile()
                .policy
                .order_pattern(&quality.critical_calls);
            if !pattern.is_empty() && !self.frontier.has_pattern(&pattern) {
                SeedRole::Lifecycle
            } else if self.prefer_origin_diversity && !self.frontier.has_origin(&candidate.origin)
            {
                SeedRole::Diversity
            } else {
                return Plan::reject(score, quality);
            }
        };

        // Sites the new seed will own: its novel sites, everything its
        // victims owned, and any site held by a strictly lower score.
        let mut claimed: BTreeSet<BranchSite> = novel.iter().cloned().collect();
        let mut remaining: BTreeMap<StableId, usize> = BTreeMap::new();
        for site in &sites {
            let Some(owner) = self.frontier.owner(site) else {
                continue;
            };
            let owner_score = self.frontier.seed(owner).map_or(f64::MIN, |s| s.score);
            if victims.contains(&owner) || owner_score < score {
                claimed.insert(site.clone());
            }
        }
        for seed in self.frontier.seeds() {
            let left = self
                .frontier
                .owned_by(seed.stable_id)
                .iter()
                .filter(|site| !claimed.contains(*site))
                .count();
            remaining.insert(seed.stable_id, left);
        }
        // A coverage seed stripped of every site has nothing left to offer.
        for seed in self.frontier.seeds() {
            if !seed.role.is_anchor()
                && remaining.get(&seed.stable_id) == Some(&0)
                && !self.frontier.owned_by(seed.stable_id).is_empty()
            {
                victims.insert(seed.stable_id);
            }
        }

        let decision = if victims.is_empty() {
            Decision::Admit
        } else {
            Decision::Replace(victims.into_iter().collect())
        };
        Plan {
            decision,
            role: Some(role),
            score,
            novel,
            claimed: claimed.into_iter().collect(),
            quality,
        }
    }

    /// Applies a plan. The seed is written before the frontier changes, and a
    /// failed write leaves the frontier as it was.
    ///
    /// # Errors
    ///
    /// `Persist` when the seed could not be written, `Retire` when a victim
    /// could not be retired. On `Retire` the victims retired so far are
    /// reinstated, and the new seed is removed only if this call created it.
    pub fn commit<S: SeedSink + ?Sized>(
        &mut self,
        plan: Plan,
        candidate: &Candidate,
        sink: &mut S,
    ) -> Result<Transition, SelectorError> {
        let victims = match &plan.decision {
            Decision::Reject => return Ok(Transition::Rejected),
            Decision::Admit => Vec::new(),
            Decision::Replace(victims) => victims.clone(),
        };
        let role = plan.role.unwrap_or(SeedRole::Coverage);
        let seed = AdmittedSeed {
            candidate: candidate.clone(),
            quality: plan.quality,
            score: plan.score,
            role,
        };
        let persisted = sink.persist(&seed).map_err(SelectorError::Persist)?;
        let id = persisted.id();

        let mut retired = Vec::with_capacity(victims.len());
        for victim in &victims {
            if let Err(source) = sink.retire(*victim) {
                log::warn!(
                    "{}: rolling back admission of candidate {}: {}",
                    self.frontier.library(),
                    candidate.id,
                    source
                );
                for done in retired.iter().rev() {
                    let role = self
                        .frontier
                        .seed(*done)
                        .map_or(SeedRole::Coverage, |s| s.role);
                    if let Err(e) = sink.reinstate(*done, role) {
                        log::error!("rollback: failed to reinstate {done}: {e}");
                    }
                }
                let undone = match persisted {
                    Persisted::Created(id) => sink.unpersist(id),
                    Persisted::Existing {
                        id,
                        reinstated: true,
                    } => sink.retire(id),
                    Persisted::Existing { .. } => Ok(()),
                };
                if let Err(e) = undone {
                    log::error!("rollback: failed to undo persisting {id}: {e}");
                }
                return Err(SelectorError::Retire {
                    victim: *victim,
                    source,
                });
            }
            retired.push(*victim);
        }

        let critical_pattern = self
            .scorer
            .profile()
            .policy
            .order_pattern(&seed.quality.critical_calls);
        let entry = SeedEntry {
            stable_id: id,
            candidate_id: candidate.id,
            hash: candidate.content_hash(),
            origin: candidate.origin.clone(),
            role,
            score: seed.score,
            quality: seed.quality,
            critical_pattern,
        };
        self.frontier.admit(entry, &plan.claimed, &victims);
        log::debug!(
            "{}: admitted candidate {} as {} ({:?}, score {:.4}, {} novel, replaced {:?})",
            self.frontier.library(),
            candidate.id,
            id,
            role,
            plan.score,
            plan.novel.len(),
            victims
        );
        Ok(Transition::Admitted {
            id,
            role,
            replaced: victims,
        })
    }

    /// Plans and commits in one step.
    pub fn decide<S: SeedSink + ?Sized>(
        &mut self,
        candidate: &Candidate,
        exit: &ExitClass,
        quality: QualityRecord,
        sink: &mut S,
    ) -> Result<(Decision, Transition), SelectorError> {
        let plan = self.plan(candidate, exit, quality);
        let decision = plan.decision.clone();
        let transition = self.commit(plan, candidate, sink)?;
        Ok((decision, transition))
    }

    /// Decides a batch in tie-break order (score against the frontier as it
    /// was before the batch, then fewer library calls, then earlier id), so the
    /// outcome does not depend on the order the batch arrived in.
    pub fn decide_batch<S: SeedSink + ?Sized>(
        &mut self,
        batch: Vec<(Candidate, ExitClass, QualityRecord)>,
        sink: &mut S,
    ) -> Vec<(Candidate, Result<(Decision, Transition), SelectorError>)> {
        let mut keyed: Vec<_> = batch
            .into_iter()
            .map(|(candidate, exit, quality)| {
                let novel = self.frontier.novel_sites(&quality).len();
                let key = (
                    self.scorer.rank(&quality, novel),
                    quality.library_calls.len(),
                    candidate.id,
                );
                (key, candidate, exit, quality)
            })
            .collect();
        keyed.sort_by(|a, b| SeedEntry::tie_break(a.0, b.0));

        keyed
            .into_iter()
            .map(|(_, candidate, exit, quality)| {
                let outcome = self.decide(&candidate, &exit, quality, sink);
                (candidate, outcome)
            })
            .collect()
    }

    /// Checks fresh re-executions of the corpus. `fresh` maps active and
    /// retired seeds to the quality they reach now. A site whose owner no
    /// longer reaches it moves to the best active seed that still does, or
    /// else to a retired seed that does, which comes back as a regression
    /// anchor. Every re-executed seed then has its stored quality refreshed,
    /// so rebuilding the frontier from the sink reproduces the new owners.
    ///
    /// # Errors
    ///
    /// `Reinstate` or `Refresh` when the sink rejects a change. Ownership
    /// repaired before the failure stays in place.
    pub fn revalidate<S: SeedSink + ?Sized>(
        &mut self,
        fresh: &BTreeMap<StableId, QualityRecord>,
        sink: &mut S,
    ) -> Result<RevalidationOutcome, SelectorError> {
        let mut outcome = RevalidationOutcome {
            checked: fresh.len(),
            ..RevalidationOutcome::default()
        };

        let lost: Vec<(BranchSite, StableId)> = self
            .frontier
            .covered_sites()
            .filter_map(|site| {
                let owner = self.frontier.owner(site)?;
                let reached = fresh.get(&owner).map_or(true, |q| q.covers(site));
                (!reached).then(|| (site.clone(), owner))
            })
            .collect();
        outcome.lost_sites = lost.len();

        for (site, owner) in lost {
            let active = self
                .frontier
                .seeds()
                .filter(|s| s.stable_id != owner)
                .filter(|s| fresh.get(&s.stable_id).is_some_and(|q| q.covers(&site)))
                .min_by(|a, b| SeedEntry::tie_break(a.tie_key(), b.tie_key()))
                .map(|s| s.stable_id);
            if let Some(to) = active {
                self.frontier.reassign(&site, to);
                outcome.reassigned += 1;
                continue;
            }

            let anchor = self
                .frontier
                .retired()
                .filter(|s| fresh.get(&s.stable_id).is_some_and(|q| q.covers(&site)))
                .min_by(|a, b| SeedEntry::tie_break(a.tie_key(), b.tie_key()))
                .map(|s| s.stable_id);
            match anchor {
                Some(id) => {
                    sink.reinstate(id, SeedRole::RegressionAnchor)
                        .map_err(|source| SelectorError::Reinstate { id, source })?;
                    self.frontier.reinstate(id, SeedRole::RegressionAnchor);
                    self.frontier.reassign(&site, id);
                    outcome.reassigned += 1;
                    outcome.restored.push(id);
                }
                None => outcome.unrecovered.push(site),
            }
        }

        for (id, quality) in fresh {
            let Some(old) = self
                .frontier
                .seed(*id)
                .or_else(|| self.frontier.retired_seed(*id))
            else {
                continue;
            };
            let refreshed = refreshed_quality(&old.quality, quality, &self.frontier, *id);
            if refreshed == old.quality {
                continue;
            }
            sink.refresh(*id, &refreshed)
                .map_err(|source| SelectorError::Refresh { id: *id, source })?;
            self.frontier.refresh(*id, refreshed);
        }

        if outcome.lost_sites > 0 {
            log::info!(
                "{}: re-validation lost {} sites, reassigned {}, restored {} anchors",
                self.frontier.library(),
                outcome.lost_sites,
                outcome.reassigned,
                outcome.restored.len()
            );
        }
        Ok(outcome)
    }
}

/// `old` with the branch hits of a fresh run of seed `id`. Sites the frontier
/// does not cover are left out. Sites `id` still owns without reaching them
/// keep their old counts, since re-validation never drops a site.
fn refreshed_quality(
    old: &QualityRecord,
    fresh: &QualityRecord,
    frontier: &Frontier,
    id: StableId,
) -> QualityRecord {
    let mut unique_branches: BTreeMap<BranchSite, u64> = fresh
        .unique_branches
        .iter()
        .filter(|(site, _)| frontier.is_covered(site))
        .map(|(site, hits)| (site.clone(), *hits))
        .collect();
    for site in frontier.owned_by(id) {
        if !unique_branches.contains_key(&site) {
            let hits = old.unique_branches.get(&site).copied().unwrap_or(1);
            unique_branches.insert(site, hits);
        }
    }
    QualityRecord {
        density: fresh.density,
        density_known: fresh.density_known,
        unique_branches,
        ..old.clone()
    }
}
