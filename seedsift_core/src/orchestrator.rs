use crate::backend::{CommandBackend, TargetBackend};
use crate::candidate::{Candidate, CandidateStore, InMemoryCandidateStore, Origin};
use crate::config::{GeneratorSettings, SiftConfig};
use crate::executor::{
    ExecutionResult, Executor, ExecutorError, ExitClass, SandboxExecutor, SandboxLimits,
};
use crate::frontier::{Frontier, StableId};
use crate::generator::{CommandGenerator, CommandGeneratorSettings, DirectoryGenerator, Generator};
use crate::library::{LibraryProfile, SymbolTable};
use crate::oracle::{LifecycleOracle, Oracle};
use crate::report::{LibraryReport, RunReport, StopReason};
use crate::scheduler::CombinationScheduler;
use crate::scorer::{ScoreWeights, Scorer, VisitLedger};
use crate::selector::{Selector, Transition};
use crate::writer::CorpusWriter;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Run-wide knobs, shared by every library.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub candidate_timeout: Duration,
    pub run_budget: Option<Duration>,
    /// Executions in flight per library.
    pub concurrency: usize,
    pub converge_after: Option<u64>,
    pub revalidate_every: Option<u64>,
    pub weights: ScoreWeights,
    pub prefer_origin_diversity: bool,
    /// A library stops asking its generator after this many errors in a row.
    pub max_generator_failures: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            candidate_timeout: Duration::from_secs(5),
            run_budget: None,
            concurrency: crate::config::default_concurrency(),
            converge_after: None,
            revalidate_every: None,
            weights: ScoreWeights::default(),
            prefer_origin_diversity: false,
            max_generator_failures: 16,
        }
    }
}

impl From<&SiftConfig> for RunOptions {
    fn from(config: &SiftConfig) -> Self {
        let engine = &config.engine;
        Self {
            candidate_timeout: engine.candidate_timeout(),
            run_budget: engine.run_budget(),
            concurrency: engine.concurrency.max(1),
            converge_after: engine.converge_after,
            revalidate_every: engine.revalidate_every,
            weights: ScoreWeights::from(config.scoring.clone()),
            prefer_origin_diversity: engine.prefer_origin_diversity,
            ..Self::default()
        }
    }
}

/// Everything one library needs for a run.
pub struct LibraryRun {
    pub profile: LibraryProfile,
    pub backend: Box<dyn TargetBackend>,
    pub generator: Box<dyn Generator>,
    pub writer: CorpusWriter,
}

/// Fans the pipeline out over libraries, one coordinator thread each.
pub struct Orchestrator {
    options: RunOptions,
    executor: Box<dyn Executor>,
    libraries: Vec<LibraryRun>,
    stop: Arc<AtomicBool>,
}

fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

impl Orchestrator {
    pub fn new(options: RunOptions, executor: Box<dyn Executor>) -> Self {
        Self {
            options,
            executor,
            libraries: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds the sandbox executor, backends, generators and corpus writers
    /// described by `config`. Relative paths resolve against `base_dir`.
    ///
    /// # Errors
    ///
    /// Fails when the configuration does not validate, a symbols file or
    /// seed directory is missing, or a corpus directory cannot be opened.
    pub fn from_config(config: &SiftConfig, base_dir: &Path) -> Result<Self, anyhow::Error> {
        config.validate()?;
        let corpus_dir = resolve(base_dir, &config.engine.corpus_dir);
        let executor = SandboxExecutor::new(SandboxLimits::from(&config.engine));
        let mut orchestrator = Self::new(RunOptions::from(config), Box::new(executor));

        for lib in &config.libraries {
            let profile = lib.profile(base_dir)?;
            let writer = CorpusWriter::open(&corpus_dir, &lib.name, &lib.backend.source_extension)
                .map_err(|e| anyhow::anyhow!("{}: failed to open corpus: {}", lib.name, e))?;
            let generator: Box<dyn Generator> = match &lib.generator {
                GeneratorSettings::Directory { path } => {
                    Box::new(DirectoryGenerator::new(&lib.name, &resolve(base_dir, path))?)
                }
                GeneratorSettings::Command {
                    command,
                    origin,
                    seed,
                    combination_size,
                    max_candidates,
                } => Box::new(CommandGenerator::new(
                    &lib.name,
                    CommandGeneratorSettings {
                        command: command.clone(),
                        origin: origin.clone().map_or(Origin::Random, Origin::from),
                        max_candidates: *max_candidates,
                        timeout: config.engine.compile_timeout(),
                    },
                    Box::new(CombinationScheduler::new(*seed, *combination_size)),
                )),
            };
            orchestrator.add_library(LibraryRun {
                profile,
                backend: Box::new(CommandBackend::new(&lib.name, lib.backend.clone())),
                generator,
                writer,
            });
        }
        Ok(orchestrator)
    }

    pub fn add_library(&mut self, library: LibraryRun) {
        self.libraries.push(library);
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Setting the flag stops new candidates; in-flight work still drains.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Curates every library until its generator is exhausted, it converges,
    /// the budget runs out or the stop flag is set. Libraries run side by
    /// side; a library whose coordinator panics is reported with a warning.
    pub fn run(self) -> RunReport {
        let started = Instant::now();
        let Orchestrator {
            options,
            executor,
            libraries,
            stop,
        } = self;
        let shared = Shared {
            options: &options,
            executor: executor.as_ref(),
            stop: &stop,
            deadline: options.run_budget.map(|budget| started + budget),
        };

        let libraries: Vec<LibraryReport> = std::thread::scope(|scope| {
            let handles: Vec<_> = libraries
                .into_iter()
                .map(|library| {
                    let name = library.profile.name.clone();
                    (name, scope.spawn(move || curate_library(library, shared)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| match handle.join() {
                    Ok(report) => report,
                    Err(_) => {
                        let mut report = LibraryReport::new(name);
                        report.warn("coordinator thread panicked".to_string());
                        report
                    }
                })
                .collect()
        });

        RunReport {
            elapsed_ms: started.elapsed().as_millis() as u64,
            libraries,
        }
    }
}

#[derive(Clone, Copy)]
struct Shared<'a> {
    options: &'a RunOptions,
    executor: &'a dyn Executor,
    stop: &'a AtomicBool,
    deadline: Option<Instant>,
}

struct WorkItem {
    seq: u64,
    candidate: Candidate,
}

struct WorkResult {
    seq: u64,
    candidate: Candidate,
    outcome: Result<ExecutionResult, ExecutorError>,
}

fn worker_loop(
    executor: &dyn Executor,
    backend: &dyn TargetBackend,
    timeout: Duration,
    work_rx: &Mutex<Receiver<WorkItem>>,
    res_tx: SyncSender<WorkResult>,
) {
    loop {
        let item = {
            let Ok(rx) = work_rx.lock() else {
                break;
            };
            rx.recv()
        };
        let Ok(item) = item else {
            break;
        };
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            executor.execute(&item.candidate, backend, timeout)
        }))
        .unwrap_or_else(|payload| Err(ExecutorError::Panicked(panic_message(payload.as_ref()))));
        let result = WorkResult {
            seq: item.seq,
            candidate: item.candidate,
            outcome,
        };
        if res_tx.send(result).is_err() {
            break;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Single owner of one library's selector and writer.
struct Curator<'a> {
    shared: Shared<'a>,
    backend: &'a dyn TargetBackend,
    symbols: SymbolTable,
    selector: Selector,
    writer: CorpusWriter,
    generator: Box<dyn Generator>,
    oracle: LifecycleOracle,
    store: InMemoryCandidateStore,
    ledger: VisitLedger,
    report: LibraryReport,
    /// Consecutive processed candidates that changed nothing.
    idle: u64,
    since_revalidation: u64,
    generator_failures: u64,
}

fn curate_library(library: LibraryRun, shared: Shared<'_>) -> LibraryReport {
    let LibraryRun {
        profile,
        backend,
        generator,
        writer,
    } = library;
    let policy = profile.policy.clone();
    let frontier = Frontier::restore(
        &profile.name,
        profile.total_branch_sites,
        writer.active_entries(&policy),
        writer.retired_entries(&policy),
    );
    if !frontier.is_empty() {
        log::info!(
            "{}: resuming with {} seeds covering {} sites",
            profile.name,
            frontier.len(),
            frontier.covered()
        );
    }
    let first_id = writer.max_candidate_id().map_or(0, |id| id + 1);

    let mut curator = Curator {
        shared,
        backend: backend.as_ref(),
        symbols: profile.symbols.clone(),
        report: LibraryReport::new(&profile.name),
        oracle: LifecycleOracle::new(policy),
        selector: Selector::new(frontier, Scorer::new(profile, shared.options.weights))
            .with_origin_diversity(shared.options.prefer_origin_diversity),
        ledger: writer.visits(),
        writer,
        generator,
        store: InMemoryCandidateStore::starting_at(first_id),
        idle: 0,
        since_revalidation: 0,
        generator_failures: 0,
    };
    curator.curate();
    curator.finish()
}

impl Curator<'_> {
    fn curate(&mut self) {
        let cap = self.shared.options.concurrency.max(1);
        let executor = self.shared.executor;
        let backend = self.backend;
        let timeout = self.shared.options.candidate_timeout;

        let (work_tx, work_rx) = sync_channel::<WorkItem>(cap);
        let (res_tx, res_rx) = sync_channel::<WorkResult>(cap);
        let work_rx = Mutex::new(work_rx);

        std::thread::scope(|scope| {
            for _ in 0..cap {
                let res_tx = res_tx.clone();
                let work_rx = &work_rx;
                scope.spawn(move || worker_loop(executor, backend, timeout, work_rx, res_tx));
            }
            drop(res_tx);

            let mut seq_next_send: u64 = 0;
            let mut seq_next_apply: u64 = 0;
            let mut inflight: usize = 0;
            let mut pending: BTreeMap<u64, WorkResult> = BTreeMap::new();
            let mut stopped: Option<StopReason> = None;

            loop {
                while inflight < cap && stopped.is_none() {
                    if let Some(reason) = self.stop_reason() {
                        stopped = Some(reason);
                        break;
                    }
                    let Some(candidate) = self.next_candidate() else {
                        stopped = Some(StopReason::Exhausted);
                        break;
                    };
                    let item = WorkItem {
                        seq: seq_next_send,
                        candidate,
                    };
                    if work_tx.send(item).is_err() {
                        break;
                    }
                    inflight += 1;
                    seq_next_send += 1;
                }

                if inflight == 0 {
                    break;
                }

                let Ok(result) = res_rx.recv() else {
                    self.report
                        .warn(format!("workers exited with {inflight} executions in flight"));
                    break;
                };
                pending.insert(result.seq, result);

                // Apply strictly in submission order.
                while let Some(result) = pending.remove(&seq_next_apply) {
                    self.apply(result.candidate, result.outcome);
                    inflight -= 1;
                    seq_next_apply += 1;
                }
            }

            drop(work_tx);
            self.report.stop_reason = stopped.unwrap_or(StopReason::Exhausted);
        });
    }

    fn stop_reason(&self) -> Option<StopReason> {
        if self.shared.stop.load(Ordering::Relaxed) {
            return Some(StopReason::Stopped);
        }
        if self
            .shared
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Some(StopReason::Budget);
        }
        if self
            .shared
            .options
            .converge_after
            .is_some_and(|limit| self.idle >= limit)
        {
            return Some(StopReason::Converged);
        }
        None
    }

    /// Whether the stop flag or the run budget has cut the run short. No new
    /// executions start after that, re-validation included.
    fn cut_short(&self) -> bool {
        matches!(
            self.stop_reason(),
            Some(StopReason::Stopped | StopReason::Budget)
        )
    }

    /// Next candidate from the generator, registered in the store. `None`
    /// when the generator is exhausted or keeps failing.
    fn next_candidate(&mut self) -> Option<Candidate> {
        loop {
            let snapshot = self.selector.frontier().snapshot();
            match self.generator.generate(&self.symbols, &snapshot) {
                Ok(Some(candidate)) => {
                    self.generator_failures = 0;
                    let id = self.store.submit(candidate);
                    return self.store.checkout(id);
                }
                Ok(None) => return None,
                Err(e) => {
                    self.report.generator_errors += 1;
                    self.generator_failures += 1;
                    self.report.warn(format!("generator error: {e}"));
                    if self.generator_failures >= self.shared.options.max_generator_failures {
                        self.report.warn(format!(
                            "giving up after {} consecutive generator errors",
                            self.generator_failures
                        ));
                        return None;
                    }
                }
            }
        }
    }

    fn apply(&mut self, candidate: Candidate, outcome: Result<ExecutionResult, ExecutorError>) {
        self.report.processed += 1;
        let changed = match outcome {
            Ok(result) => self.absorb(&candidate, &result),
            Err(e) => {
                self.report.infra_errors += 1;
                self.report.warn(format!("candidate {}: {}", candidate.id, e));
                false
            }
        };
        self.generator.report(&candidate, changed);
        if changed {
            self.idle = 0;
        } else {
            self.idle += 1;
        }

        self.since_revalidation += 1;
        let due = self
            .shared
            .options
            .revalidate_every
            .is_some_and(|every| every > 0 && self.since_revalidation >= every);
        if due && self.cut_short() {
            log::debug!("{}: skipping re-validation while draining", self.report.library);
        } else if due {
            self.since_revalidation = 0;
            self.revalidate();
        }
    }

    /// Scores an execution and hands it to the selector. Returns whether the
    /// corpus changed.
    fn absorb(&mut self, candidate: &Candidate, result: &ExecutionResult) -> bool {
        self.report.record_exit(result.exit());
        if !result.exit().ran() {
            self.report.record_transition(&Transition::Rejected);
            return false;
        }

        let visited = self.ledger.visit(result.hash());
        let quality = self.selector.scorer().score(result, visited);
        if let Some(finding) = self.oracle.examine(result, &quality) {
            log::info!(
                "{}: candidate {}: {}",
                self.report.library,
                candidate.id,
                finding.description
            );
            self.report.record_finding(finding);
        }

        match self
            .selector
            .decide(candidate, result.exit(), quality, &mut self.writer)
        {
            Ok((_, transition)) => {
                self.report.record_transition(&transition);
                matches!(transition, Transition::Admitted { .. })
            }
            Err(e) => {
                self.report.infra_errors += 1;
                self.report
                    .warn(format!("candidate {}: {}", candidate.id, e));
                false
            }
        }
    }

    /// Re-executes every active and retired seed and lets the selector
    /// repair ownership of sites that are no longer reached.
    fn revalidate(&mut self) {
        let frontier = self.selector.frontier();
        let ids: Vec<StableId> = frontier
            .seeds()
            .chain(frontier.retired())
            .map(|seed| seed.stable_id)
            .collect();
        let library = frontier.library().to_string();

        let mut fresh = BTreeMap::new();
        for id in ids {
            if self.cut_short() {
                log::debug!("{library}: re-validation abandoned, run is stopping");
                return;
            }
            let seed = match self.writer.read_seed(id) {
                Ok(seed) => seed,
                Err(e) => {
                    self.report
                        .warn(format!("re-validation: cannot read {id}: {e}"));
                    continue;
                }
            };
            let mut candidate =
                Candidate::new(&library, seed.body).with_combination(seed.combination);
            candidate.id = seed.id;
            match self.shared.executor.execute(
                &candidate,
                self.backend,
                self.shared.options.candidate_timeout,
            ) {
                Ok(result) if *result.exit() == ExitClass::Success => {
                    let visited = self.ledger.get(&result.hash());
                    fresh.insert(id, self.selector.scorer().score(&result, visited));
                }
                // Only a clean run says anything about lost sites.
                Ok(result) => log::debug!(
                    "{}: re-validation of {} ended with {}",
                    library,
                    id,
                    result.exit().label()
                ),
                Err(e) => self
                    .report
                    .warn(format!("re-validation of {id} failed: {e}")),
            }
        }

        match self.selector.revalidate(&fresh, &mut self.writer) {
            Ok(outcome) => {
                self.report.revalidations += 1;
                self.report.restored_anchors += outcome.restored.len() as u64;
                if !outcome.unrecovered.is_empty() {
                    self.report.warn(format!(
                        "{} sites are no longer reached by any seed",
                        outcome.unrecovered.len()
                    ));
                }
            }
            Err(e) => self.report.warn(format!("re-validation: {e}")),
        }
    }

    /// Persists the visit ledger and fills in corpus statistics.
    fn finish(mut self) -> LibraryReport {
        if let Err(e) = self.writer.record_visits(&self.ledger) {
            self.report.warn(format!("failed to save visit counts: {e}"));
        }
        let frontier = self.selector.frontier();
        self.report.corpus_size = frontier.len();
        self.report.covered_sites = frontier.covered();
        self.report.aggregate_density = frontier.aggregate_density();
        log::info!(
            "{}: {} processed, {} admitted, {} rejected, {} replaced, corpus {} seeds / {} sites ({})",
            self.report.library,
            self.report.processed,
            self.report.admitted,
            self.report.rejected,
            self.report.replaced,
            self.report.corpus_size,
            self.report.covered_sites,
            self.report.stop_reason.as_str()
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BuildOutcome;
    use crate::config::BackendSettings;
    use crate::frontier::FrontierSnapshot;
    use crate::generator::GeneratorError;
    use crate::observer::{CoverageTrace, Observer, TraceFileObserver};
    use std::collections::VecDeque;
    use std::process::Command;
    use tempfile::tempdir;

    /// Interprets the harness text itself as the trace. Directive lines pick
    /// the outcome: `exit crash`, `exit timeout`, `exit compile`, `exit infra`,
    /// `exit panic` and `sleep <ms>`.
    struct ScriptedExecutor;

    impl Executor for ScriptedExecutor {
        fn execute(
            &self,
            candidate: &Candidate,
            _build: &dyn TargetBackend,
            _time_budget: Duration,
        ) -> Result<ExecutionResult, ExecutorError> {
            let mut exit = ExitClass::Success;
            for line in candidate.source.lines() {
                match line.trim() {
                    "exit crash" => {
                        exit = ExitClass::Crash {
                            signal: Some(11),
                            code: None,
                        }
                    }
                    "exit timeout" => exit = ExitClass::Timeout,
                    "exit compile" => exit = ExitClass::CompileError("error: nope".into()),
                    "exit infra" => return Err(ExecutorError::Backend("sandbox gone".into())),
                    "exit panic" => panic!("runner lost its sandbox"),
                    other => {
                        if let Some(ms) = other.strip_prefix("sleep ") {
                            std::thread::sleep(Duration::from_millis(ms.parse().unwrap()));
                        }
                    }
                }
            }
            let trace = if exit.ran() {
                CoverageTrace::parse(&candidate.source)
            } else {
                CoverageTrace::default()
            };
            Ok(ExecutionResult::new(
                candidate,
                exit,
                Duration::from_millis(1),
                trace,
                String::new(),
            ))
        }
    }

    /// Counts every execution it forwards.
    struct CountingExecutor(Arc<std::sync::atomic::AtomicU64>);

    impl Executor for CountingExecutor {
        fn execute(
            &self,
            candidate: &Candidate,
            build: &dyn TargetBackend,
            time_budget: Duration,
        ) -> Result<ExecutionResult, ExecutorError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            ScriptedExecutor.execute(candidate, build, time_budget)
        }
    }

    struct InertBackend;

    impl TargetBackend for InertBackend {
        fn library(&self) -> &str {
            "zlib"
        }

        fn compile(
            &self,
            _candidate: &Candidate,
            _workdir: &Path,
            _deadline: Duration,
        ) -> Result<BuildOutcome, ExecutorError> {
            Err(ExecutorError::Backend("not used".into()))
        }

        fn run_command(&self, _binary: &Path, _workdir: &Path) -> Result<Command, ExecutorError> {
            Err(ExecutorError::Backend("not used".into()))
        }

        fn coverage_observer(&self) -> Box<dyn Observer> {
            Box::new(TraceFileObserver::new())
        }
    }

    /// Hands out a fixed list, then optionally repeats a template forever.
    struct ListGenerator {
        queue: VecDeque<String>,
        endless: Option<String>,
        produced: u64,
    }

    impl ListGenerator {
        fn new(sources: &[&str]) -> Self {
            Self {
                queue: sources.iter().map(|s| s.to_string()).collect(),
                endless: None,
                produced: 0,
            }
        }

        fn endless(template: &str) -> Self {
            Self {
                queue: VecDeque::new(),
                endless: Some(template.to_string()),
                produced: 0,
            }
        }
    }

    impl Generator for ListGenerator {
        fn generate(
            &mut self,
            _symbols: &SymbolTable,
            _snapshot: &FrontierSnapshot,
        ) -> Result<Option<Candidate>, GeneratorError> {
            self.produced += 1;
            let source = match self.queue.pop_front() {
                Some(source) => source,
                None => match &self.endless {
                    Some(template) => template.replace("{n}", &self.produced.to_string()),
                    None => return Ok(None),
                },
            };
            Ok(Some(Candidate::new("zlib", source)))
        }
    }

    fn options(concurrency: usize) -> RunOptions {
        RunOptions {
            concurrency,
            ..RunOptions::default()
        }
    }

    fn orchestrator(corpus: &Path, options: RunOptions, generator: ListGenerator) -> Orchestrator {
        let mut orchestrator = Orchestrator::new(options, Box::new(ScriptedExecutor));
        orchestrator.add_library(LibraryRun {
            profile: LibraryProfile::new("zlib"),
            backend: Box::new(InertBackend),
            generator: Box::new(generator),
            writer: CorpusWriter::open(corpus, "zlib", "cc").unwrap(),
        });
        orchestrator
    }

    const AB: &str = "sleep 40\nB A\nB B\n";
    const A: &str = "B A\n";
    const ABC: &str = "B A\nB B\nB C\n";
    const CRASH: &str = "C inflateInit_\nB D\nR inflateInit_\nC inflate\nexit crash\n";

    #[test]
    fn applies_results_in_submission_order() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        let generator =
            ListGenerator::new(&[AB, A, ABC, CRASH, "exit compile\n", "exit infra\n"]);
        let report = orchestrator(dir.path(), options(3), generator).run();
        let zlib = report.library("zlib").unwrap();

        assert_eq!(zlib.processed, 6);
        assert_eq!(zlib.admitted, 2, "{{A,B}} then its superset");
        assert_eq!(zlib.replaced, 1);
        assert_eq!(zlib.rejected, 3);
        assert_eq!(zlib.infra_errors, 1);
        assert_eq!((zlib.crashes, zlib.compile_errors), (1, 1));
        assert_eq!(zlib.lifecycle_flags, 1);
        assert_eq!(zlib.findings.len(), 1);
        assert_eq!(zlib.corpus_size, 1);
        assert_eq!(zlib.covered_sites, 3);
        assert_eq!(zlib.stop_reason, StopReason::Exhausted);
        assert_eq!(zlib.warnings.len(), 1);

        let writer = CorpusWriter::open(dir.path(), "zlib", "cc").unwrap();
        assert_eq!(writer.len(), 1);
        assert_eq!(writer.entries().len(), 2, "the replaced seed stays retired");
    }

    #[test]
    fn second_run_resumes_frontier_ids_and_visits() {
        let dir = tempdir().unwrap();
        orchestrator(dir.path(), options(2), ListGenerator::new(&[AB, ABC])).run();

        let report = orchestrator(dir.path(), options(2), ListGenerator::new(&[A, ABC])).run();
        let zlib = report.library("zlib").unwrap();
        assert_eq!(zlib.admitted, 0, "nothing new after a restart");
        assert_eq!(zlib.rejected, 2);
        assert_eq!(zlib.corpus_size, 1);

        let writer = CorpusWriter::open(dir.path(), "zlib", "cc").unwrap();
        assert_eq!(writer.visits().get(&crate::candidate::ContentHash::of(ABC)), 2);
        assert_eq!(writer.max_candidate_id(), Some(1));
    }

    #[test]
    fn stop_flag_and_budget_stop_generation() {
        let dir = tempdir().unwrap();
        let stopped = orchestrator(dir.path(), options(2), ListGenerator::endless("B s{n}\n"));
        stopped.stop_flag().store(true, Ordering::Relaxed);
        let report = stopped.run();
        let zlib = report.library("zlib").unwrap();
        assert_eq!(zlib.stop_reason, StopReason::Stopped);
        assert_eq!(zlib.processed, 0);

        let budgeted = orchestrator(
            dir.path(),
            RunOptions {
                run_budget: Some(Duration::from_millis(100)),
                ..options(2)
            },
            ListGenerator::endless("sleep 5\nB b{n}\n"),
        );
        let report = budgeted.run();
        let zlib = report.library("zlib").unwrap();
        assert_eq!(zlib.stop_reason, StopReason::Budget);
        assert!(zlib.processed > 0);
        assert_eq!(zlib.processed, zlib.admitted + zlib.rejected, "drained");
    }

    #[test]
    fn converges_when_nothing_changes() {
        let dir = tempdir().unwrap();
        let report = orchestrator(
            dir.path(),
            RunOptions {
                converge_after: Some(3),
                ..options(1)
            },
            ListGenerator::endless("B same\n"),
        )
        .run();
        let zlib = report.library("zlib").unwrap();
        assert_eq!(zlib.stop_reason, StopReason::Converged);
        assert_eq!(zlib.processed, 4);
        assert_eq!(zlib.admitted, 1);
    }

    #[test]
    fn periodic_revalidation_keeps_a_stable_corpus() {
        let dir = tempdir().unwrap();
        let report = orchestrator(
            dir.path(),
            RunOptions {
                revalidate_every: Some(2),
                ..options(2)
            },
            ListGenerator::new(&[AB, ABC, A, "B Z\n"]),
        )
        .run();
        let zlib = report.library("zlib").unwrap();
        assert_eq!(zlib.revalidations, 2);
        assert_eq!(zlib.restored_anchors, 0);
        assert!(zlib.warnings.is_empty(), "{:?}", zlib.warnings);
        assert_eq!(zlib.covered_sites, 4);
    }

    #[test]
    fn budget_expiry_skips_due_revalidation() {
        let dir = tempdir().unwrap();
        let executions = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut orchestrator = Orchestrator::new(
            RunOptions {
                run_budget: Some(Duration::from_millis(100)),
                revalidate_every: Some(1),
                ..options(1)
            },
            Box::new(CountingExecutor(executions.clone())),
        );
        orchestrator.add_library(LibraryRun {
            profile: LibraryProfile::new("zlib"),
            backend: Box::new(InertBackend),
            generator: Box::new(ListGenerator::endless("sleep 300\nB b{n}\n")),
            writer: CorpusWriter::open(dir.path(), "zlib", "cc").unwrap(),
        });

        let report = orchestrator.run();
        let zlib = report.library("zlib").unwrap();
        assert_eq!(zlib.stop_reason, StopReason::Budget);
        assert_eq!(zlib.processed, 1);
        assert_eq!(zlib.revalidations, 0);
        assert_eq!(executions.load(Ordering::SeqCst), 1, "nothing ran after expiry");
    }

    #[test]
    fn panicking_executor_becomes_an_infra_error() {
        let dir = tempdir().unwrap();
        let generator = ListGenerator::new(&[A, "exit panic\n", ABC]);
        let report = orchestrator(dir.path(), options(2), generator).run();
        let zlib = report.library("zlib").unwrap();
        assert_eq!(zlib.processed, 3);
        assert_eq!(zlib.infra_errors, 1);
        assert_eq!(zlib.admitted, 2);
        assert!(
            zlib.warnings.iter().any(|w| w.contains("runner lost its sandbox")),
            "{:?}",
            zlib.warnings
        );
    }

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    #[test]
    fn sandboxed_run_over_shell_harnesses() {
        let dir = tempdir().unwrap();
        let seeds = dir.path().join("seeds");
        std::fs::create_dir_all(&seeds).unwrap();
        for name in [
            "harness_ok.sh",
            "harness_crash_after_acquire.sh",
            "harness_exit_three.sh",
        ] {
            std::fs::copy(get_test_target_path(name), seeds.join(name)).unwrap();
        }

        let cc = get_test_target_path("fake_cc.sh");
        let backend = CommandBackend::new(
            "zlib",
            BackendSettings {
                compile: vec![
                    "sh".into(),
                    cc.to_string_lossy().into_owned(),
                    "{source}".into(),
                    "{binary}".into(),
                ],
                instrument: Vec::new(),
                run: vec!["sh".into(), "{binary}".into()],
                source_extension: "sh".into(),
            },
        );
        let executor = SandboxExecutor::new(SandboxLimits {
            compile_timeout: Duration::from_secs(5),
            rss_limit_bytes: None,
            ..SandboxLimits::default()
        });
        let corpus = dir.path().join("corpus");
        let mut orchestrator = Orchestrator::new(
            RunOptions {
                candidate_timeout: Duration::from_secs(3),
                ..options(2)
            },
            Box::new(executor),
        );
        orchestrator.add_library(LibraryRun {
            profile: LibraryProfile::new("zlib"),
            backend: Box::new(backend),
            generator: Box::new(DirectoryGenerator::new("zlib", &seeds).unwrap()),
            writer: CorpusWriter::open(&corpus, "zlib", "sh").unwrap(),
        });

        let report = orchestrator.run();
        let zlib = report.library("zlib").unwrap();
        assert_eq!(zlib.processed, 3);
        assert_eq!(zlib.admitted, 1);
        assert_eq!((zlib.crashes, zlib.non_zero, zlib.successes), (1, 1, 1));
        assert_eq!(zlib.lifecycle_flags, 1);
        assert_eq!(zlib.covered_sites, 3);
        assert!(corpus.join("zlib/example/id_000000.sh").is_file());
    }
}
