use crate::executor::ExitClass;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Environment variable naming the file an instrumented harness appends its
/// trace lines to.
pub const TRACE_ENV_VAR: &str = "SEEDSIFT_TRACE";

/// Identifier of an instrumentable decision point in the library build.
pub type BranchSite = String;

/// One line of the raw coverage trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// `B <site>`: a branch site was hit.
    Branch(BranchSite),
    /// `C <symbol>`: a library call was entered.
    Enter(String),
    /// `R <symbol>`: a library call returned.
    Return(String),
}

/// Ordered coverage events captured from one execution.
///
/// The trace is whatever the harness managed to flush before it exited, so a
/// crashed or killed run still produces a usable (partial) trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageTrace {
    events: Vec<TraceEvent>,
}

impl CoverageTrace {
    pub fn new(events: Vec<TraceEvent>) -> Self {
        Self { events }
    }

    /// Parses the line protocol. Unknown lines are skipped, and a final line
    /// without a terminating newline is treated as torn by termination and
    /// dropped.
    pub fn parse(text: &str) -> Self {
        let complete = match text.rfind('\n') {
            Some(end) => &text[..end],
            None => "",
        };
        let events = complete
            .lines()
            .filter_map(|line| {
                let (tag, value) = line.trim_end().split_once(' ')?;
                let value = value.trim();
                if value.is_empty() {
                    return None;
                }
                match tag {
                    "B" => Some(TraceEvent::Branch(value.to_string())),
                    "C" => Some(TraceEvent::Enter(value.to_string())),
                    "R" => Some(TraceEvent::Return(value.to_string())),
                    _ => None,
                }
            })
            .collect();
        Self { events }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Hit count per branch site.
    pub fn branch_hits(&self) -> BTreeMap<BranchSite, u64> {
        let mut hits = BTreeMap::new();
        for event in &self.events {
            if let TraceEvent::Branch(site) = event {
                *hits.entry(site.clone()).or_insert(0) += 1;
            }
        }
        hits
    }

    /// Library calls in execution order, duplicates included.
    pub fn calls(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Enter(symbol) => Some(symbol.clone()),
                _ => None,
            })
            .collect()
    }

    /// Calls that were entered but had not returned when the trace ended,
    /// innermost last.
    pub fn in_progress(&self) -> Vec<String> {
        let mut stack: Vec<&str> = Vec::new();
        for event in &self.events {
            match event {
                TraceEvent::Enter(symbol) => stack.push(symbol),
                TraceEvent::Return(symbol) => {
                    if let Some(pos) = stack.iter().rposition(|s| s == symbol) {
                        stack.truncate(pos);
                    }
                }
                TraceEvent::Branch(_) => {}
            }
        }
        stack.into_iter().map(str::to_string).collect()
    }
}

/// An `Observer` collects coverage data around one execution of a built
/// harness.
///
/// The executor calls `pre_exec` inside the execution's private working
/// directory before spawning the harness, adds the returned environment to the
/// child, and calls `post_exec` once the child has exited or been killed.
pub trait Observer: Send {
    fn name(&self) -> &'static str;

    /// Prepares collection for one run and returns environment variables the
    /// harness needs to report coverage.
    fn pre_exec(&mut self, workdir: &Path) -> Result<Vec<(String, OsString)>, anyhow::Error>;

    /// Collects whatever the harness flushed. Called for every exit class,
    /// including crashes and timeouts.
    fn post_exec(&mut self, status: &ExitClass) -> Result<(), anyhow::Error>;

    /// Hands over the collected trace, leaving the observer empty.
    fn take_trace(&mut self) -> CoverageTrace;

    fn reset(&mut self);
}

/// Reads the line-oriented trace file named by [`TRACE_ENV_VAR`].
#[derive(Debug, Default)]
pub struct TraceFileObserver {
    trace_path: Option<PathBuf>,
    trace: CoverageTrace,
}

impl TraceFileObserver {
    const TRACE_FILENAME: &'static str = "coverage.trace";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Observer for TraceFileObserver {
    fn name(&self) -> &'static str {
        "TraceFileObserver"
    }

    fn pre_exec(&mut self, workdir: &Path) -> Result<Vec<(String, OsString)>, anyhow::Error> {
        self.reset();
        let path = workdir.join(Self::TRACE_FILENAME);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to clear stale trace file {:?}: {}",
                    path,
                    e
                ));
            }
        }
        let env = vec![(TRACE_ENV_VAR.to_string(), path.clone().into_os_string())];
        self.trace_path = Some(path);
        Ok(env)
    }

    fn post_exec(&mut self, status: &ExitClass) -> Result<(), anyhow::Error> {
        let Some(path) = self.trace_path.as_ref() else {
            return Err(anyhow::anyhow!("post_exec called without pre_exec"));
        };
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            // A harness that died before its first flush leaves no file.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(anyhow::anyhow!("Failed to read trace file {:?}: {}", path, e));
            }
        };
        self.trace = CoverageTrace::parse(&String::from_utf8_lossy(&bytes));
        log::trace!(
            "{}: {} trace events after {:?}",
            self.name(),
            self.trace.events().len(),
            status
        );
        Ok(())
    }

    fn take_trace(&mut self) -> CoverageTrace {
        std::mem::take(&mut self.trace)
    }

    fn reset(&mut self) {
        self.trace_path = None;
        self.trace = CoverageTrace::default();
    }
}
