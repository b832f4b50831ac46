use crate::backend::{BuildOutcome, TargetBackend};
use crate::candidate::{Candidate, CandidateId, ContentHash};
use crate::observer::CoverageTrace;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// How a candidate's execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClass {
    /// Exit code in the configured success set.
    Success,
    /// Any other exit code.
    NonZero(i32),
    /// Killed by a signal, or exited with a configured sanitizer code.
    Crash {
        signal: Option<i32>,
        code: Option<i32>,
    },
    Timeout,
    /// The harness never ran. Carries the compiler diagnostic.
    CompileError(String),
}

impl ExitClass {
    pub fn label(&self) -> &'static str {
        match self {
            ExitClass::Success => "success",
            ExitClass::NonZero(_) => "non-zero",
            ExitClass::Crash { .. } => "crash",
            ExitClass::Timeout => "timeout",
            ExitClass::CompileError(_) => "compile-error",
        }
    }

    /// Whether the harness ran at all, so that its trace means something.
    pub fn ran(&self) -> bool {
        !matches!(self, ExitClass::CompileError(_))
    }
}

/// Outcome of one execution. Immutable once built.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    candidate_id: CandidateId,
    hash: ContentHash,
    exit: ExitClass,
    duration: Duration,
    trace: CoverageTrace,
    stderr_tail: String,
}

impl ExecutionResult {
    pub fn new(
        candidate: &Candidate,
        exit: ExitClass,
        duration: Duration,
        trace: CoverageTrace,
        stderr_tail: String,
    ) -> Self {
        Self {
            candidate_id: candidate.id,
            hash: candidate.content_hash(),
            exit,
            duration,
            trace,
            stderr_tail,
        }
    }

    pub fn candidate_id(&self) -> CandidateId {
        self.candidate_id
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn exit(&self) -> &ExitClass {
        &self.exit
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn trace(&self) -> &CoverageTrace {
        &self.trace
    }

    pub fn stderr_tail(&self) -> &str {
        &self.stderr_tail
    }
}

/// Failures of the execution machinery itself. These are never attributed to
/// the candidate.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to create working directory: {0}")]
    Workdir(#[source] std::io::Error),
    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("failed to kill timed-out process: {0}")]
    Kill(#[source] std::io::Error),
    #[error("failed to stage files in the working directory: {0}")]
    Stage(#[source] std::io::Error),
    #[error("coverage observer {observer} failed: {message}")]
    Observer { observer: String, message: String },
    #[error("backend misconfigured: {0}")]
    Backend(String),
    #[error("executor panicked: {0}")]
    Panicked(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ExecutorError {
    /// Whether retrying the same execution might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutorError::Workdir(_) | ExecutorError::Wait(_) | ExecutorError::Stage(_) => true,
            ExecutorError::Spawn { source, .. } => is_resource_exhaustion(source),
            ExecutorError::Kill(_)
            | ExecutorError::Observer { .. }
            | ExecutorError::Backend(_)
            | ExecutorError::Panicked(_)
            | ExecutorError::RetriesExhausted { .. } => false,
        }
    }
}

fn is_resource_exhaustion(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(
            err.raw_os_error(),
            Some(libc::EAGAIN) | Some(libc::ENOMEM) | Some(libc::EMFILE) | Some(libc::ENFILE)
        )
    }
    #[cfg(not(unix))]
    {
        err.kind() == std::io::ErrorKind::OutOfMemory
    }
}

/// Compiles and runs one candidate in isolation.
pub trait Executor: Send + Sync {
    /// Builds `candidate` against `build` and runs it once.
    ///
    /// # Arguments
    ///
    /// * `candidate` - the harness source to compile and run.
    /// * `build` - the library backend that compiles and launches it.
    /// * `time_budget` - wall-clock cutoff for the run, compilation excluded.
    ///
    /// # Errors
    ///
    /// Only for failures of the machinery itself. Compile errors, crashes and
    /// timeouts are outcomes of the candidate and come back as `Ok`.
    fn execute(
        &self,
        candidate: &Candidate,
        build: &dyn TargetBackend,
        time_budget: Duration,
    ) -> Result<ExecutionResult, ExecutorError>;
}

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub compile_timeout: Duration,
    /// Resident-set ceiling for the harness process. Virtual memory is left
    /// alone so sanitizer shadow reservations still succeed.
    pub rss_limit_bytes: Option<u64>,
    pub success_codes: Vec<i32>,
    pub crash_codes: Vec<i32>,
    pub infra_retries: u32,
    pub retry_initial: Duration,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(60),
            rss_limit_bytes: None,
            success_codes: crate::config::default_success_codes(),
            crash_codes: crate::config::default_crash_codes(),
            infra_retries: 3,
            retry_initial: Duration::from_millis(200),
        }
    }
}

impl From<&crate::config::EngineSettings> for SandboxLimits {
    fn from(engine: &crate::config::EngineSettings) -> Self {
        Self {
            compile_timeout: engine.compile_timeout(),
            rss_limit_bytes: engine.rss_limit_bytes(),
            success_codes: engine.success_codes.clone(),
            crash_codes: engine.crash_codes.clone(),
            infra_retries: engine.infra_retries,
            retry_initial: Duration::from_millis(engine.retry_initial_ms),
        }
    }
}

/// Runs every execution in a fresh temporary directory with its own process
/// group, a hard wall-clock cutoff and a resident-memory ceiling.
pub struct SandboxExecutor {
    limits: SandboxLimits,
}

const STDERR_TAIL_BYTES: u64 = 4096;

impl SandboxExecutor {
    /// Creates an executor enforcing `limits` on every attempt.
    ///
    /// # Arguments
    ///
    /// * `limits` - applied to every attempt, retries included.
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    fn attempt(
        &self,
        candidate: &Candidate,
        build: &dyn TargetBackend,
        time_budget: Duration,
    ) -> Result<ExecutionResult, ExecutorError> {
        let workdir = tempfile::Builder::new()
            .prefix("seedsift-")
            .tempdir()
            .map_err(ExecutorError::Workdir)?;
        let started = Instant::now();

        let binary = match build.compile(candidate, workdir.path(), self.limits.compile_timeout)? {
            BuildOutcome::Built(binary) => binary,
            BuildOutcome::Failed(diagnostic) => {
                log::debug!(
                    "candidate {} failed to compile: {}",
                    candidate.id,
                    diagnostic.lines().next().unwrap_or("")
                );
                return Ok(ExecutionResult::new(
                    candidate,
                    ExitClass::CompileError(diagnostic),
                    started.elapsed(),
                    CoverageTrace::default(),
                    String::new(),
                ));
            }
        };

        let mut observer = build.coverage_observer();
        let env = observer
            .pre_exec(workdir.path())
            .map_err(|e| ExecutorError::Observer {
                observer: observer.name().to_string(),
                message: e.to_string(),
            })?;

        let stderr_path = workdir.path().join("run.stderr");
        let stderr_file = File::create(&stderr_path).map_err(ExecutorError::Stage)?;

        let mut cmd = build.run_command(&binary, workdir.path())?;
        cmd.current_dir(workdir.path())
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file));
        if let Some(bytes) = self.limits.rss_limit_bytes {
            cmd.env("ASAN_OPTIONS", asan_options_with_rss_limit(bytes));
        }
        isolate(&mut cmd);

        let program = format!("{:?}", cmd.get_program());
        let run_started = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|source| ExecutorError::Spawn { program, source })?;

        let exit = match wait_for_child(child, time_budget, self.limits.rss_limit_bytes)? {
            Waited::Exited(status) => self.classify(status),
            Waited::TimedOut => ExitClass::Timeout,
            Waited::OverMemory(rss) => {
                log::debug!(
                    "candidate {} killed at {} bytes resident",
                    candidate.id,
                    rss
                );
                ExitClass::Crash {
                    signal: Some(KILL_SIGNAL),
                    code: None,
                }
            }
        };
        let duration = run_started.elapsed();

        observer
            .post_exec(&exit)
            .map_err(|e| ExecutorError::Observer {
                observer: observer.name().to_string(),
                message: e.to_string(),
            })?;
        let trace = observer.take_trace();
        let stderr_tail = read_tail(&stderr_path, STDERR_TAIL_BYTES);

        log::trace!(
            "candidate {} -> {} in {:?} ({} trace events)",
            candidate.id,
            exit.label(),
            duration,
            trace.events().len()
        );
        Ok(ExecutionResult::new(
            candidate,
            exit,
            duration,
            trace,
            stderr_tail,
        ))
    }

    /// Maps a process exit status onto the engine's exit classes.
    ///
    /// A terminating signal is always a crash. Exit codes are looked up in
    /// the success set first, then in the crash set. Anything else is
    /// `NonZero`.
    pub fn classify(&self, status: ExitStatus) -> ExitClass {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitClass::Crash {
                    signal: Some(signal),
                    code: None,
                };
            }
        }
        match status.code() {
            Some(code) if self.limits.success_codes.contains(&code) => ExitClass::Success,
            Some(code) if self.limits.crash_codes.contains(&code) => ExitClass::Crash {
                signal: None,
                code: Some(code),
            },
            Some(code) => ExitClass::NonZero(code),
            None => ExitClass::Crash {
                signal: None,
                code: None,
            },
        }
    }
}

impl Executor for SandboxExecutor {
    fn execute(
        &self,
        candidate: &Candidate,
        build: &dyn TargetBackend,
        time_budget: Duration,
    ) -> Result<ExecutionResult, ExecutorError> {
        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.limits.retry_initial)
            .with_max_elapsed_time(None)
            .build();
        let max_attempts = self.limits.infra_retries + 1;
        let mut attempts = 0u32;

        let op = || {
            attempts += 1;
            match self.attempt(candidate, build, time_budget) {
                Ok(result) => Ok(result),
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    log::warn!(
                        "candidate {}: infrastructure failure (attempt {}/{}): {}",
                        candidate.id,
                        attempts,
                        max_attempts,
                        e
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) if e.is_transient() => {
                    Err(backoff::Error::permanent(ExecutorError::RetriesExhausted {
                        attempts,
                        last: e.to_string(),
                    }))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        };

        backoff::retry(policy, op).map_err(|e| match e {
            backoff::Error::Permanent(e) => e,
            backoff::Error::Transient { err, .. } => err,
        })
    }
}

#[cfg(unix)]
const KILL_SIGNAL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const KILL_SIGNAL: i32 = 9;

/// Puts the spawned process at the head of its own process group so that a
/// kill reaches everything it started.
pub(crate) fn isolate(cmd: &mut std::process::Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    let _ = cmd;
}

/// Inherited `ASAN_OPTIONS` with a hard RSS limit appended.
fn asan_options_with_rss_limit(bytes: u64) -> String {
    let limit = format!("hard_rss_limit_mb={}", (bytes / (1024 * 1024)).max(1));
    match std::env::var("ASAN_OPTIONS") {
        Ok(existing) if !existing.trim().is_empty() => format!("{existing}:{limit}"),
        _ => limit,
    }
}

/// Resident set size of `pid` in bytes, if the platform exposes it.
#[cfg(target_os = "linux")]
fn resident_bytes(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(page_size).ok().map(|size| pages * size)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes(_pid: u32) -> Option<u64> {
    None
}

/// Kills the whole process group led by `child`.
fn kill_group(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let pgid = child.id() as libc::pid_t;
        // SAFETY: killpg only sends a signal.
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
            return Ok(());
        }
    }
    child.kill()
}

/// Sweeps what is left of a group whose leader already exited.
fn reap_stragglers(child: &Child) {
    #[cfg(unix)]
    {
        // SAFETY: killpg only sends a signal. ESRCH means nothing was left.
        unsafe {
            libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

#[derive(Debug)]
pub(crate) enum Waited {
    Exited(ExitStatus),
    TimedOut,
    /// Killed after its resident set grew past the ceiling. Carries the last
    /// measurement.
    OverMemory(u64),
}

/// Polls `child` until it exits, `timeout` passes or its resident set grows
/// past `rss_limit`. The child must lead its own process group (see
/// [`isolate`]); on timeout or overuse the whole group is killed and the
/// leader reaped.
pub(crate) fn wait_for_child(
    mut child: Child,
    timeout: Duration,
    rss_limit: Option<u64>,
) -> Result<Waited, ExecutorError> {
    let start_time = Instant::now();

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                reap_stragglers(&child);
                return Ok(Waited::Exited(status));
            }
            Ok(None) => {
                let over = rss_limit
                    .and_then(|limit| resident_bytes(child.id()).filter(|rss| *rss > limit));
                let timed_out = start_time.elapsed() > timeout;
                if over.is_some() || timed_out {
                    log::debug!(
                        "child {} {}, killing its process group",
                        child.id(),
                        if timed_out { "timed out" } else { "exceeded its RSS limit" }
                    );
                    if let Err(e) = kill_group(&mut child) {
                        // Lost the race with a natural exit.
                        if let Ok(Some(status)) = child.try_wait() {
                            return Ok(Waited::Exited(status));
                        }
                        return Err(ExecutorError::Kill(e));
                    }
                    child.wait().map_err(ExecutorError::Wait)?;
                    return Ok(match over {
                        Some(rss) if !timed_out => Waited::OverMemory(rss),
                        _ => Waited::TimedOut,
                    });
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(ExecutorError::Wait(e)),
        }
    }
}

/// [`wait_for_child`] without a memory ceiling. Returns `None` when the child
/// had to be killed.
pub(crate) fn wait_with_deadline(
    child: Child,
    timeout: Duration,
) -> Result<Option<ExitStatus>, ExecutorError> {
    match wait_for_child(child, timeout, None)? {
        Waited::Exited(status) => Ok(Some(status)),
        Waited::TimedOut | Waited::OverMemory(_) => Ok(None),
    }
}

/// Last `max` bytes of a file, lossily decoded. Missing files read as empty.
pub(crate) fn read_tail(path: &Path, max: u64) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > max && file.seek(SeekFrom::Start(len - max)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CommandBackend;
    use crate::config::BackendSettings;
    use crate::observer::{Observer, TraceFileObserver};
    use std::path::PathBuf;
    use std::process::Command;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn get_test_target_path(name: &str) -> PathBuf {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        manifest_dir.join("../test_targets").join(name)
    }

    fn harness(name: &str) -> Candidate {
        let path = get_test_target_path(name);
        let source = std::fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("Test target missing: {path:?}: {e}"));
        Candidate::new("zlib", source)
    }

    fn shell_backend() -> CommandBackend {
        let cc = get_test_target_path("fake_cc.sh");
        CommandBackend::new(
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
        )
    }

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(SandboxLimits {
            compile_timeout: Duration::from_secs(5),
            retry_initial: Duration::from_millis(1),
            ..SandboxLimits::default()
        })
    }

    #[test]
    fn successful_run_collects_trace() {
        let _ = env_logger::builder().is_test(true).try_init();
        let result = executor()
            .execute(&harness("harness_ok.sh"), &shell_backend(), Duration::from_secs(2))
            .unwrap();
        assert_eq!(result.exit(), &ExitClass::Success);
        assert_eq!(
            result.trace().calls(),
            vec!["inflateInit_", "inflate", "inflateEnd"]
        );
        assert_eq!(result.trace().branch_hits().len(), 3);
    }

    #[test]
    fn crash_keeps_partial_trace() {
        let result = executor()
            .execute(
                &harness("harness_crash_after_acquire.sh"),
                &shell_backend(),
                Duration::from_secs(2),
            )
            .unwrap();
        match result.exit() {
            ExitClass::Crash { signal, .. } => assert_eq!(*signal, Some(libc::SIGSEGV)),
            other => panic!("Expected Crash, got {other:?}"),
        }
        assert_eq!(result.trace().calls(), vec!["inflateInit_", "inflate"]);
        assert_eq!(result.trace().in_progress(), vec!["inflate"]);
    }

    #[test]
    fn sanitizer_exit_code_is_a_crash() {
        let result = executor()
            .execute(
                &harness("harness_sanitizer.sh"),
                &shell_backend(),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(
            result.exit(),
            &ExitClass::Crash {
                signal: None,
                code: Some(168)
            }
        );
        assert!(result.stderr_tail().contains("AddressSanitizer"));
    }

    #[test]
    fn timeout_is_separate_from_crash() {
        let result = executor()
            .execute(
                &harness("harness_timeout.sh"),
                &shell_backend(),
                Duration::from_millis(200),
            )
            .unwrap();
        assert_eq!(result.exit(), &ExitClass::Timeout);
        assert_eq!(result.trace().branch_hits().len(), 1, "flushed lines survive the kill");
    }

    #[test]
    fn default_limits_leave_the_address_space_uncapped() {
        let limits = SandboxLimits::from(&crate::config::EngineSettings::default());
        assert_eq!(limits.rss_limit_bytes, Some(2048 * 1024 * 1024));
        let result = SandboxExecutor::new(limits)
            .execute(
                &harness("harness_sandbox_limits.sh"),
                &shell_backend(),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(result.exit(), &ExitClass::Success);
        let sites: Vec<String> = result.trace().branch_hits().into_keys().collect();
        assert!(sites.contains(&"vmem:unlimited".to_string()), "{sites:?}");
        assert!(
            sites
                .iter()
                .any(|s| s.starts_with("asan:") && s.ends_with("hard_rss_limit_mb=2048")),
            "{sites:?}"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn resident_memory_ceiling_kills_the_run() {
        let tiny = SandboxExecutor::new(SandboxLimits {
            rss_limit_bytes: Some(1),
            ..executor().limits().clone()
        });
        let result = tiny
            .execute(&harness("harness_timeout.sh"), &shell_backend(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(
            result.exit(),
            &ExitClass::Crash {
                signal: Some(libc::SIGKILL),
                code: None
            }
        );
        assert!(result.duration() < Duration::from_secs(4));
    }

    #[cfg(target_os = "linux")]
    fn is_alive(pid: u32) -> bool {
        // Zombies count as dead: only the reaper is missing.
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| !rest.starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_background_children() {
        let result = executor()
            .execute(
                &harness("harness_spawns_sleeper.sh"),
                &shell_backend(),
                Duration::from_millis(200),
            )
            .unwrap();
        assert_eq!(result.exit(), &ExitClass::Timeout);
        let pid: u32 = result
            .trace()
            .branch_hits()
            .keys()
            .find_map(|site| site.strip_prefix("child:")?.parse().ok())
            .expect("harness reports its child pid");

        let deadline = Instant::now() + Duration::from_secs(2);
        while is_alive(pid) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!is_alive(pid), "background child {pid} survived the timeout");
    }

    #[test]
    fn compile_error_carries_diagnostic() {
        let result = executor()
            .execute(
                &Candidate::new("zlib", "int main() { return 0 }"),
                &shell_backend(),
                Duration::from_secs(2),
            )
            .unwrap();
        match result.exit() {
            ExitClass::CompileError(diag) => assert!(diag.contains("error")),
            other => panic!("Expected CompileError, got {other:?}"),
        }
        assert!(result.trace().is_empty());
    }

    #[test]
    fn non_zero_exit_outside_success_set() {
        let result = executor()
            .execute(
                &harness("harness_exit_three.sh"),
                &shell_backend(),
                Duration::from_secs(2),
            )
            .unwrap();
        assert_eq!(result.exit(), &ExitClass::NonZero(3));
    }

    struct FlakyBackend {
        inner: CommandBackend,
        failures_left: AtomicU32,
    }

    impl TargetBackend for FlakyBackend {
        fn library(&self) -> &str {
            self.inner.library()
        }

        fn compile(
            &self,
            candidate: &Candidate,
            workdir: &Path,
            deadline: Duration,
        ) -> Result<BuildOutcome, ExecutorError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ExecutorError::Stage(std::io::Error::other("disk full")));
            }
            self.inner.compile(candidate, workdir, deadline)
        }

        fn run_command(&self, binary: &Path, workdir: &Path) -> Result<Command, ExecutorError> {
            self.inner.run_command(binary, workdir)
        }

        fn coverage_observer(&self) -> Box<dyn Observer> {
            Box::new(TraceFileObserver::new())
        }
    }

    #[test]
    fn transient_failures_are_retried_then_reported() {
        let flaky = FlakyBackend {
            inner: shell_backend(),
            failures_left: AtomicU32::new(2),
        };
        let result = executor()
            .execute(&harness("harness_ok.sh"), &flaky, Duration::from_secs(2))
            .unwrap();
        assert_eq!(result.exit(), &ExitClass::Success);

        let hopeless = FlakyBackend {
            inner: shell_backend(),
            failures_left: AtomicU32::new(100),
        };
        let err = executor()
            .execute(&harness("harness_ok.sh"), &hopeless, Duration::from_secs(2))
            .unwrap_err();
        match err {
            ExecutorError::RetriesExhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("Expected RetriesExhausted, got {other:?}"),
        }
    }

    #[test]
    fn read_tail_keeps_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "0123456789").unwrap();
        assert_eq!(read_tail(&path, 4), "6789");
        assert_eq!(read_tail(&dir.path().join("missing"), 4), "");
    }
}
