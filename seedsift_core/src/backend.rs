use crate::candidate::Candidate;
use crate::config::BackendSettings;
use crate::executor::{ExecutorError, isolate, read_tail, wait_with_deadline};
use crate::observer::{Observer, TraceFileObserver};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Result of building a harness against the library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(PathBuf),
    /// Compiler diagnostic, or a note that the compiler timed out.
    Failed(String),
}

/// What the engine needs from a library build: compile (with
/// instrumentation), run, and extract coverage.
pub trait TargetBackend: Send + Sync {
    fn library(&self) -> &str;

    /// Builds `candidate` inside `workdir`. Only infrastructure trouble is an
    /// `Err`; a rejected harness is `BuildOutcome::Failed`.
    fn compile(
        &self,
        candidate: &Candidate,
        workdir: &Path,
        deadline: Duration,
    ) -> Result<BuildOutcome, ExecutorError>;

    fn run_command(&self, binary: &Path, workdir: &Path) -> Result<Command, ExecutorError>;

    fn coverage_observer(&self) -> Box<dyn Observer>;
}

const DIAGNOSTIC_TAIL_BYTES: u64 = 8192;

/// A backend driven entirely by command templates from the configuration.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    library: String,
    settings: BackendSettings,
}

impl CommandBackend {
    /// # Arguments
    ///
    /// * `library` - library this backend builds harnesses for.
    /// * `settings` - compile and run command templates with their
    ///   `{source}`, `{binary}`, `{workdir}` and `{instrument}` placeholders.
    pub fn new(library: impl Into<String>, settings: BackendSettings) -> Self {
        Self {
            library: library.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    fn expand(&self, template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
        let mut args = Vec::with_capacity(template.len() + self.settings.instrument.len());
        let mut instrumented = false;
        for arg in template {
            if arg == "{instrument}" {
                args.extend(self.settings.instrument.iter().cloned());
                instrumented = true;
                continue;
            }
            let mut expanded = arg.clone();
            for (key, value) in vars {
                expanded = expanded.replace(key, value);
            }
            args.push(expanded);
        }
        if !instrumented {
            args.extend(self.settings.instrument.iter().cloned());
        }
        args
    }
}

fn path_str(path: &Path) -> Result<&str, ExecutorError> {
    path.to_str()
        .ok_or_else(|| ExecutorError::Backend(format!("path {path:?} is not valid UTF-8")))
}

impl TargetBackend for CommandBackend {
    fn library(&self) -> &str {
        &self.library
    }

    fn compile(
        &self,
        candidate: &Candidate,
        workdir: &Path,
        deadline: Duration,
    ) -> Result<BuildOutcome, ExecutorError> {
        let source = workdir.join(format!("harness.{}", self.settings.source_extension));
        let binary = workdir.join("harness");
        std::fs::write(&source, &candidate.source).map_err(ExecutorError::Stage)?;

        let args = self.expand(
            &self.settings.compile,
            &[
                ("{source}", path_str(&source)?),
                ("{binary}", path_str(&binary)?),
                ("{workdir}", path_str(workdir)?),
            ],
        );
        let Some((program, rest)) = args.split_first() else {
            return Err(ExecutorError::Backend("empty compile command".to_string()));
        };

        let log_path = workdir.join("compile.log");
        let log = File::create(&log_path).map_err(ExecutorError::Stage)?;
        let log_err = log.try_clone().map_err(ExecutorError::Stage)?;
        let mut cmd = Command::new(program);
        cmd.args(rest)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        isolate(&mut cmd);
        let child = cmd
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: program.clone(),
                source,
            })?;

        let outcome = match wait_with_deadline(child, deadline)? {
            Some(status) if status.success() && binary.exists() => BuildOutcome::Built(binary),
            Some(status) => {
                let mut diagnostic = read_tail(&log_path, DIAGNOSTIC_TAIL_BYTES);
                if diagnostic.trim().is_empty() {
                    diagnostic = format!("compiler exited with {status} and no output");
                }
                BuildOutcome::Failed(diagnostic)
            }
            None => BuildOutcome::Failed(format!("compiler timed out after {deadline:?}")),
        };
        Ok(outcome)
    }

    fn run_command(&self, binary: &Path, workdir: &Path) -> Result<Command, ExecutorError> {
        let mut args = Vec::with_capacity(self.settings.run.len());
        for arg in &self.settings.run {
            args.push(
                arg.replace("{binary}", path_str(binary)?)
                    .replace("{workdir}", path_str(workdir)?),
            );
        }
        let Some((program, rest)) = args.split_first() else {
            return Err(ExecutorError::Backend("empty run command".to_string()));
        };
        let mut cmd = Command::new(program);
        cmd.args(rest);
        Ok(cmd)
    }

    fn coverage_observer(&self) -> Box<dyn Observer> {
        Box::new(TraceFileObserver::new())
    }
}
