use crate::candidate::{Candidate, Origin};
use crate::executor::{isolate, read_tail, wait_with_deadline};
use crate::frontier::FrontierSnapshot;
use crate::library::SymbolTable;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::seed_format;
use crate::writer::CorpusWriter;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("generator I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("seed directory {0:?} does not exist")]
    MissingRoot(PathBuf),
    #[error("failed to spawn generator {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("generator exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("generator timed out after {0:?}")]
    TimedOut(Duration),
    #[error("generator process: {0}")]
    Process(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Produces candidate harnesses for one library.
///
/// `Ok(None)` means the generator is exhausted. Errors are per-candidate: the
/// caller may keep asking.
pub trait Generator: Send {
    fn generate(
        &mut self,
        symbols: &SymbolTable,
        snapshot: &FrontierSnapshot,
    ) -> Result<Option<Candidate>, GeneratorError>;

    /// Outcome of a candidate this generator produced.
    fn report(&mut self, _candidate: &Candidate, _admitted: bool) {}
}

/// Replays harness files from a directory tree. Files in a sub-directory get
/// that sub-directory's name as origin tag; an annotated header, when
/// present, supplies prompt and combination.
#[derive(Debug)]
pub struct DirectoryGenerator {
    library: String,
    pending: VecDeque<(PathBuf, Origin)>,
}

impl DirectoryGenerator {
    /// Collects every harness under `root`, sorted by path.
    ///
    /// # Errors
    ///
    /// `MissingRoot` when `root` is not a directory, `Io` when the walk fails.
    pub fn new(library: impl Into<String>, root: &Path) -> Result<Self, GeneratorError> {
        if !root.is_dir() {
            return Err(GeneratorError::MissingRoot(root.to_path_buf()));
        }
        let mut files = Vec::new();
        collect_files(root, root, &mut files)?;
        files.sort();
        let pending = files
            .into_iter()
            .map(|path| {
                let origin = match path.strip_prefix(root).ok().and_then(origin_component) {
                    Some(dir) => Origin::from(dir),
                    None => Origin::Example,
                };
                (path, origin)
            })
            .collect();
        Ok(Self {
            library: library.into(),
            pending,
        })
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

/// First directory component of a relative path that also has a file name.
fn origin_component(rel: &Path) -> Option<String> {
    let mut parts = rel.components();
    let first = parts.next()?;
    parts.next()?;
    Some(first.as_os_str().to_string_lossy().into_owned())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), GeneratorError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') || name == CorpusWriter::INDEX_FILENAME || name.ends_with(".tmp") {
            continue;
        }
        if path.is_dir() {
            // Retired seeds are not replayed when re-curating a corpus.
            if dir == root && name == CorpusWriter::RETIRED_DIR {
                continue;
            }
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

impl Generator for DirectoryGenerator {
    fn generate(
        &mut self,
        _symbols: &SymbolTable,
        _snapshot: &FrontierSnapshot,
    ) -> Result<Option<Candidate>, GeneratorError> {
        while let Some((path, origin)) = self.pending.pop_front() {
            let text = match fs::read(&path) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        log::warn!("skipping non-UTF-8 harness {:?}", path);
                        continue;
                    }
                },
                Err(e) => return Err(e.into()),
            };

            let candidate = if seed_format::has_header(&text) {
                match seed_format::parse(&text) {
                    Ok(seed) => {
                        let mut c = Candidate::new(&self.library, seed.body)
                            .with_combination(seed.combination)
                            .with_origin(origin);
                        if let Some(prompt) = seed.prompt {
                            c = c.with_prompt(prompt);
                        }
                        c
                    }
                    Err(e) => {
                        log::warn!("{:?}: unreadable header ({}), using file as-is", path, e);
                        Candidate::new(&self.library, text).with_origin(origin)
                    }
                }
            } else {
                Candidate::new(&self.library, text).with_origin(origin)
            };
            return Ok(Some(candidate));
        }
        Ok(None)
    }
}

/// Settings for [`CommandGenerator`].
#[derive(Debug, Clone)]
pub struct CommandGeneratorSettings {
    pub command: Vec<String>,
    pub origin: Origin,
    pub max_candidates: Option<u64>,
    pub timeout: Duration,
}

/// Runs an external command once per candidate. The scheduled combination is
/// passed in `SEEDSIFT_COMBINATION`, and the command's stdout is the harness.
/// Empty output means the command has nothing more to offer.
pub struct CommandGenerator {
    library: String,
    settings: CommandGeneratorSettings,
    scheduler: Box<dyn Scheduler>,
    produced: u64,
}

const GENERATOR_STDERR_BYTES: u64 = 2048;

impl CommandGenerator {
    /// # Arguments
    ///
    /// * `library` - exported to the command as `SEEDSIFT_LIBRARY`.
    /// * `settings` - command line, origin tag, candidate cap and timeout.
    /// * `scheduler` - picks the symbol combination for each invocation.
    pub fn new(
        library: impl Into<String>,
        settings: CommandGeneratorSettings,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        Self {
            library: library.into(),
            settings,
            scheduler,
            produced: 0,
        }
    }

    fn run_once(
        &self,
        combination: &[String],
        snapshot: &FrontierSnapshot,
    ) -> Result<String, GeneratorError> {
        let Some((program, args)) = self.settings.command.split_first() else {
            return Err(GeneratorError::Process("empty generator command".to_string()));
        };
        let scratch = tempfile::tempdir()?;
        let stdout_path = scratch.path().join("stdout");
        let stderr_path = scratch.path().join("stderr");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("SEEDSIFT_LIBRARY", &self.library)
            .env("SEEDSIFT_COMBINATION", combination.join(","))
            .env("SEEDSIFT_COVERED_SITES", snapshot.covered_sites.to_string())
            .env("SEEDSIFT_SEEDS", snapshot.seeds.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(fs::File::create(&stdout_path)?))
            .stderr(Stdio::from(fs::File::create(&stderr_path)?));
        isolate(&mut cmd);
        let child = cmd
            .spawn()
            .map_err(|source| GeneratorError::Spawn {
                program: program.clone(),
                source,
            })?;

        let status = wait_with_deadline(child, self.settings.timeout)
            .map_err(|e| GeneratorError::Process(e.to_string()))?
            .ok_or(GeneratorError::TimedOut(self.settings.timeout))?;
        if !status.success() {
            return Err(GeneratorError::Failed {
                status: status.to_string(),
                stderr: read_tail(&stderr_path, GENERATOR_STDERR_BYTES),
            });
        }
        let bytes = fs::read(&stdout_path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Generator for CommandGenerator {
    fn generate(
        &mut self,
        symbols: &SymbolTable,
        snapshot: &FrontierSnapshot,
    ) -> Result<Option<Candidate>, GeneratorError> {
        if self
            .settings
            .max_candidates
            .is_some_and(|max| self.produced >= max)
        {
            return Ok(None);
        }
        let combination = self.scheduler.next(symbols, snapshot)?;
        let source = self.run_once(&combination, snapshot)?;
        if source.trim().is_empty() {
            log::info!("{}: generator produced no output, treating as exhausted", self.library);
            return Ok(None);
        }
        self.produced += 1;
        let prompt = format!("Combine {}", combination.join(", "));
        Ok(Some(
            Candidate::new(&self.library, source)
                .with_prompt(prompt)
                .with_combination(combination)
                .with_origin(self.settings.origin.clone()),
        ))
    }

    fn report(&mut self, candidate: &Candidate, admitted: bool) {
        self.scheduler
            .report_feedback(&candidate.combination, admitted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::CombinationScheduler;
    use tempfile::tempdir;

    #[test]
    fn directory_generator_tags_origins_and_reads_headers() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("rule")).unwrap();
        fs::create_dir_all(root.join("retired")).unwrap();
        fs::write(root.join("a_plain.c"), "int a;").unwrap();
        let annotated = seed_format::render(
            9,
            Some("parse then delete"),
            &["cJSON_Parse".to_string(), "cJSON_Delete".to_string()],
            0.5,
            &Default::default(),
            "int b;",
        )
        .unwrap();
        fs::write(root.join("rule/id_000001.cc"), annotated).unwrap();
        fs::write(root.join("retired/id_000000.cc"), "int old;").unwrap();
        fs::write(root.join(CorpusWriter::INDEX_FILENAME), "{}").unwrap();

        let mut generator = DirectoryGenerator::new("cjson", root).unwrap();
        assert_eq!(generator.remaining(), 2);
        let symbols = SymbolTable::default();
        let snapshot = FrontierSnapshot::default();

        let first = generator.generate(&symbols, &snapshot).unwrap().unwrap();
        assert_eq!(first.source, "int a;");
        assert_eq!(first.origin, Origin::Example);

        let second = generator.generate(&symbols, &snapshot).unwrap().unwrap();
        assert_eq!(second.source, "int b;");
        assert_eq!(second.origin, Origin::Rule);
        assert_eq!(second.prompt.as_deref(), Some("parse then delete"));
        assert_eq!(second.combination, vec!["cJSON_Parse", "cJSON_Delete"]);

        assert!(generator.generate(&symbols, &snapshot).unwrap().is_none());
    }

    #[test]
    fn directory_generator_requires_root() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            DirectoryGenerator::new("cjson", &dir.path().join("missing")),
            Err(GeneratorError::MissingRoot(_))
        ));
    }

    fn command_generator(script: &str, max: Option<u64>) -> CommandGenerator {
        CommandGenerator::new(
            "zlib",
            CommandGeneratorSettings {
                command: vec!["sh".into(), "-c".into(), script.into()],
                origin: Origin::Custom("llm".into()),
                max_candidates: max,
                timeout: Duration::from_secs(5),
            },
            Box::new(CombinationScheduler::new(0, 2)),
        )
    }

    #[test]
    fn command_generator_passes_combination_and_reads_stdout() {
        let mut generator = command_generator(
            "echo \"# harness for $SEEDSIFT_LIBRARY: $SEEDSIFT_COMBINATION\"",
            Some(1),
        );
        let symbols = SymbolTable::new(["inflate", "inflateEnd"]);
        let snapshot = FrontierSnapshot::default();

        let candidate = generator.generate(&symbols, &snapshot).unwrap().unwrap();
        assert_eq!(candidate.combination.len(), 2);
        assert!(candidate.source.starts_with("# harness for zlib: "));
        assert!(candidate.source.contains("inflate"));
        assert_eq!(candidate.origin, Origin::Custom("llm".into()));
        assert!(candidate.prompt.unwrap().starts_with("Combine "));

        assert!(generator.generate(&symbols, &snapshot).unwrap().is_none(), "max reached");
    }

    #[test]
    fn command_generator_failures_are_errors() {
        let symbols = SymbolTable::new(["inflate"]);
        let snapshot = FrontierSnapshot::default();

        let mut failing = command_generator("echo boom >&2; exit 2", None);
        match failing.generate(&symbols, &snapshot) {
            Err(GeneratorError::Failed { stderr, .. }) => assert!(stderr.contains("boom")),
            other => panic!("Expected Failed, got {other:?}"),
        }

        let mut silent = command_generator("true", None);
        assert!(silent.generate(&symbols, &snapshot).unwrap().is_none());

        let mut no_symbols = command_generator("echo x", None);
        assert!(matches!(
            no_symbols.generate(&SymbolTable::default(), &snapshot),
            Err(GeneratorError::Scheduler(SchedulerError::NoSymbols))
        ));
    }
}
