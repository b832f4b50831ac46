use crate::library::{CriticalCallPolicy, CriticalPair, LibraryProfile, SymbolTable};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no [[library]] entries configured")]
    NoLibraries,
    #[error("library {0:?} is configured more than once")]
    DuplicateLibrary(String),
    #[error("library {library:?}: {reason}")]
    InvalidLibrary { library: String, reason: String },
    #[error("library {library:?}: failed to read symbols file {path:?}: {source}")]
    SymbolsFile {
        library: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("engine setting {0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: PathBuf,
    #[serde(default = "default_candidate_timeout_ms")]
    pub candidate_timeout_ms: u64,
    #[serde(default = "default_compile_timeout_ms")]
    pub compile_timeout_ms: u64,
    /// Wall-clock budget for the whole run. `None` runs until every generator
    /// is exhausted or converged.
    #[serde(default)]
    pub run_budget_secs: Option<u64>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Resident-memory ceiling per harness run, also handed to sanitizers as
    /// `hard_rss_limit_mb`. The address space is never capped.
    #[serde(default = "default_rss_limit_mb")]
    pub rss_limit_mb: Option<u64>,
    #[serde(default = "default_infra_retries")]
    pub infra_retries: u32,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    /// Stop a library after this many consecutive candidates changed nothing.
    #[serde(default)]
    pub converge_after: Option<u64>,
    /// Re-validate the admitted corpus every this many processed candidates.
    #[serde(default)]
    pub revalidate_every: Option<u64>,
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,
    #[serde(default = "default_crash_codes")]
    pub crash_codes: Vec<i32>,
    #[serde(default)]
    pub prefer_origin_diversity: bool,
}

pub fn default_corpus_dir() -> PathBuf {
    PathBuf::from("./seedsift_corpus")
}

fn default_candidate_timeout_ms() -> u64 {
    5000
}

fn default_compile_timeout_ms() -> u64 {
    60_000
}

pub fn default_concurrency() -> usize {
    4
}

fn default_rss_limit_mb() -> Option<u64> {
    Some(2048)
}

fn default_infra_retries() -> u32 {
    3
}

fn default_retry_initial_ms() -> u64 {
    200
}

/// `66` is what a harness returns when it runs to completion.
pub fn default_success_codes() -> Vec<i32> {
    vec![0, 66]
}

/// Sanitizer builds are configured to exit with 168 on a report.
pub fn default_crash_codes() -> Vec<i32> {
    vec![168]
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            corpus_dir: default_corpus_dir(),
            candidate_timeout_ms: default_candidate_timeout_ms(),
            compile_timeout_ms: default_compile_timeout_ms(),
            run_budget_secs: None,
            concurrency: default_concurrency(),
            rss_limit_mb: default_rss_limit_mb(),
            infra_retries: default_infra_retries(),
            retry_initial_ms: default_retry_initial_ms(),
            converge_after: None,
            revalidate_every: None,
            success_codes: default_success_codes(),
            crash_codes: default_crash_codes(),
            prefer_origin_diversity: false,
        }
    }
}

impl EngineSettings {
    pub fn candidate_timeout(&self) -> Duration {
        Duration::from_millis(self.candidate_timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn run_budget(&self) -> Option<Duration> {
        self.run_budget_secs.map(Duration::from_secs)
    }

    pub fn rss_limit_bytes(&self) -> Option<u64> {
        self.rss_limit_mb.map(|mb| mb * 1024 * 1024)
    }
}

/// Weights of the scalar score. See [`crate::scorer::ScoreWeights`].
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ScoringSettings {
    #[serde(default = "default_density_weight")]
    pub density_weight: f64,
    #[serde(default = "default_novelty_weight")]
    pub novelty_weight: f64,
    #[serde(default = "default_staleness_weight")]
    pub staleness_weight: f64,
}

fn default_density_weight() -> f64 {
    1.0
}

fn default_novelty_weight() -> f64 {
    1.0
}

fn default_staleness_weight() -> f64 {
    0.25
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            density_weight: default_density_weight(),
            novelty_weight: default_novelty_weight(),
            staleness_weight: default_staleness_weight(),
        }
    }
}

/// How to build and run a harness for one library.
///
/// Templates expand `{source}`, `{binary}` and `{workdir}` inside each
/// argument. An argument that is exactly `{instrument}` expands to the
/// instrumentation flags; without it the flags are appended.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    pub compile: Vec<String>,
    #[serde(default)]
    pub instrument: Vec<String>,
    #[serde(default = "default_run_template")]
    pub run: Vec<String>,
    #[serde(default = "default_source_extension")]
    pub source_extension: String,
}

fn default_run_template() -> Vec<String> {
    vec!["{binary}".to_string()]
}

pub fn default_source_extension() -> String {
    "cc".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case")]
#[serde(tag = "kind")]
pub enum GeneratorSettings {
    /// Replays harness files found under `path`.
    Directory { path: PathBuf },
    /// Runs `command` once per candidate and takes its stdout as the harness.
    Command {
        command: Vec<String>,
        #[serde(default)]
        origin: Option<String>,
        #[serde(default)]
        seed: u64,
        #[serde(default = "default_combination_size")]
        combination_size: usize,
        #[serde(default)]
        max_candidates: Option<u64>,
    },
}

fn default_combination_size() -> usize {
    3
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LibraryConfig {
    pub name: String,
    #[serde(default)]
    pub total_branch_sites: Option<u64>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub symbols_file: Option<PathBuf>,
    /// Replaces the built-in critical-call table when present.
    #[serde(default)]
    pub critical_pairs: Option<Vec<CriticalPair>>,
    pub backend: BackendSettings,
    pub generator: GeneratorSettings,
}

impl LibraryConfig {
    /// Builds the static profile, reading `symbols-file` relative to `base_dir`.
    pub fn profile(&self, base_dir: &Path) -> Result<LibraryProfile, ConfigError> {
        let mut symbols: Vec<String> = self.symbols.clone();
        if let Some(file) = &self.symbols_file {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                base_dir.join(file)
            };
            let text =
                std::fs::read_to_string(&path).map_err(|source| ConfigError::SymbolsFile {
                    library: self.name.clone(),
                    path: path.clone(),
                    source,
                })?;
            symbols.extend(SymbolTable::parse(&text).symbols().iter().cloned());
        }

        let mut profile = LibraryProfile::new(&self.name).with_symbols(SymbolTable::new(symbols));
        if let Some(pairs) = &self.critical_pairs {
            profile = profile.with_policy(CriticalCallPolicy::new(pairs.clone()));
        }
        if let Some(total) = self.total_branch_sites {
            profile = profile.with_total_branch_sites(total);
        }
        Ok(profile)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SiftConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub scoring: ScoringSettings,
    #[serde(default, rename = "library")]
    pub libraries: Vec<LibraryConfig>,
}

impl SiftConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SiftConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks the invariants the engine relies on before any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.libraries.is_empty() {
            return Err(ConfigError::NoLibraries);
        }
        if self.engine.concurrency == 0 {
            return Err(ConfigError::Zero("concurrency"));
        }
        if self.engine.candidate_timeout_ms == 0 {
            return Err(ConfigError::Zero("candidate-timeout-ms"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for lib in &self.libraries {
            if !seen.insert(lib.name.as_str()) {
                return Err(ConfigError::DuplicateLibrary(lib.name.clone()));
            }
            let invalid = |reason: &str| ConfigError::InvalidLibrary {
                library: lib.name.clone(),
                reason: reason.to_string(),
            };
            if lib.name.is_empty() || lib.name.contains(['/', '\\']) || lib.name.starts_with('.') {
                return Err(invalid("name must be a plain directory name"));
            }
            if lib.backend.compile.is_empty() {
                return Err(invalid("backend.compile must not be empty"));
            }
            if lib.backend.run.is_empty() {
                return Err(invalid("backend.run must not be empty"));
            }
            if let GeneratorSettings::Command { command, .. } = &lib.generator {
                if command.is_empty() {
                    return Err(invalid("generator.command must not be empty"));
                }
            }
        }
        Ok(())
    }

    /// Keeps only the named libraries. Unknown names are an error.
    pub fn restrict_to(&mut self, names: &[String]) -> Result<(), ConfigError> {
        if names.is_empty() {
            return Ok(());
        }
        for name in names {
            if !self.libraries.iter().any(|l| &l.name == name) {
                return Err(ConfigError::InvalidLibrary {
                    library: name.clone(),
                    reason: "not present in the configuration".to_string(),
                });
            }
        }
        self.libraries.retain(|l| names.contains(&l.name));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[engine]
corpus-dir = "out"
candidate-timeout-ms = 1500
concurrency = 2
converge-after = 50

[scoring]
staleness-weight = 0.5

[[library]]
name = "cjson"
total-branch-sites = 1200
symbols = ["cJSON_Parse", "cJSON_Delete"]

[library.backend]
compile = ["clang", "{instrument}", "{source}", "-o", "{binary}"]
instrument = ["-fsanitize=address"]

[library.generator]
kind = "directory"
path = "seeds/cjson"

[[library]]
name = "zlib"
symbols-file = "zlib.syms"
critical-pairs = [{ acquire = "inflateInit_", release = ["inflateEnd"] }]

[library.backend]
compile = ["cc", "{source}", "-o", "{binary}"]
source-extension = "c"

[library.generator]
kind = "command"
command = ["./gen.sh"]
seed = 7
"#;

    #[test]
    fn parses_full_config_with_defaults() {
        let config: SiftConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.engine.corpus_dir, PathBuf::from("out"));
        assert_eq!(config.engine.candidate_timeout(), Duration::from_millis(1500));
        assert_eq!(config.engine.success_codes, vec![0, 66]);
        assert_eq!(config.engine.crash_codes, vec![168]);
        assert_eq!(config.engine.converge_after, Some(50));
        assert_eq!(config.scoring.density_weight, 1.0);
        assert_eq!(config.scoring.staleness_weight, 0.5);

        assert_eq!(config.libraries.len(), 2);
        let cjson = &config.libraries[0];
        assert_eq!(cjson.backend.run, vec!["{binary}"]);
        assert_eq!(cjson.backend.source_extension, "cc");
        assert!(matches!(cjson.generator, GeneratorSettings::Directory { .. }));
        match &config.libraries[1].generator {
            GeneratorSettings::Command {
                seed,
                combination_size,
                ..
            } => {
                assert_eq!(*seed, 7);
                assert_eq!(*combination_size, 3);
            }
            other => panic!("unexpected generator {other:?}"),
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let text = "[engine]\nconcurency = 2\n";
        assert!(toml::from_str::<SiftConfig>(text).is_err());
    }

    #[test]
    fn profile_merges_symbols_file_and_policy_override() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("zlib.syms"), "inflate\ninflateEnd\n").unwrap();
        let config: SiftConfig = toml::from_str(SAMPLE).unwrap();

        let zlib = config.libraries[1].profile(dir.path()).unwrap();
        assert!(zlib.symbols.contains("inflate"));
        assert_eq!(zlib.policy.pairs().len(), 1);
        assert!(!zlib.policy.is_critical("deflateEnd"));

        let cjson = config.libraries[0].profile(dir.path()).unwrap();
        assert_eq!(cjson.total_branch_sites, Some(1200));
        assert!(cjson.policy.is_critical("cJSON_Delete"));
    }

    #[test]
    fn validate_catches_duplicates_and_restrict_filters() {
        let mut config: SiftConfig = toml::from_str(SAMPLE).unwrap();
        let mut dup = config.clone();
        dup.libraries.push(dup.libraries[0].clone());
        assert!(matches!(dup.validate(), Err(ConfigError::DuplicateLibrary(_))));

        config.restrict_to(&["zlib".to_string()]).unwrap();
        assert_eq!(config.libraries.len(), 1);
        assert!(config.restrict_to(&["sqlite".to_string()]).is_err());
    }

    #[test]
    fn load_from_file_reports_missing_file() {
        let dir = tempdir().unwrap();
        let err = SiftConfig::load_from_file(&dir.path().join("none.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
