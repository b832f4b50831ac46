pub mod backend;
pub mod candidate;
pub mod config;
pub mod executor;
pub mod frontier;
pub mod generator;
pub mod library;
pub mod observer;
pub mod oracle;
pub mod orchestrator;
pub mod report;
pub mod scheduler;
pub mod scorer;
pub mod seed_format;
pub mod selector;
pub mod writer;

pub use backend::{BuildOutcome, CommandBackend, TargetBackend};
pub use candidate::{Candidate, CandidateId, CandidateStore, ContentHash, InMemoryCandidateStore, Origin};
pub use config::{ConfigError, SiftConfig};
pub use executor::{ExecutionResult, Executor, ExecutorError, ExitClass, SandboxExecutor, SandboxLimits};
pub use frontier::{AdmittedSeed, Frontier, FrontierSnapshot, SeedEntry, SeedRole, StableId};
pub use generator::{CommandGenerator, DirectoryGenerator, Generator, GeneratorError};
pub use library::{CriticalCallPolicy, CriticalPair, LibraryProfile, SymbolTable};
pub use observer::{CoverageTrace, Observer, TraceFileObserver};
pub use oracle::{Finding, FindingKind, LifecycleOracle, Oracle};
pub use orchestrator::{LibraryRun, Orchestrator, RunOptions};
pub use report::{LibraryReport, RunReport, StopReason};
pub use scheduler::{CombinationScheduler, Scheduler, SchedulerError};
pub use scorer::{QualityRecord, ScoreWeights, Scorer, VisitLedger};
pub use seed_format::{SeedFile, SeedFormatError};
pub use selector::{Decision, Persisted, SeedSink, Selector, SelectorError, Transition};
pub use writer::{CorpusWriter, WriterError};
