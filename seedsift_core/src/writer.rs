use crate::candidate::{CandidateId, ContentHash, Origin};
use crate::frontier::{AdmittedSeed, SeedEntry, SeedRole, StableId};
use crate::library::CriticalCallPolicy;
use crate::scorer::{QualityRecord, VisitLedger};
use crate::seed_format::{self, SeedFile, SeedFormatError};
use crate::selector::{Persisted, SeedSink};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WriterError {
    #[error("corpus I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corpus path {0:?} exists but is not a directory")]
    NotADirectory(PathBuf),
    #[error("failed to read corpus index {path:?}: {source}")]
    Index {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("seed file {path:?}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: SeedFormatError,
    },
    #[error("failed to render seed: {0}")]
    Render(#[from] SeedFormatError),
    #[error("unknown seed {0}")]
    UnknownSeed(StableId),
}

/// One seed as recorded in `corpus_index.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct IndexEntry {
    pub stable_id: StableId,
    pub candidate_id: CandidateId,
    pub hash: ContentHash,
    pub origin: Origin,
    pub role: SeedRole,
    pub score: f64,
    pub quality: QualityRecord,
    /// Location relative to the library directory.
    pub path: PathBuf,
    pub retired: bool,
}

impl IndexEntry {
    fn to_seed_entry(&self, policy: &CriticalCallPolicy) -> SeedEntry {
        SeedEntry {
            stable_id: self.stable_id,
            candidate_id: self.candidate_id,
            hash: self.hash,
            origin: self.origin.clone(),
            role: self.role,
            score: self.score,
            quality: self.quality.clone(),
            critical_pattern: policy.order_pattern(&self.quality.critical_calls),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
struct CorpusIndex {
    library: String,
    next_id: u64,
    entries: Vec<IndexEntry>,
    #[serde(default)]
    visits: BTreeMap<ContentHash, u64>,
}

/// Writes one library's seeds under `<corpus>/<library>/<origin>/id_NNNNNN.<ext>`
/// and keeps `<corpus>/<library>/corpus_index.json` in step with the files.
#[derive(Debug)]
pub struct CorpusWriter {
    library_dir: PathBuf,
    index_file_path: PathBuf,
    source_extension: String,
    index: CorpusIndex,
}

impl CorpusWriter {
    pub const INDEX_FILENAME: &'static str = "corpus_index.json";
    pub const RETIRED_DIR: &'static str = "retired";

    /// Opens the library's corpus directory, creating it or loading its index.
    ///
    /// # Arguments
    ///
    /// * `corpus_dir` - root shared by every library.
    /// * `library` - name of the sub-directory owned by this writer.
    /// * `source_extension` - extension of seed files, with or without the dot.
    ///
    /// # Errors
    ///
    /// Fails when the library path is not a directory, cannot be created, or
    /// holds an index that does not parse.
    pub fn open(
        corpus_dir: &Path,
        library: &str,
        source_extension: &str,
    ) -> Result<Self, WriterError> {
        let library_dir = corpus_dir.join(library);
        if !library_dir.exists() {
            fs::create_dir_all(&library_dir)?;
        } else if !library_dir.is_dir() {
            return Err(WriterError::NotADirectory(library_dir));
        }

        let index_file_path = library_dir.join(Self::INDEX_FILENAME);
        let mut writer = Self {
            library_dir,
            index_file_path,
            source_extension: source_extension.trim_start_matches('.').to_string(),
            index: CorpusIndex {
                library: library.to_string(),
                ..CorpusIndex::default()
            },
        };
        writer.load_index_from_disk()?;
        if !writer.index_file_path.exists() {
            writer.save_index_to_disk()?;
        }
        Ok(writer)
    }

    fn load_index_from_disk(&mut self) -> Result<(), WriterError> {
        if !self.index_file_path.is_file() {
            return Ok(());
        }
        let file = File::open(&self.index_file_path)?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let index: CorpusIndex =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| WriterError::Index {
                path: self.index_file_path.clone(),
                source,
            })?;
        log::debug!(
            "{}: loaded index with {} entries",
            index.library,
            index.entries.len()
        );
        self.index = index;
        Ok(())
    }

    /// Writes the index to a temporary file and renames it into place.
    fn save_index_to_disk(&self) -> Result<(), WriterError> {
        let tmp = self.index_file_path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut writer, &self.index).map_err(|source| {
                WriterError::Index {
                    path: tmp.clone(),
                    source,
                }
            })?;
            writer.flush()?;
        }
        fs::rename(&tmp, &self.index_file_path)?;
        Ok(())
    }

    fn active_path(&self, origin: &Origin, id: StableId) -> PathBuf {
        PathBuf::from(origin.as_str()).join(format!("{id}.{}", self.source_extension))
    }

    fn retired_path(&self, id: StableId) -> PathBuf {
        PathBuf::from(Self::RETIRED_DIR).join(format!("{id}.{}", self.source_extension))
    }

    fn position(&self, id: StableId) -> Result<usize, WriterError> {
        self.index
            .entries
            .iter()
            .position(|e| e.stable_id == id)
            .ok_or(WriterError::UnknownSeed(id))
    }

    /// Moves an entry's file to `to` and records the new location.
    fn relocate(&mut self, pos: usize, to: PathBuf) -> Result<(), WriterError> {
        let from = self.library_dir.join(&self.index.entries[pos].path);
        let dest = self.library_dir.join(&to);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&from, &dest)?;
        self.index.entries[pos].path = to;
        Ok(())
    }

    /// Puts back an entry whose change could not be saved, moving its file
    /// back if it had moved.
    fn roll_back(&mut self, pos: usize, before: IndexEntry) {
        if self.index.entries[pos].path != before.path {
            if let Err(e) = self.relocate(pos, before.path.clone()) {
                log::error!(
                    "{}: failed to move {} back to {:?}: {}",
                    self.index.library,
                    before.stable_id,
                    before.path,
                    e
                );
            }
        }
        self.index.entries[pos] = before;
    }

    pub fn library(&self) -> &str {
        &self.index.library
    }

    pub fn library_dir(&self) -> &Path {
        &self.library_dir
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.index.entries
    }

    pub fn len(&self) -> usize {
        self.index.entries.iter().filter(|e| !e.retired).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_entries(&self, policy: &CriticalCallPolicy) -> Vec<SeedEntry> {
        self.index
            .entries
            .iter()
            .filter(|e| !e.retired)
            .map(|e| e.to_seed_entry(policy))
            .collect()
    }

    pub fn retired_entries(&self, policy: &CriticalCallPolicy) -> Vec<SeedEntry> {
        self.index
            .entries
            .iter()
            .filter(|e| e.retired)
            .map(|e| e.to_seed_entry(policy))
            .collect()
    }

    /// Highest candidate id ever persisted, so a new run can keep numbering.
    pub fn max_candidate_id(&self) -> Option<CandidateId> {
        self.index.entries.iter().map(|e| e.candidate_id).max()
    }

    pub fn path_of(&self, id: StableId) -> Option<PathBuf> {
        self.index
            .entries
            .iter()
            .find(|e| e.stable_id == id)
            .map(|e| self.library_dir.join(&e.path))
    }

    pub fn read_seed(&self, id: StableId) -> Result<SeedFile, WriterError> {
        let path = self.path_of(id).ok_or(WriterError::UnknownSeed(id))?;
        let text = fs::read_to_string(&path)?;
        seed_format::parse(&text).map_err(|source| WriterError::Format { path, source })
    }

    pub fn visits(&self) -> VisitLedger {
        let mut ledger = VisitLedger::new();
        for (hash, count) in &self.index.visits {
            ledger.restore(*hash, *count);
        }
        ledger
    }

    pub fn record_visits(&mut self, ledger: &VisitLedger) -> Result<(), WriterError> {
        self.index.visits = ledger.iter().map(|(h, c)| (*h, *c)).collect();
        self.save_index_to_disk()
    }
}

impl SeedSink for CorpusWriter {
    /// Writes `seed` as `<origin>/id_NNNNNN.<ext>` and records it in the
    /// index. A harness already in the index, by content hash, is not written
    /// again; a retired one is reinstated with the seed's role.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or the index cannot be written. A new
    /// file is removed again when the index save fails.
    fn persist(&mut self, seed: &AdmittedSeed) -> Result<Persisted, WriterError> {
        let hash = seed.candidate.content_hash();
        if let Some(pos) = self.index.entries.iter().position(|e| e.hash == hash) {
            let entry = &self.index.entries[pos];
            let id = entry.stable_id;
            let reinstated = entry.retired;
            if reinstated {
                self.reinstate(id, seed.role)?;
            }
            log::debug!("{}: {} already holds this harness", self.index.library, id);
            return Ok(Persisted::Existing { id, reinstated });
        }

        let id = StableId(self.index.next_id);
        let rel_path = self.active_path(&seed.candidate.origin, id);
        let path = self.library_dir.join(&rel_path);
        let text = seed_format::render(
            seed.candidate.id,
            seed.candidate.prompt.as_deref(),
            &seed.candidate.combination,
            seed.score,
            &seed.quality,
            &seed.candidate.source,
        )?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;

        self.index.next_id += 1;
        self.index.entries.push(IndexEntry {
            stable_id: id,
            candidate_id: seed.candidate.id,
            hash,
            origin: seed.candidate.origin.clone(),
            role: seed.role,
            score: seed.score,
            quality: seed.quality.clone(),
            path: rel_path,
            retired: false,
        });
        if let Err(e) = self.save_index_to_disk() {
            self.index.entries.pop();
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        Ok(Persisted::Created(id))
    }

    fn retire(&mut self, id: StableId) -> Result<(), WriterError> {
        let pos = self.position(id)?;
        if self.index.entries[pos].retired {
            return Ok(());
        }
        let before = self.index.entries[pos].clone();
        self.relocate(pos, self.retired_path(id))?;
        self.index.entries[pos].retired = true;
        if let Err(e) = self.save_index_to_disk() {
            self.roll_back(pos, before);
            return Err(e);
        }
        Ok(())
    }

    fn reinstate(&mut self, id: StableId, role: SeedRole) -> Result<(), WriterError> {
        let pos = self.position(id)?;
        let before = self.index.entries[pos].clone();
        if before.retired {
            let to = self.active_path(&before.origin, id);
            self.relocate(pos, to)?;
        }
        let entry = &mut self.index.entries[pos];
        entry.retired = false;
        entry.role = role;
        if let Err(e) = self.save_index_to_disk() {
            self.roll_back(pos, before);
            return Err(e);
        }
        Ok(())
    }

    fn unpersist(&mut self, id: StableId) -> Result<(), WriterError> {
        let pos = self.position(id)?;
        let entry = self.index.entries.remove(pos);
        match fs::remove_file(self.library_dir.join(&entry.path)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.save_index_to_disk()
    }

    fn refresh(&mut self, id: StableId, quality: &QualityRecord) -> Result<(), WriterError> {
        let pos = self.position(id)?;
        let before = self.index.entries[pos].clone();
        self.index.entries[pos].quality = quality.clone();
        if let Err(e) = self.save_index_to_disk() {
            self.roll_back(pos, before);
            return Err(e);
        }
        Ok(())
    }
}
