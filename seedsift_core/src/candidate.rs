use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Numeric identifier assigned to a candidate when it enters the store.
/// This is the value written to the `<ID>` header field.
pub type CandidateId = u64;

/// The generation strategy a candidate came from.
///
/// Origin tags partition each library's corpus on disk and let the selector
/// keep at least one seed per strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Origin {
    #[default]
    Example,
    Random,
    Rule,
    Repair,
    Custom(String),
}

impl Origin {
    pub fn as_str(&self) -> &str {
        match self {
            Origin::Example => "example",
            Origin::Random => "random",
            Origin::Rule => "rule",
            Origin::Repair => "repair",
            Origin::Custom(name) => name,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Origin {
    fn from(value: String) -> Self {
        match value.as_str() {
            "example" => Origin::Example,
            "random" => Origin::Random,
            "rule" => Origin::Rule,
            "repair" => Origin::Repair,
            _ => {
                // Custom tags become directory names; keep them path-safe and
                // away from the reserved `retired` area.
                let mut cleaned: String = value
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                            c
                        } else {
                            '_'
                        }
                    })
                    .collect();
                if cleaned.is_empty() {
                    cleaned.push_str("unknown");
                }
                if cleaned == "retired" {
                    cleaned.push('_');
                }
                Origin::Custom(cleaned)
            }
        }
    }
}

impl From<Origin> for String {
    fn from(value: Origin) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for Origin {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Origin::from(s.to_string()))
    }
}

/// MD5 digest of a harness's source text.
///
/// Two candidates with identical source are the same candidate for the
/// purposes of visit counting and idempotent persistence.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub [u8; 16]);

impl ContentHash {
    pub fn of(source: &str) -> Self {
        ContentHash(md5::compute(source.as_bytes()).0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid content hash {0:?}: expected 32 hex digits")]
pub struct ParseHashError(String);

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.is_ascii() {
            return Err(ParseHashError(s.to_string()));
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParseHashError(s.to_string()))?;
        }
        Ok(ContentHash(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// A self-contained call sequence against one library's public surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub library: String,
    pub id: CandidateId,
    pub prompt: Option<String>,
    /// API symbols the generator was asked to combine.
    pub combination: Vec<String>,
    pub origin: Origin,
    pub source: String,
}

impl Candidate {
    pub fn new(library: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            id: 0,
            prompt: None,
            combination: Vec::new(),
            origin: Origin::default(),
            source: source.into(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_combination<S: Into<String>>(
        mut self,
        symbols: impl IntoIterator<Item = S>,
    ) -> Self {
        self.combination = symbols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of(&self.source)
    }
}

/// Provenance kept by the store after a candidate has been handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub prompt: Option<String>,
    pub combination: Vec<String>,
    pub origin: Origin,
    pub hash: ContentHash,
}

/// Holds candidates between generation and execution.
///
/// A store assigns monotonically increasing ids and hands each candidate out
/// exactly once. Provenance survives checkout so the orchestrator can report on
/// a candidate after its source has moved on to the executor.
pub trait CandidateStore: Send {
    /// Registers a new candidate and returns its assigned id. Any id already
    /// set on the candidate is overwritten.
    fn submit(&mut self, candidate: Candidate) -> CandidateId;

    /// Removes and returns a pending candidate. A second checkout of the same
    /// id returns `None`.
    fn checkout(&mut self, id: CandidateId) -> Option<Candidate>;

    fn provenance(&self, id: CandidateId) -> Option<&Provenance>;

    /// Number of candidates submitted but not yet checked out.
    fn pending(&self) -> usize;

    /// The id the next submitted candidate will receive.
    fn next_id(&self) -> CandidateId;
}

#[derive(Debug, Default)]
pub struct InMemoryCandidateStore {
    next_id: CandidateId,
    pending: BTreeMap<CandidateId, Candidate>,
    provenance: BTreeMap<CandidateId, Provenance>,
}

impl InMemoryCandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts id assignment at `first_id`, used to continue numbering after
    /// the ids already present in a persisted corpus.
    pub fn starting_at(first_id: CandidateId) -> Self {
        Self {
            next_id: first_id,
            ..Self::default()
        }
    }
}

impl CandidateStore for InMemoryCandidateStore {
    fn submit(&mut self, mut candidate: Candidate) -> CandidateId {
        let id = self.next_id;
        self.next_id += 1;
        candidate.id = id;
        self.provenance.insert(
            id,
            Provenance {
                prompt: candidate.prompt.clone(),
                combination: candidate.combination.clone(),
                origin: candidate.origin.clone(),
                hash: candidate.content_hash(),
            },
        );
        self.pending.insert(id, candidate);
        id
    }

    fn checkout(&mut self, id: CandidateId) -> Option<Candidate> {
        self.pending.remove(&id)
    }

    fn provenance(&self, id: CandidateId) -> Option<&Provenance> {
        self.provenance.get(&id)
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn next_id(&self) -> CandidateId {
        self.next_id
    }
}
