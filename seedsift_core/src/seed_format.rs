//! The annotated seed file format.
//!
//! ```text
//! /*
//! <ID> 42
//! <Prompt> []
//! <Combination>: [cJSON_Parse, cJSON_Delete]
//! <score> 1.2500, nr_unique_branch: 17
//! <Quality> {"density":0.1,...}
//! */
//! <harness body>
//! ```

use crate::candidate::CandidateId;
use crate::scorer::QualityRecord;

#[derive(Debug, thiserror::Error)]
pub enum SeedFormatError {
    #[error("missing annotation header")]
    NoHeader,
    #[error("annotation header is not terminated")]
    Unterminated,
    #[error("missing header field {0}")]
    MissingField(&'static str),
    #[error("malformed header field {field}: {value:?}")]
    Malformed { field: &'static str, value: String },
    #[error("invalid quality record: {0}")]
    Quality(#[from] serde_json::Error),
}

/// Header fields plus the harness body of a seed file.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedFile {
    pub id: CandidateId,
    pub prompt: Option<String>,
    pub combination: Vec<String>,
    pub score: f64,
    pub quality: QualityRecord,
    pub body: String,
}

impl SeedFile {
    pub fn nr_unique_branch(&self) -> usize {
        self.quality.unique_branches.len()
    }
}

const OPEN: &str = "/*\n";
const CLOSE: &str = "*/\n";

fn render_prompt(prompt: Option<&str>) -> Result<String, SeedFormatError> {
    match prompt {
        None => Ok("[]".to_string()),
        // `\/` keeps a literal `*/` from closing the comment.
        Some(text) => Ok(serde_json::to_string(text)?.replace("*/", "*\\/")),
    }
}

pub fn render(
    id: CandidateId,
    prompt: Option<&str>,
    combination: &[String],
    score: f64,
    quality: &QualityRecord,
    body: &str,
) -> Result<String, SeedFormatError> {
    let quality_json = serde_json::to_string(quality)?.replace("*/", "*\\/");
    let mut out = String::with_capacity(body.len() + quality_json.len() + 128);
    out.push_str(OPEN);
    out.push_str(&format!("<ID> {id}\n"));
    out.push_str(&format!("<Prompt> {}\n", render_prompt(prompt)?));
    out.push_str(&format!("<Combination>: [{}]\n", combination.join(", ")));
    out.push_str(&format!(
        "<score> {:.4}, nr_unique_branch: {}\n",
        score,
        quality.unique_branches.len()
    ));
    out.push_str(&format!("<Quality> {quality_json}\n"));
    out.push_str(CLOSE);
    out.push_str(body);
    Ok(out)
}

/// Whether `text` starts with an annotation header.
pub fn has_header(text: &str) -> bool {
    text.starts_with(OPEN) && text.contains("\n<ID> ")
}

pub fn parse(text: &str) -> Result<SeedFile, SeedFormatError> {
    let rest = text.strip_prefix(OPEN).ok_or(SeedFormatError::NoHeader)?;
    let end = rest.find(CLOSE).ok_or(SeedFormatError::Unterminated)?;
    let header = &rest[..end];
    let body = rest[end + CLOSE.len()..].to_string();

    let mut id = None;
    let mut prompt = None;
    let mut combination = None;
    let mut score = None;
    let mut quality = None;
    for line in header.lines() {
        if let Some(value) = line.strip_prefix("<ID> ") {
            id = Some(value.trim().parse::<CandidateId>().map_err(|_| {
                SeedFormatError::Malformed {
                    field: "<ID>",
                    value: value.to_string(),
                }
            })?);
        } else if let Some(value) = line.strip_prefix("<Prompt> ") {
            let value = value.trim();
            prompt = Some(if value == "[]" {
                None
            } else {
                Some(serde_json::from_str::<String>(value).map_err(|_| {
                    SeedFormatError::Malformed {
                        field: "<Prompt>",
                        value: value.to_string(),
                    }
                })?)
            });
        } else if let Some(value) = line.strip_prefix("<Combination>: ") {
            combination = Some(parse_list(value).ok_or_else(|| SeedFormatError::Malformed {
                field: "<Combination>",
                value: value.to_string(),
            })?);
        } else if let Some(value) = line.strip_prefix("<score> ") {
            let number = value.split(',').next().unwrap_or("").trim();
            score = Some(
                number
                    .parse::<f64>()
                    .map_err(|_| SeedFormatError::Malformed {
                        field: "<score>",
                        value: value.to_string(),
                    })?,
            );
        } else if let Some(value) = line.strip_prefix("<Quality> ") {
            quality = Some(serde_json::from_str::<QualityRecord>(value.trim())?);
        }
    }

    Ok(SeedFile {
        id: id.ok_or(SeedFormatError::MissingField("<ID>"))?,
        prompt: prompt.unwrap_or(None),
        combination: combination.ok_or(SeedFormatError::MissingField("<Combination>"))?,
        score: score.ok_or(SeedFormatError::MissingField("<score>"))?,
        quality: quality.ok_or(SeedFormatError::MissingField("<Quality>"))?,
        body,
    })
}

fn parse_list(value: &str) -> Option<Vec<String>> {
    let inner = value.trim().strip_prefix('[')?.strip_suffix(']')?;
    Some(
        inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
