use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An acquire call and the calls that release what it acquired.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CriticalPair {
    pub acquire: String,
    pub release: Vec<String>,
}

impl CriticalPair {
    pub fn new(acquire: &str, release: &[&str]) -> Self {
        Self {
            acquire: acquire.to_string(),
            release: release.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Fixed per-library table of resource-lifecycle-sensitive calls.
///
/// A call is critical if it appears as the acquire or a release of any pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriticalCallPolicy {
    pairs: Vec<CriticalPair>,
    critical: BTreeSet<String>,
}

impl CriticalCallPolicy {
    pub fn new(pairs: Vec<CriticalPair>) -> Self {
        let mut critical = BTreeSet::new();
        for pair in &pairs {
            critical.insert(pair.acquire.clone());
            critical.extend(pair.release.iter().cloned());
        }
        Self { pairs, critical }
    }

    /// The built-in lifecycle table for the library families the engine ships
    /// profiles for. Unknown libraries get an empty policy.
    pub fn builtin(library: &str) -> Self {
        let pairs = match library.to_ascii_lowercase().as_str() {
            "cjson" => vec![
                CriticalPair::new("cJSON_Parse", &["cJSON_Delete"]),
                CriticalPair::new("cJSON_ParseWithOpts", &["cJSON_Delete"]),
                CriticalPair::new("cJSON_ParseWithLength", &["cJSON_Delete"]),
                CriticalPair::new("cJSON_CreateObject", &["cJSON_Delete"]),
                CriticalPair::new("cJSON_CreateArray", &["cJSON_Delete"]),
                CriticalPair::new("cJSON_Duplicate", &["cJSON_Delete"]),
                CriticalPair::new("cJSON_Print", &["cJSON_free", "free"]),
                CriticalPair::new("cJSON_PrintUnformatted", &["cJSON_free", "free"]),
            ],
            "zlib" => vec![
                CriticalPair::new("deflateInit_", &["deflateEnd"]),
                CriticalPair::new("deflateInit2_", &["deflateEnd"]),
                CriticalPair::new("inflateInit_", &["inflateEnd"]),
                CriticalPair::new("inflateInit2_", &["inflateEnd"]),
                CriticalPair::new("inflateBackInit_", &["inflateBackEnd"]),
                CriticalPair::new("gzopen", &["gzclose", "gzclose_r", "gzclose_w"]),
                CriticalPair::new("gzdopen", &["gzclose", "gzclose_r", "gzclose_w"]),
            ],
            "sqlite" | "sqlite3" => vec![
                CriticalPair::new("sqlite3_open", &["sqlite3_close", "sqlite3_close_v2"]),
                CriticalPair::new("sqlite3_open_v2", &["sqlite3_close", "sqlite3_close_v2"]),
                CriticalPair::new("sqlite3_prepare_v2", &["sqlite3_finalize"]),
                CriticalPair::new("sqlite3_prepare_v3", &["sqlite3_finalize"]),
                CriticalPair::new("sqlite3_malloc", &["sqlite3_free"]),
                CriticalPair::new("sqlite3_mprintf", &["sqlite3_free"]),
            ],
            "libpng" => vec![
                CriticalPair::new("png_create_read_struct", &["png_destroy_read_struct"]),
                CriticalPair::new("png_create_write_struct", &["png_destroy_write_struct"]),
                CriticalPair::new(
                    "png_create_info_struct",
                    &["png_destroy_info_struct", "png_destroy_read_struct", "png_destroy_write_struct"],
                ),
                CriticalPair::new("png_image_begin_read_from_memory", &["png_image_free"]),
            ],
            "lcms" | "lcms2" => vec![
                CriticalPair::new("cmsOpenProfileFromMem", &["cmsCloseProfile"]),
                CriticalPair::new("cmsOpenProfileFromFile", &["cmsCloseProfile"]),
                CriticalPair::new("cmsCreate_sRGBProfile", &["cmsCloseProfile"]),
                CriticalPair::new("cmsCreateLab4Profile", &["cmsCloseProfile"]),
                CriticalPair::new("cmsCreateTransform", &["cmsDeleteTransform"]),
                CriticalPair::new("cmsIT8LoadFromMem", &["cmsIT8Free"]),
                CriticalPair::new("cmsIT8Alloc", &["cmsIT8Free"]),
                CriticalPair::new("cmsPipelineAlloc", &["cmsPipelineFree"]),
            ],
            "libpcap" | "pcap" => vec![
                CriticalPair::new("pcap_open_dead", &["pcap_close"]),
                CriticalPair::new("pcap_open_offline", &["pcap_close"]),
                CriticalPair::new("pcap_fopen_offline", &["pcap_close"]),
                CriticalPair::new("pcap_create", &["pcap_close"]),
                CriticalPair::new("pcap_compile", &["pcap_freecode"]),
            ],
            "re2" | "cre2" => vec![
                CriticalPair::new("cre2_new", &["cre2_delete"]),
                CriticalPair::new("cre2_opt_new", &["cre2_opt_delete"]),
                CriticalPair::new("cre2_set_new", &["cre2_set_delete"]),
            ],
            _ => Vec::new(),
        };
        Self::new(pairs)
    }

    pub fn pairs(&self) -> &[CriticalPair] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn is_critical(&self, symbol: &str) -> bool {
        self.critical.contains(symbol)
    }

    pub fn is_acquire(&self, symbol: &str) -> bool {
        self.pairs.iter().any(|p| p.acquire == symbol)
    }

    /// Acquire calls in `calls` that are never followed by one of their
    /// releases, in the order they were made.
    pub fn unmatched_acquires(&self, calls: &[String]) -> Vec<String> {
        let mut open: Vec<&str> = Vec::new();
        for call in calls {
            if self.is_acquire(call) {
                open.push(call.as_str());
            }
            // A release closes the most recent open acquire it can release.
            let closes = open.iter().rposition(|acquired| {
                self.pairs
                    .iter()
                    .any(|p| p.acquire == *acquired && p.release.iter().any(|r| r == call))
            });
            if let Some(idx) = closes {
                open.remove(idx);
            }
        }
        open.into_iter().map(str::to_string).collect()
    }

    /// The order in which critical calls were made, with immediate repeats
    /// collapsed. Two seeds with the same pattern exercise the same lifecycle.
    pub fn order_pattern(&self, critical_calls: &[String]) -> Vec<String> {
        let mut pattern: Vec<String> = Vec::new();
        for call in critical_calls {
            if pattern.last() != Some(call) {
                pattern.push(call.clone());
            }
        }
        pattern
    }
}

/// The public API surface of a target library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolTable {
    symbols: Vec<String>,
}

impl SymbolTable {
    pub fn new<S: Into<String>>(symbols: impl IntoIterator<Item = S>) -> Self {
        let unique: BTreeSet<String> = symbols.into_iter().map(Into::into).collect();
        Self {
            symbols: unique.into_iter().collect(),
        }
    }

    /// Reads one symbol per line; blank lines and `#` comments are skipped.
    pub fn parse(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        )
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.binary_search_by(|s| s.as_str().cmp(symbol)).is_ok()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Static per-library metadata shared by the scorer, selector and generator.
#[derive(Debug, Clone, Default)]
pub struct LibraryProfile {
    pub name: String,
    pub symbols: SymbolTable,
    pub policy: CriticalCallPolicy,
    /// Number of instrumentable branch sites in the library build, when known.
    pub total_branch_sites: Option<u64>,
}

impl LibraryProfile {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let policy = CriticalCallPolicy::builtin(&name);
        Self {
            name,
            symbols: SymbolTable::default(),
            policy,
            total_branch_sites: None,
        }
    }

    pub fn with_symbols(mut self, symbols: SymbolTable) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn with_policy(mut self, policy: CriticalCallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_total_branch_sites(mut self, total: u64) -> Self {
        self.total_branch_sites = Some(total);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calls(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtin_policy_knows_cjson_lifecycle() {
        let policy = CriticalCallPolicy::builtin("cJSON");
        assert!(policy.is_critical("cJSON_Parse"));
        assert!(policy.is_critical("cJSON_Delete"));
        assert!(!policy.is_critical("cJSON_GetObjectItem"));
        assert!(CriticalCallPolicy::builtin("unknown-lib").is_empty());
    }

    #[test]
    fn unmatched_acquires_reports_leaks_only() {
        let policy = CriticalCallPolicy::builtin("zlib");
        let balanced = calls(&["deflateInit_", "deflate", "deflateEnd"]);
        assert!(policy.unmatched_acquires(&balanced).is_empty());

        let leaked = calls(&["inflateInit_", "deflateInit_", "deflateEnd", "inflate"]);
        assert_eq!(policy.unmatched_acquires(&leaked), calls(&["inflateInit_"]));

        let release_first = calls(&["gzclose", "gzopen"]);
        assert_eq!(policy.unmatched_acquires(&release_first), calls(&["gzopen"]));
    }

    #[test]
    fn order_pattern_collapses_repeats() {
        let policy = CriticalCallPolicy::builtin("sqlite3");
        let critical = calls(&[
            "sqlite3_open",
            "sqlite3_prepare_v2",
            "sqlite3_prepare_v2",
            "sqlite3_finalize",
            "sqlite3_close",
        ]);
        assert_eq!(
            policy.order_pattern(&critical),
            calls(&["sqlite3_open", "sqlite3_prepare_v2", "sqlite3_finalize", "sqlite3_close"])
        );
    }

    #[test]
    fn symbol_table_parses_lists() {
        let table = SymbolTable::parse("# zlib\ninflate\n\ndeflate\ninflate\n");
        assert_eq!(table.len(), 2);
        assert!(table.contains("deflate"));
        assert!(!table.contains("# zlib"));
    }
}
