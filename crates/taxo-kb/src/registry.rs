//! Linker registry
//!
//! A linker bundles four artifacts (ANN index, tf-idf vectorizer, alias
//! vectors, alias list) with the knowledge base they were built from. Linkers
//! are selected either by registry name or by pointing at a `linker.json`
//! file (or a directory holding one).

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use taxo_core::{CacheConfig, Result, TaxoError};

use crate::KbSource;

pub const ANN_INDEX_FILE: &str = "ann_index.json";
pub const TFIDF_VECTORIZER_FILE: &str = "tfidf_vectorizer.json";
pub const TFIDF_VECTORS_FILE: &str = "tfidf_vectors.json";
pub const CONCEPT_ALIASES_FILE: &str = "concept_aliases.json";
pub const LINKER_CONFIG_FILE: &str = "linker.json";

// ============================================================================
// Artifact References
// ============================================================================

/// A linker artifact: a local path or URL, or a `[url, cache name]` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArtifactRef {
    Path(String),
    Remote(String, String),
}

impl ArtifactRef {
    pub fn local(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().to_string_lossy().into_owned())
    }

    /// Whether resolving this reference needs a download
    pub fn is_remote(&self) -> bool {
        match self {
            Self::Path(p) => is_url(p),
            Self::Remote(..) => true,
        }
    }

    /// Anchor a relative local path at `base`
    fn rebase(self, base: &Path) -> Self {
        match self {
            Self::Path(p) if !is_url(&p) && Path::new(&p).is_relative() => {
                Self::local(base.join(p))
            }
            other => other,
        }
    }
}

pub(crate) fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Reject cache names that would escape the cache directory
pub(crate) fn safe_relative(name: &str) -> Result<PathBuf> {
    let relative = PathBuf::from(name.trim_start_matches('/'));
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(TaxoError::ValidationError(format!(
            "Invalid cache name '{name}'"
        )));
    }
    Ok(relative)
}

/// The four artifacts a candidate generator loads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkerPaths {
    pub ann_index: ArtifactRef,
    pub tfidf_vectorizer: ArtifactRef,
    pub tfidf_vectors: ArtifactRef,
    pub concept_aliases_list: ArtifactRef,
}

impl LinkerPaths {
    /// Standard artifact names inside `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            ann_index: ArtifactRef::local(dir.join(ANN_INDEX_FILE)),
            tfidf_vectorizer: ArtifactRef::local(dir.join(TFIDF_VECTORIZER_FILE)),
            tfidf_vectors: ArtifactRef::local(dir.join(TFIDF_VECTORS_FILE)),
            concept_aliases_list: ArtifactRef::local(dir.join(CONCEPT_ALIASES_FILE)),
        }
    }

    fn rebase(self, base: &Path) -> Self {
        Self {
            ann_index: self.ann_index.rebase(base),
            tfidf_vectorizer: self.tfidf_vectorizer.rebase(base),
            tfidf_vectors: self.tfidf_vectors.rebase(base),
            concept_aliases_list: self.concept_aliases_list.rebase(base),
        }
    }
}

// ============================================================================
// Linker Config Files
// ============================================================================

/// A complete linker description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkerSpec {
    pub name: String,
    pub kb: KbSource,
    pub linker_paths: LinkerPaths,
}

impl LinkerSpec {
    /// Read a linker config, or `linker.json` inside a directory
    ///
    /// Relative paths in the file are taken relative to the file itself.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join(LINKER_CONFIG_FILE)
        } else {
            path.to_path_buf()
        };

        let content = std::fs::read_to_string(&file).map_err(|e| {
            TaxoError::ConfigError(format!("Cannot read linker config {}: {e}", file.display()))
        })?;
        let spec: Self = serde_json::from_str(&content).map_err(|e| {
            TaxoError::ConfigError(format!("Invalid linker config {}: {e}", file.display()))
        })?;

        let base = file.parent().unwrap_or_else(|| Path::new("."));
        let kb_path = if spec.kb.file_path.is_relative() {
            base.join(&spec.kb.file_path)
        } else {
            spec.kb.file_path.clone()
        };
        Ok(Self {
            name: spec.name,
            kb: KbSource::new(kb_path, spec.kb.prefix),
            linker_paths: spec.linker_paths.rebase(base),
        })
    }

    /// Write as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TaxoError::StorageError(format!("Failed to encode linker config: {e}")))?;
        std::fs::write(path, json).map_err(|e| {
            TaxoError::StorageError(format!("Failed to write {}: {e}", path.display()))
        })
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A knowledge base known by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub name: &'static str,
    /// Source file, relative to the data directory
    pub kb_file: &'static str,
    pub prefix: &'static str,
}

pub const REGISTRY: &[RegistryEntry] = &[
    RegistryEntry {
        name: "gbif_backbone",
        kb_file: "gbif/gbif_backbone.jsonl",
        prefix: "GBIF:",
    },
    RegistryEntry {
        name: "taxref",
        kb_file: "taxref/taxref.jsonl",
        prefix: "TAXREF:",
    },
    RegistryEntry {
        name: "ncbi_taxonomy",
        kb_file: "ncbi/ncbi_taxonomy.jsonl",
        prefix: "NCBI:",
    },
    RegistryEntry {
        name: "ncbi_lite",
        kb_file: "ncbi/ncbi_taxonomy_lite.jsonl",
        prefix: "NCBI:",
    },
];

impl RegistryEntry {
    pub fn find(name: &str) -> Option<&'static RegistryEntry> {
        REGISTRY.iter().find(|entry| entry.name == name)
    }

    /// Directory the entry's artifacts are built into
    pub fn artifact_dir(&self, cache: &CacheConfig) -> PathBuf {
        cache.cache_dir.join(self.name)
    }

    pub fn spec(&self, cache: &CacheConfig) -> LinkerSpec {
        LinkerSpec {
            name: self.name.to_string(),
            kb: KbSource::new(cache.data_dir.join(self.kb_file), self.prefix),
            linker_paths: LinkerPaths::in_dir(self.artifact_dir(cache)),
        }
    }
}

/// Resolve a registry name or a linker config path
pub fn resolve_linker(name_or_path: &str, cache: &CacheConfig) -> Result<LinkerSpec> {
    if let Some(entry) = RegistryEntry::find(name_or_path) {
        return Ok(entry.spec(cache));
    }

    let path = Path::new(name_or_path);
    if path.is_file() || path.join(LINKER_CONFIG_FILE).is_file() {
        return LinkerSpec::load(path);
    }

    let known: Vec<&str> = REGISTRY.iter().map(|e| e.name).collect();
    Err(TaxoError::ConfigError(format!(
        "Unknown linker '{name_or_path}': expected one of {} or a path to a linker config",
        known.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(dir: &Path) -> CacheConfig {
        CacheConfig {
            cache_dir: dir.join("cache"),
            data_dir: dir.join("data"),
        }
    }

    #[test]
    fn test_artifact_ref_forms() {
        let refs: Vec<ArtifactRef> = serde_json::from_str(
            r#"["index.json", ["https://example.org/download", "gbif/ann_index.json"]]"#,
        )
        .unwrap();
        assert_eq!(refs[0], ArtifactRef::Path("index.json".to_string()));
        assert!(!refs[0].is_remote());
        assert!(refs[1].is_remote());
        assert!(ArtifactRef::Path("https://example.org/a".to_string()).is_remote());
    }

    #[test]
    fn test_registry_names() {
        let dir = tempfile::tempdir().unwrap();
        let spec = resolve_linker("gbif_backbone", &cache(dir.path())).unwrap();
        assert_eq!(spec.kb.prefix, "GBIF:");
        assert!(spec.kb.file_path.starts_with(dir.path().join("data")));
        assert_eq!(
            spec.linker_paths.ann_index,
            ArtifactRef::local(dir.path().join("cache/gbif_backbone/ann_index.json"))
        );
        assert_eq!(REGISTRY.len(), 4);
    }

    #[test]
    fn test_unknown_linker_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_linker("no_such_linker", &cache(dir.path())).unwrap_err();
        assert!(matches!(err, TaxoError::ConfigError(_)));
    }

    #[test]
    fn test_linker_config_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let spec = LinkerSpec {
            name: "custom".to_string(),
            kb: KbSource::new("kb.jsonl", "X:"),
            linker_paths: LinkerPaths {
                ann_index: ArtifactRef::Path(ANN_INDEX_FILE.to_string()),
                tfidf_vectorizer: ArtifactRef::Path(TFIDF_VECTORIZER_FILE.to_string()),
                tfidf_vectors: ArtifactRef::Path(TFIDF_VECTORS_FILE.to_string()),
                concept_aliases_list: ArtifactRef::Remote(
                    "https://example.org/aliases".to_string(),
                    "custom/concept_aliases.json".to_string(),
                ),
            },
        };
        spec.save(dir.path().join(LINKER_CONFIG_FILE)).unwrap();

        let loaded = resolve_linker(&dir.path().to_string_lossy(), &cache(dir.path())).unwrap();
        assert_eq!(loaded.kb.file_path, dir.path().join("kb.jsonl"));
        assert_eq!(
            loaded.linker_paths.ann_index,
            ArtifactRef::local(dir.path().join(ANN_INDEX_FILE))
        );
        assert_eq!(
            loaded.linker_paths.concept_aliases_list,
            spec.linker_paths.concept_aliases_list
        );
    }

    #[test]
    fn test_safe_relative() {
        assert_eq!(
            safe_relative("/ncbi_taxonomy_lite/ann_index.json").unwrap(),
            PathBuf::from("ncbi_taxonomy_lite/ann_index.json")
        );
        assert!(safe_relative("../escape.json").is_err());
        assert!(safe_relative("").is_err());
    }
}
