//! Taxo KB - Knowledge base store
//!
//! Loads taxonomic knowledge bases (JSONL or JSON array of concept records),
//! persists their alias index to SQLite on first use and answers batched
//! alias -> concept id lookups. Also hosts the linker registry and the
//! download cache for remote linker artifacts.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use taxo_core::{Concept, Result, TaxoError};
use tracing::{debug, info, warn};

pub mod file_cache;
pub mod registry;
pub mod store;

pub use file_cache::{FileCache, ResolvedPaths};
pub use registry::{resolve_linker, ArtifactRef, LinkerPaths, LinkerSpec, RegistryEntry, REGISTRY};
pub use store::AliasStore;

// ============================================================================
// Source Parsing
// ============================================================================

/// Location and id prefix of a knowledge base source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KbSource {
    /// JSONL or JSON array of concept records
    pub file_path: PathBuf,

    /// Prepended to every concept id handed out by lookups (e.g. "GBIF:")
    #[serde(default)]
    pub prefix: String,
}

impl KbSource {
    pub fn new(file_path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            prefix: prefix.into(),
        }
    }

    /// Where the alias store for this source lives
    pub fn db_path(&self) -> PathBuf {
        self.file_path.with_extension("db")
    }
}

/// Parse concept records from a JSONL file or a JSON array
///
/// A record missing a required field fails the whole load. Repeated
/// concept ids keep their first record.
pub fn read_concepts(path: impl AsRef<Path>) -> Result<Vec<Concept>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| TaxoError::NotFound(format!("Knowledge base {}: {e}", path.display())))?;

    let records: Vec<Concept> = if content.trim_start().starts_with('[') {
        serde_json::from_str(&content).map_err(|e| {
            TaxoError::ParseError(format!("Invalid knowledge base {}: {e}", path.display()))
        })?
    } else {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(number, line)| {
                serde_json::from_str(line).map_err(|e| {
                    TaxoError::ParseError(format!(
                        "Invalid record at {}:{}: {e}",
                        path.display(),
                        number + 1
                    ))
                })
            })
            .collect::<Result<_>>()?
    };

    let mut seen = HashSet::new();
    let mut concepts = Vec::with_capacity(records.len());
    for concept in records {
        if concept.concept_id.is_empty() {
            return Err(TaxoError::ParseError(format!(
                "Empty concept_id in {}",
                path.display()
            )));
        }
        if seen.insert(concept.concept_id.clone()) {
            concepts.push(concept);
        } else {
            warn!(concept_id = %concept.concept_id, "Skipping repeated concept record");
        }
    }
    Ok(concepts)
}

// ============================================================================
// Knowledge Base
// ============================================================================

/// A knowledge base backed by its alias store
#[derive(Debug)]
pub struct KnowledgeBase {
    source: KbSource,
    store: AliasStore,
}

impl KnowledgeBase {
    /// Open the alias store for `source`, building it first if absent
    pub fn open(source: KbSource) -> Result<Self> {
        let db_path = source.db_path();
        let store = if db_path.exists() {
            debug!(path = %db_path.display(), "Found alias store");
            AliasStore::open(&db_path)?
        } else {
            info!(
                source = %source.file_path.display(),
                store = %db_path.display(),
                "Alias store not found, building from source"
            );
            let concepts = read_concepts(&source.file_path)?;
            AliasStore::create(&db_path, &concepts)?
        };
        Ok(Self { source, store })
    }

    /// A second handle on the same store, for another worker
    pub fn reopen(&self) -> Result<Self> {
        Ok(Self {
            source: self.source.clone(),
            store: self.store.reopen()?,
        })
    }

    pub fn source(&self) -> &KbSource {
        &self.source
    }

    pub fn prefix(&self) -> &str {
        &self.source.prefix
    }

    pub fn store(&self) -> &AliasStore {
        &self.store
    }

    /// Batched alias lookup returning prefixed concept ids
    pub fn lookup(&self, aliases: &[String]) -> Result<HashMap<String, Vec<String>>> {
        let mut found = self.store.lookup(aliases)?;
        if !self.source.prefix.is_empty() {
            for ids in found.values_mut() {
                for id in ids.iter_mut() {
                    id.insert_str(0, &self.source.prefix);
                }
            }
        }
        Ok(found)
    }

    /// Concept metadata by id, prefixed or not
    pub fn concept(&self, concept_id: &str) -> Result<Option<Concept>> {
        let mut found = self.concepts(&[concept_id.to_string()])?;
        Ok(found.remove(concept_id))
    }

    /// Batched concept metadata, keyed by the ids as given
    pub fn concepts(&self, concept_ids: &[String]) -> Result<HashMap<String, Concept>> {
        let raw: Vec<String> = concept_ids
            .iter()
            .map(|id| self.strip_prefix(id).to_string())
            .collect();
        let by_raw = self.store.concepts(&raw)?;

        let mut found = HashMap::with_capacity(by_raw.len());
        for (given, raw_id) in concept_ids.iter().zip(raw.iter()) {
            if let Some(concept) = by_raw.get(raw_id) {
                let mut concept = concept.clone();
                concept.concept_id = format!("{}{}", self.source.prefix, concept.concept_id);
                found.insert(given.clone(), concept);
            }
        }
        Ok(found)
    }

    /// Every alias in first-seen order
    pub fn aliases(&self) -> Result<Vec<String>> {
        self.store.aliases()
    }

    /// Number of concepts in the store
    pub fn len(&self) -> Result<usize> {
        self.store.concept_count()
    }

    fn strip_prefix<'a>(&self, concept_id: &'a str) -> &'a str {
        if self.source.prefix.is_empty() {
            return concept_id;
        }
        concept_id
            .strip_prefix(self.source.prefix.as_str())
            .unwrap_or(concept_id)
    }
}
