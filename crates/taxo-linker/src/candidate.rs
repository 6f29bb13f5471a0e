//! Candidate generation
//!
//! Mentions are embedded with the tf-idf encoder, their nearest aliases are
//! retrieved from the ANN index, and the aliases are canonicalized to the
//! concepts they denote. Because the index holds aliases rather than
//! concepts, a query for `k` neighbours usually yields fewer than `k`
//! candidates, and one alias may yield several (ambiguous names are kept,
//! not narrowed).
//!
//! Author: hephaex@gmail.com

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use taxo_core::{CacheConfig, Candidate, Result, TaxoError};
use taxo_kb::{resolve_linker, FileCache, KnowledgeBase, ResolvedPaths};
use taxo_vector::{AnnIndex, LexicalEncoder, Neighbor, SparseMatrix, SparseVector, TfidfVectorizer};
use tracing::{debug, info};

/// Registry entry used when neither a linker nor components are given
pub const DEFAULT_LINKER: &str = "gbif_backbone";

// ============================================================================
// Candidate Generator
// ============================================================================

/// Generates ranked candidate concepts for mention strings
///
/// The index, encoder and alias list are shared read-only between workers;
/// the knowledge base handle is per worker (see [`CandidateGenerator::fork`]).
pub struct CandidateGenerator {
    index: Arc<AnnIndex>,
    encoder: Arc<dyn LexicalEncoder>,
    aliases: Arc<Vec<String>>,
    kb: KnowledgeBase,
}

impl std::fmt::Debug for CandidateGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateGenerator")
            .field("aliases", &self.aliases.len())
            .field("dimension", &self.encoder.dimension())
            .field("kb", &self.kb)
            .finish()
    }
}

impl CandidateGenerator {
    /// Assemble a generator from loaded components
    ///
    /// Element `i` of the index must be the vector of `aliases[i]`.
    pub fn new(
        index: Arc<AnnIndex>,
        encoder: Arc<dyn LexicalEncoder>,
        aliases: Arc<Vec<String>>,
        kb: KnowledgeBase,
    ) -> Result<Self> {
        if index.len() != aliases.len() {
            return Err(TaxoError::IndexError(format!(
                "Index holds {} vectors but the alias list has {} entries",
                index.len(),
                aliases.len()
            )));
        }
        Ok(Self {
            index,
            encoder,
            aliases,
            kb,
        })
    }

    /// Load the four linker artifacts from local files
    pub fn from_paths(paths: &ResolvedPaths, kb: KnowledgeBase, ef_search: usize) -> Result<Self> {
        let started = std::time::Instant::now();
        let vectorizer = TfidfVectorizer::load(&paths.tfidf_vectorizer)?;
        let vectors = SparseMatrix::load(&paths.tfidf_vectors)?;
        if vectors.dimension != vectorizer.dimension() {
            return Err(TaxoError::IndexError(format!(
                "Alias vectors have dimension {} but the vectorizer produces {}",
                vectors.dimension,
                vectorizer.dimension()
            )));
        }
        let aliases = load_aliases(&paths.concept_aliases_list)?;

        let mut index = AnnIndex::load(&paths.ann_index, vectors.rows)?;
        index.set_ef_search(ef_search);

        info!(
            aliases = aliases.len(),
            dimension = vectorizer.dimension(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Loaded candidate generator"
        );
        Self::new(Arc::new(index), Arc::new(vectorizer), Arc::new(aliases), kb)
    }

    pub fn builder() -> CandidateGeneratorBuilder {
        CandidateGeneratorBuilder::default()
    }

    /// A generator for another worker: shares the index, encoder and alias
    /// list, opens its own knowledge base connection
    pub fn fork(&self) -> Result<Self> {
        Ok(Self {
            index: Arc::clone(&self.index),
            encoder: Arc::clone(&self.encoder),
            aliases: Arc::clone(&self.aliases),
            kb: self.kb.reopen()?,
        })
    }

    pub fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }

    /// Number of indexed aliases
    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    /// Candidates for each mention string, in input order
    ///
    /// Repeated strings are encoded and queried once. Mentions sharing no
    /// n-gram with the vocabulary get an empty list. All aliases touched by
    /// the batch are canonicalized with a single knowledge base lookup.
    pub fn generate(&self, mention_texts: &[String], k: usize) -> Result<Vec<Vec<Candidate>>> {
        if mention_texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut unique: Vec<String> = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();
        let slots: Vec<usize> = mention_texts
            .iter()
            .map(|text| {
                *position.entry(text.as_str()).or_insert_with(|| {
                    unique.push(text.clone());
                    unique.len() - 1
                })
            })
            .collect();

        let vectors = self.encoder.encode(&unique)?;
        let started = std::time::Instant::now();
        let neighbours = self.knn_with_zero_vectors(&vectors, k)?;
        debug!(
            mentions = mention_texts.len(),
            unique = unique.len(),
            k,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finding neighbours"
        );

        // Alias -> similarity per mention, closest first
        let mut matched: Vec<Vec<(&str, f32)>> = Vec::with_capacity(neighbours.len());
        let mut touched: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for slot in &neighbours {
            let mut aliases: Vec<(&str, f32)> = Vec::new();
            let mut local: HashSet<&str> = HashSet::new();
            for neighbour in slot.iter().flatten() {
                let alias = self.aliases.get(neighbour.index).ok_or_else(|| {
                    TaxoError::IndexError(format!(
                        "Neighbour {} is outside the alias list",
                        neighbour.index
                    ))
                })?;
                if local.insert(alias.as_str()) {
                    aliases.push((alias.as_str(), neighbour.similarity()));
                }
                if seen.insert(alias.as_str()) {
                    touched.push(alias.clone());
                }
            }
            matched.push(aliases);
        }

        let concepts_by_alias = self.kb.lookup(&touched)?;

        let per_unique: Vec<Vec<Candidate>> = matched
            .iter()
            .map(|aliases| group_by_concept(aliases, &concepts_by_alias))
            .collect();

        Ok(slots.into_iter().map(|i| per_unique[i].clone()).collect())
    }

    /// Batch query that never submits an all-zero vector
    ///
    /// Zero vectors are set aside, the rest are queried in one batch, and the
    /// results are put back in place. Slot `i` of the output belongs to
    /// `vectors[i]`; zero vectors get `None`.
    pub fn knn_with_zero_vectors(
        &self,
        vectors: &[SparseVector],
        k: usize,
    ) -> Result<Vec<Option<Vec<Neighbor>>>> {
        let non_empty: Vec<usize> = vectors
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_zero())
            .map(|(i, _)| i)
            .collect();
        debug!(
            empty_vectors = vectors.len() - non_empty.len(),
            "Number of empty vectors"
        );

        let mut extended: Vec<Option<Vec<Neighbor>>> = vec![None; vectors.len()];
        if non_empty.is_empty() {
            return Ok(extended);
        }

        let queries: Vec<SparseVector> = non_empty.iter().map(|&i| vectors[i].clone()).collect();
        let results = self.index.knn_query_batch(&queries, k)?;
        for (position, neighbours) in non_empty.into_iter().zip(results) {
            extended[position] = Some(neighbours);
        }
        Ok(extended)
    }
}

/// One candidate per concept, in the order concepts are first reached
fn group_by_concept(
    aliases: &[(&str, f32)],
    concepts_by_alias: &HashMap<String, Vec<String>>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();

    for (alias, similarity) in aliases {
        let Some(concept_ids) = concepts_by_alias.get(*alias) else {
            continue;
        };
        for concept_id in concept_ids {
            let index = *position.entry(concept_id.as_str()).or_insert_with(|| {
                candidates.push(Candidate::new(concept_id.clone()));
                candidates.len() - 1
            });
            candidates[index].push(*alias, *similarity);
        }
    }
    candidates
}

fn load_aliases(path: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(path)
        .map_err(|e| TaxoError::NotFound(format!("{}: {e}", path.display())))?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| TaxoError::ParseError(format!("Invalid alias list {}: {e}", path.display())))
}

// ============================================================================
// Builder
// ============================================================================

/// Builds a generator from a registry name / linker config, or from
/// explicitly supplied components, but not both
#[derive(Default)]
pub struct CandidateGeneratorBuilder {
    linker: Option<String>,
    index: Option<Arc<AnnIndex>>,
    encoder: Option<Arc<dyn LexicalEncoder>>,
    aliases: Option<Arc<Vec<String>>>,
    kb: Option<KnowledgeBase>,
    ef_search: Option<usize>,
}

impl CandidateGeneratorBuilder {
    /// Registry name or path to a linker config
    pub fn linker(mut self, name_or_path: impl Into<String>) -> Self {
        self.linker = Some(name_or_path.into());
        self
    }

    pub fn index(mut self, index: Arc<AnnIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn LexicalEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn aliases(mut self, aliases: Arc<Vec<String>>) -> Self {
        self.aliases = Some(aliases);
        self
    }

    /// Knowledge base to use instead of the linker's own
    pub fn kb(mut self, kb: KnowledgeBase) -> Self {
        self.kb = Some(kb);
        self
    }

    pub fn ef_search(mut self, ef_search: usize) -> Self {
        self.ef_search = Some(ef_search);
        self
    }

    /// Build, downloading remote artifacts into the cache when needed
    pub async fn build(self, cache: &CacheConfig) -> Result<CandidateGenerator> {
        let has_components =
            self.index.is_some() || self.encoder.is_some() || self.aliases.is_some();

        if self.linker.is_some() && has_components {
            return Err(TaxoError::ConfigError(
                "A linker name cannot be combined with explicit index, encoder or alias components"
                    .to_string(),
            ));
        }

        if has_components {
            let (Some(index), Some(encoder), Some(aliases), Some(kb)) =
                (self.index, self.encoder, self.aliases, self.kb)
            else {
                return Err(TaxoError::ConfigError(
                    "Explicit components need an index, an encoder, an alias list and a knowledge base"
                        .to_string(),
                ));
            };
            return CandidateGenerator::new(index, encoder, aliases, kb);
        }

        let name = self.linker.as_deref().unwrap_or(DEFAULT_LINKER);
        let spec = resolve_linker(name, cache)?;
        let paths = FileCache::new(&cache.cache_dir)
            .resolve_paths(&spec.linker_paths)
            .await?;
        let kb = match self.kb {
            Some(kb) => kb,
            None => KnowledgeBase::open(spec.kb)?,
        };
        CandidateGenerator::from_paths(&paths, kb, self.ef_search.unwrap_or(200))
    }
}
