//! Linker artifact builder
//!
//! Fits the tf-idf vectorizer over every alias of a knowledge base, indexes
//! the alias vectors with HNSW and writes the four artifacts plus a
//! `linker.json` describing them.

use std::path::Path;
use std::sync::Arc;

use taxo_core::{IndexBuildConfig, Result, TaxoError};
use taxo_kb::registry::{
    LinkerPaths, ANN_INDEX_FILE, CONCEPT_ALIASES_FILE, LINKER_CONFIG_FILE, TFIDF_VECTORIZER_FILE,
    TFIDF_VECTORS_FILE,
};
use taxo_kb::{KnowledgeBase, LinkerSpec};
use taxo_vector::{
    AnnIndex, HnswParams, LexicalEncoder, SparseMatrix, TfidfVectorizer, VectorizerParams,
};
use tracing::info;

use crate::candidate::CandidateGenerator;

/// Character n-gram length of the alias encoder
const NGRAM: usize = 3;

/// Fitted linker components, not yet written out
pub struct LinkerArtifacts {
    /// Alias of each index element
    pub aliases: Vec<String>,
    pub vectorizer: TfidfVectorizer,
    pub vectors: SparseMatrix,
    pub index: AnnIndex,
}

/// Fit the encoder and index over a knowledge base's aliases
///
/// Aliases whose vector is all zeros (every n-gram below `min_df`) can never
/// be retrieved and are left out of the index.
pub fn fit_artifacts(kb: &KnowledgeBase, config: &IndexBuildConfig) -> Result<LinkerArtifacts> {
    let all_aliases = kb.aliases()?;
    if all_aliases.is_empty() {
        return Err(TaxoError::ValidationError(format!(
            "Knowledge base {} has no aliases",
            kb.source().file_path.display()
        )));
    }

    info!(aliases = all_aliases.len(), min_df = config.min_df, "Fitting tf-idf vectorizer");
    let started = std::time::Instant::now();
    let (vectorizer, vectors) = TfidfVectorizer::fit_transform(
        &all_aliases,
        VectorizerParams {
            ngram: NGRAM,
            min_df: config.min_df,
        },
    )?;
    info!(
        vocabulary = vectorizer.dimension(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Fitted vectorizer"
    );

    let total = all_aliases.len();
    let (aliases, vectors): (Vec<String>, Vec<_>) = all_aliases
        .into_iter()
        .zip(vectors)
        .filter(|(_, v)| !v.is_zero())
        .unzip();
    info!(
        dropped = total - aliases.len(),
        total, "Deleting aliases with empty tf-idf vectors"
    );

    let index = AnnIndex::build(
        vectors.clone(),
        HnswParams {
            m: config.m,
            ef_construction: config.ef_construction,
            seed: config.seed,
            ..HnswParams::default()
        },
    )?;

    Ok(LinkerArtifacts {
        aliases,
        vectors: SparseMatrix::new(vectorizer.dimension(), vectors),
        vectorizer,
        index,
    })
}

impl LinkerArtifacts {
    /// Write the four artifacts into `out_dir`
    pub fn save(&self, out_dir: impl AsRef<Path>) -> Result<LinkerPaths> {
        let out_dir = out_dir.as_ref();
        std::fs::create_dir_all(out_dir).map_err(|e| {
            TaxoError::StorageError(format!("Failed to create {}: {e}", out_dir.display()))
        })?;

        let aliases_path = out_dir.join(CONCEPT_ALIASES_FILE);
        let file = std::fs::File::create(&aliases_path).map_err(|e| {
            TaxoError::StorageError(format!("Failed to create {}: {e}", aliases_path.display()))
        })?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.aliases).map_err(|e| {
            TaxoError::StorageError(format!("Failed to write {}: {e}", aliases_path.display()))
        })?;

        self.vectorizer.save(out_dir.join(TFIDF_VECTORIZER_FILE))?;
        self.vectors.save(out_dir.join(TFIDF_VECTORS_FILE))?;
        self.index.save(out_dir.join(ANN_INDEX_FILE))?;
        Ok(LinkerPaths::in_dir(out_dir))
    }

    /// Use the artifacts directly, without a round trip through disk
    pub fn into_generator(self, kb: KnowledgeBase, ef_search: usize) -> Result<CandidateGenerator> {
        let mut index = self.index;
        index.set_ef_search(ef_search);
        CandidateGenerator::new(
            Arc::new(index),
            Arc::new(self.vectorizer),
            Arc::new(self.aliases),
            kb,
        )
    }
}

/// Build and write every artifact of a linker named `name`
pub fn build_linker_artifacts(
    name: &str,
    kb: &KnowledgeBase,
    out_dir: impl AsRef<Path>,
    config: &IndexBuildConfig,
) -> Result<LinkerSpec> {
    let out_dir = out_dir.as_ref();
    let started = std::time::Instant::now();

    let artifacts = fit_artifacts(kb, config)?;
    let linker_paths = artifacts.save(out_dir)?;
    let spec = LinkerSpec {
        name: name.to_string(),
        kb: kb.source().clone(),
        linker_paths,
    };
    spec.save(out_dir.join(LINKER_CONFIG_FILE))?;

    info!(
        name,
        out_dir = %out_dir.display(),
        aliases = artifacts.aliases.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Built linker artifacts"
    );
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use taxo_kb::{ArtifactRef, KbSource, ResolvedPaths};

    fn kb(dir: &Path) -> KnowledgeBase {
        let path = dir.join("kb.jsonl");
        std::fs::write(
            &path,
            r#"{"concept_id": "1", "canonical_name": "Ursus arctos", "aliases": ["brown bear"]}
{"concept_id": "2", "canonical_name": "Ursus maritimus", "aliases": ["polar bear", "x"]}
"#,
        )
        .unwrap();
        KnowledgeBase::open(KbSource::new(path, "T:")).unwrap()
    }

    fn config() -> IndexBuildConfig {
        IndexBuildConfig {
            min_df: 1,
            m: 4,
            ef_construction: 16,
            seed: 3,
        }
    }

    #[test]
    fn test_fit_drops_nothing_with_min_df_one() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = fit_artifacts(&kb(dir.path()), &config()).unwrap();
        assert_eq!(artifacts.aliases.len(), 5);
        assert_eq!(artifacts.index.len(), 5);
        assert_eq!(artifacts.vectors.len(), 5);
    }

    #[test]
    fn test_fit_drops_zero_vector_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        // Only n-grams shared by two aliases survive; "x" has none
        config.min_df = 2;
        let artifacts = fit_artifacts(&kb(dir.path()), &config).unwrap();
        assert!(!artifacts.aliases.contains(&"x".to_string()));
        assert_eq!(artifacts.aliases.len(), artifacts.index.len());
    }

    #[test]
    fn test_written_artifacts_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let kb = kb(dir.path());
        let out = dir.path().join("linker");
        let spec = build_linker_artifacts("bears", &kb, &out, &config()).unwrap();
        assert!(out.join(LINKER_CONFIG_FILE).exists());

        let loaded = LinkerSpec::load(&out).unwrap();
        assert_eq!(loaded.name, "bears");
        assert_eq!(loaded.kb.prefix, "T:");
        assert_eq!(loaded.linker_paths, spec.linker_paths);

        let resolved = local_paths(&loaded.linker_paths);
        let generator =
            CandidateGenerator::from_paths(&resolved, kb.reopen().unwrap(), 32).unwrap();
        let candidates = generator.generate(&["polar bear".to_string()], 3).unwrap();
        assert_eq!(candidates[0][0].concept_id, "T:2");
    }

    fn local_paths(paths: &LinkerPaths) -> ResolvedPaths {
        let local = |r: &ArtifactRef| match r {
            ArtifactRef::Path(p) => PathBuf::from(p),
            ArtifactRef::Remote(..) => panic!("unexpected remote artifact"),
        };
        ResolvedPaths {
            ann_index: local(&paths.ann_index),
            tfidf_vectorizer: local(&paths.tfidf_vectorizer),
            tfidf_vectors: local(&paths.tfidf_vectors),
            concept_aliases_list: local(&paths.concept_aliases_list),
        }
    }
}
