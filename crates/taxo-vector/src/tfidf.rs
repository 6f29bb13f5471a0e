//! Character n-gram tf-idf encoder
//!
//! Mentions and aliases are embedded as l2-normalised tf-idf vectors over
//! word-bounded character trigrams: each whitespace-separated word is padded
//! with a single space on both sides before n-grams are taken, so " co",
//! "col", "oli", "li " are the trigrams of "coli".
//!
//! Author: hephaex@gmail.com

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use taxo_core::{Result, TaxoError};
use tracing::debug;

use crate::sparse::SparseVector;
use crate::LexicalEncoder;

/// Fitting parameters for the vectorizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorizerParams {
    /// Character n-gram length
    pub ngram: usize,
    /// Minimum number of aliases an n-gram must appear in to be kept
    pub min_df: usize,
}

impl Default for VectorizerParams {
    fn default() -> Self {
        Self {
            ngram: 3,
            min_df: 10,
        }
    }
}

/// Word-bounded character n-grams of a lower-cased string
pub fn char_wb_ngrams(text: &str, n: usize) -> Vec<String> {
    let mut ngrams = Vec::new();
    if n == 0 {
        return ngrams;
    }

    let lowered = text.to_lowercase();
    for word in lowered.split_whitespace() {
        let padded: Vec<char> = std::iter::once(' ')
            .chain(word.chars())
            .chain(std::iter::once(' '))
            .collect();

        // A word shorter than n yields itself once
        if padded.len() <= n {
            ngrams.push(padded.iter().collect());
            continue;
        }
        for window in padded.windows(n) {
            ngrams.push(window.iter().collect());
        }
    }
    ngrams
}

/// A fitted tf-idf vectorizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    params: VectorizerParams,
    /// n-gram -> column, columns assigned in lexical order
    vocabulary: BTreeMap<String, u32>,
    /// Smoothed inverse document frequency per column
    idf: Vec<f32>,
}

impl TfidfVectorizer {
    /// Fit vocabulary and idf weights over a corpus of aliases
    pub fn fit(texts: &[String], params: VectorizerParams) -> Result<Self> {
        if params.ngram == 0 {
            return Err(TaxoError::ValidationError(
                "ngram length must be positive".to_string(),
            ));
        }

        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for text in texts {
            let unique: HashSet<String> = char_wb_ngrams(text, params.ngram).into_iter().collect();
            for ngram in unique {
                *document_frequency.entry(ngram).or_insert(0) += 1;
            }
        }

        let kept: BTreeMap<String, usize> = document_frequency
            .into_iter()
            .filter(|(_, df)| *df >= params.min_df)
            .collect();

        let n_samples = texts.len() as f32;
        let mut vocabulary = BTreeMap::new();
        let mut idf = Vec::with_capacity(kept.len());
        for (column, (ngram, df)) in kept.into_iter().enumerate() {
            vocabulary.insert(ngram, column as u32);
            idf.push(((1.0 + n_samples) / (1.0 + df as f32)).ln() + 1.0);
        }

        debug!(
            aliases = texts.len(),
            vocabulary = vocabulary.len(),
            min_df = params.min_df,
            "Fitted tf-idf vectorizer"
        );

        Ok(Self {
            params,
            vocabulary,
            idf,
        })
    }

    /// Fit and encode the same corpus
    pub fn fit_transform(
        texts: &[String],
        params: VectorizerParams,
    ) -> Result<(Self, Vec<SparseVector>)> {
        let vectorizer = Self::fit(texts, params)?;
        let vectors = vectorizer.transform(texts);
        Ok((vectorizer, vectors))
    }

    /// Encode a batch of strings
    ///
    /// An empty batch returns immediately. Strings sharing no n-gram with the
    /// vocabulary encode to the zero vector.
    pub fn transform(&self, texts: &[String]) -> Vec<SparseVector> {
        if texts.is_empty() {
            return Vec::new();
        }
        texts.iter().map(|text| self.transform_one(text)).collect()
    }

    fn transform_one(&self, text: &str) -> SparseVector {
        let mut counts: HashMap<u32, f32> = HashMap::new();
        for ngram in char_wb_ngrams(text, self.params.ngram) {
            if let Some(&column) = self.vocabulary.get(&ngram) {
                *counts.entry(column).or_insert(0.0) += 1.0;
            }
        }

        let pairs = counts
            .into_iter()
            .map(|(column, tf)| (column, tf * self.idf[column as usize]))
            .collect();
        let mut vector = SparseVector::from_pairs(pairs);
        vector.normalize();
        vector
    }

    pub fn params(&self) -> VectorizerParams {
        self.params
    }

    /// Number of vocabulary columns
    pub fn vocabulary_len(&self) -> usize {
        self.vocabulary.len()
    }

    /// Write as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = std::fs::File::create(path).map_err(|e| {
            TaxoError::StorageError(format!("Failed to create {}: {e}", path.display()))
        })?;
        serde_json::to_writer(std::io::BufWriter::new(file), self).map_err(|e| {
            TaxoError::StorageError(format!("Failed to write {}: {e}", path.display()))
        })
    }

    /// Read from JSON
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| TaxoError::NotFound(format!("{}: {e}", path.display())))?;
        let vectorizer: Self =
            serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
                TaxoError::ParseError(format!("Invalid vectorizer {}: {e}", path.display()))
            })?;

        if vectorizer.idf.len() != vectorizer.vocabulary.len() {
            return Err(TaxoError::ParseError(format!(
                "Vectorizer {} has {} idf weights for {} n-grams",
                path.display(),
                vectorizer.idf.len(),
                vectorizer.vocabulary.len()
            )));
        }
        Ok(vectorizer)
    }
}

impl LexicalEncoder for TfidfVectorizer {
    fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        Ok(self.transform(texts))
    }

    fn dimension(&self) -> usize {
        self.vocabulary.len()
    }
}
