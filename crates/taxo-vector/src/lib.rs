//! Taxo Vector - Lexical embeddings and nearest-neighbour search
//!
//! Provides the character n-gram tf-idf encoder used to embed mentions and
//! knowledge-base aliases, and an HNSW index for cosine search over the
//! encoded aliases.

use taxo_core::Result;

pub mod hnsw;
pub mod sparse;
pub mod tfidf;

pub use hnsw::{AnnIndex, HnswParams, Neighbor};
pub use sparse::{cosine_distance, SparseMatrix, SparseVector};
pub use tfidf::{char_wb_ngrams, TfidfVectorizer, VectorizerParams};

/// Trait for encoders mapping strings into a fixed sparse space
pub trait LexicalEncoder: Send + Sync {
    /// Encode a batch; output `i` corresponds to input `i`
    fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>>;

    /// Width of the vector space
    fn dimension(&self) -> usize;
}
