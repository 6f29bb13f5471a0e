//! Taxo Linker - Taxonomic entity recognition and linking pipeline
//!
//! Turns raw text into reconciled, knowledge-base linked taxon mentions:
//! recognition -> abbreviation resolution -> candidate generation ->
//! entity linking -> span reconciliation.

use taxo_core::{Mention, Result};

/// Trait for named-entity recognizers feeding the pipeline
pub trait EntityRecognizer: Send + Sync {
    /// Find mentions in `text`, labelled with `label`, in document order
    fn recognize(&self, text: &str, label: &str) -> Result<Vec<Mention>>;
}

pub mod abbreviation;
pub mod builder;
pub mod candidate;
pub mod linker;
pub mod ner;
pub mod pipeline;
pub mod reconcile;
pub mod sentence;

pub use abbreviation::AbbreviationResolver;
pub use builder::{build_linker_artifacts, fit_artifacts, LinkerArtifacts};
pub use candidate::{CandidateGenerator, CandidateGeneratorBuilder};
pub use linker::EntityLinker;
pub use ner::RuleBasedRecognizer;
pub use pipeline::{
    ann_file_name, corpus_files, write_records, Pipeline, RecognizerStage, TaxonRecognizer,
};
pub use reconcile::SpanReconciler;
pub use sentence::SentenceSegmenter;
