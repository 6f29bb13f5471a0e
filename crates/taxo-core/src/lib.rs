//! Taxo Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout the linking system:
//! - Text spans, mentions and their per-mention annotations
//! - Knowledge base concepts and generated candidates
//! - Documents flowing through the ordered stage pipeline
//! - Output entity records
//! - Common error types
//! - Configuration management

pub mod config;

pub use config::{
    AppConfig, CacheConfig, ConfigError, IndexBuildConfig, LinkerConfig, LoggingConfig,
    PipelineConfig,
};

use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;
use uuid::Uuid;

/// Label assigned to living-being mentions when none is configured
pub const DEFAULT_LABEL: &str = "LIVB";

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for recognition and linking operations
#[derive(Error, Debug)]
pub enum TaxoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Index error: {0}")]
    IndexError(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Download error: {0}")]
    DownloadError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ConfigError> for TaxoError {
    fn from(err: ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaxoError>;

// ============================================================================
// Spans and Mentions
// ============================================================================

/// A contiguous region of a document's text (byte offsets, end exclusive)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl Span {
    /// Create a span, copying its text out of the document
    pub fn new(start: usize, end: usize, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    /// Build a span by slicing `source`; returns None for out-of-range or
    /// non-boundary offsets
    pub fn from_source(source: &str, start: usize, end: usize) -> Option<Self> {
        source
            .get(start..end)
            .map(|text| Self::new(start, end, text))
    }

    /// Length of the span in bytes
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Two spans overlap unless one lies strictly after the other.
    ///
    /// Boundaries are inclusive: spans that touch (`a.end == b.start`) overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        spans_overlap(self.start, self.end, other.start, other.end)
    }
}

/// Overlap test shared by every reconciliation step
pub fn spans_overlap(a_start: usize, a_end: usize, b_start: usize, b_end: usize) -> bool {
    !(a_start > b_end || a_end < b_start)
}

/// One ranked knowledge-base link attached to a mention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KbEntity {
    /// Canonical concept identifier (prefixed, e.g. "GBIF:2425")
    pub concept_id: String,
    /// Best matching alias of the concept
    pub alias: String,
    /// Maximum similarity over the matched aliases
    pub score: f32,
}

impl KbEntity {
    pub fn new(concept_id: impl Into<String>, alias: impl Into<String>, score: f32) -> Self {
        Self {
            concept_id: concept_id.into(),
            alias: alias.into(),
            score,
        }
    }
}

/// Mutable annotation record owned by a single mention, filled in by
/// whichever pipeline stage runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MentionAnnotations {
    /// Spelled-out form this mention abbreviates (a copy, not an owner)
    pub long_form: Option<Span>,

    /// Ranked candidate links; empty until the linker runs
    pub kb_ents: Vec<KbEntity>,

    /// Index of the sentence containing the mention
    pub sentence: Option<usize>,
}

/// A recognized entity mention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub label: String,
    #[serde(default)]
    pub annotations: MentionAnnotations,
}

impl Mention {
    /// Create a mention with empty annotations
    pub fn new(
        start: usize,
        end: usize,
        text: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            start,
            end,
            text: text.into(),
            label: label.into(),
            annotations: MentionAnnotations::default(),
        }
    }

    /// The mention's own span
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end, self.text.clone())
    }

    /// Text used for knowledge-base lookup: the long form when one was
    /// resolved and `resolve` is set, otherwise the mention itself
    pub fn lookup_text(&self, resolve: bool) -> &str {
        match (&self.annotations.long_form, resolve) {
            (Some(long_form), true) => &long_form.text,
            _ => &self.text,
        }
    }

    pub fn is_linked(&self) -> bool {
        !self.annotations.kb_ents.is_empty()
    }
}

/// Short form / long form pair detected inside one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abbreviation {
    pub short_form: Span,
    pub long_form: Option<Span>,
}

impl Abbreviation {
    pub fn new(short_form: Span, long_form: Option<Span>) -> Self {
        Self {
            short_form,
            long_form,
        }
    }

    /// Resolved to a long form other than itself
    pub fn is_resolved(&self) -> bool {
        self.long_form
            .as_ref()
            .map(|lf| lf != &self.short_form)
            .unwrap_or(false)
    }
}

// ============================================================================
// Knowledge Base Models
// ============================================================================

/// A canonical knowledge base entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    /// Unique identifier within its knowledge base
    pub concept_id: String,

    /// Preferred name (also indexed as an alias)
    pub canonical_name: String,

    /// Alternative names
    pub aliases: Vec<String>,

    /// Semantic types, in source order
    #[serde(default)]
    pub types: Vec<String>,

    /// Free-text definition, if curated
    #[serde(default)]
    pub definition: Option<String>,
}

impl Concept {
    pub fn has_definition(&self) -> bool {
        self.definition.is_some()
    }
}

/// A concept proposed for one mention, with the aliases that matched it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub concept_id: String,
    /// Matched aliases in discovery order
    pub aliases: Vec<String>,
    /// Similarity of each matched alias, parallel to `aliases`
    pub similarities: Vec<f32>,
}

impl Candidate {
    pub fn new(concept_id: impl Into<String>) -> Self {
        Self {
            concept_id: concept_id.into(),
            aliases: Vec::new(),
            similarities: Vec::new(),
        }
    }

    /// Record one matching alias
    pub fn push(&mut self, alias: impl Into<String>, similarity: f32) {
        self.aliases.push(alias.into());
        self.similarities.push(similarity);
    }

    /// Highest similarity over all matched aliases
    pub fn best_similarity(&self) -> f32 {
        self.similarities.iter().copied().fold(0.0, f32::max)
    }
}

// ============================================================================
// Documents
// ============================================================================

/// A document travelling through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Unique identifier
    pub id: Uuid,

    /// Full source text
    pub text: String,

    /// Recognized mentions, in document order
    pub mentions: Vec<Mention>,

    /// Abbreviation pairs found by the resolver, in processing order
    pub abbreviations: Vec<Abbreviation>,

    /// Set once abbreviation detection has run on this document
    pub abbreviations_detected: bool,

    /// Set once entity linking has run on this document
    pub linked: bool,

    /// Sentence boundaries, when segmented
    pub sentences: Option<Vec<Range<usize>>>,
}

impl Document {
    /// Create a new document from raw text
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            mentions: Vec::new(),
            abbreviations: Vec::new(),
            abbreviations_detected: false,
            linked: false,
            sentences: None,
        }
    }

    /// Attach mentions produced by an external recognizer
    pub fn with_mentions(mut self, mut mentions: Vec<Mention>) -> Self {
        mentions.sort_by_key(|m| (m.start, m.end));
        self.mentions = mentions;
        self
    }

    /// Index of the sentence containing the byte offset
    pub fn sentence_index(&self, offset: usize) -> Option<usize> {
        self.sentences
            .as_ref()?
            .iter()
            .position(|range| range.start <= offset && offset < range.end)
    }

    /// Convert a byte offset into a character offset
    pub fn char_offset(&self, byte_offset: usize) -> usize {
        let clamped = byte_offset.min(self.text.len());
        self.text
            .char_indices()
            .take_while(|(i, _)| *i < clamped)
            .count()
    }
}

// ============================================================================
// Output Records
// ============================================================================

/// One reconciled entity, ready for tabular output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Sequential identifier in document order
    pub id: usize,
    pub label: String,
    /// Character offset of the first character
    pub start: usize,
    /// Character offset one past the last character
    pub end: usize,
    /// Matched text with newlines replaced by spaces
    pub text: String,
    pub kb_ents: Option<Vec<KbEntity>>,
    pub sentence: Option<usize>,
}

impl EntityRecord {
    /// The "LABEL start end" offset column
    pub fn offsets(&self) -> String {
        format!("{} {} {}", self.label, self.start, self.end)
    }

    /// Render as a tab-separated row: id, offsets, text, [kb ents], [sentence]
    pub fn to_tsv_row(&self) -> String {
        let mut columns = vec![format!("T{}", self.id), self.offsets(), self.text.clone()];
        if let Some(kb_ents) = &self.kb_ents {
            let rendered: Vec<String> = kb_ents
                .iter()
                .map(|e| format!("{}|{}|{:.4}", e.concept_id, e.alias, e.score))
                .collect();
            columns.push(rendered.join(";"));
        }
        if let Some(sentence) = self.sentence {
            columns.push(sentence.to_string());
        }
        columns.join("\t")
    }
}

// ============================================================================
// Traits
// ============================================================================

/// One step of the document pipeline
///
/// Stages run in the order they are declared; each takes ownership of the
/// document, annotates it, and hands it on.
pub trait Stage: Send {
    /// Stage name for logging
    fn name(&self) -> &str;

    /// Process a document
    fn process(&self, doc: Document) -> Result<Document>;

    /// An independent copy of this stage for another worker thread
    fn fork(&self) -> Result<Box<dyn Stage>>;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_inclusive_boundaries() {
        let a = Span::new(0, 3, "abc");
        let b = Span::new(3, 5, "de");
        let c = Span::new(4, 6, "ef");

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn test_lookup_text_substitutes_long_form() {
        let mut mention = Mention::new(18, 25, "E. coli", DEFAULT_LABEL);
        assert_eq!(mention.lookup_text(true), "E. coli");

        mention.annotations.long_form = Some(Span::new(0, 16, "Escherichia coli"));
        assert_eq!(mention.lookup_text(true), "Escherichia coli");
        assert_eq!(mention.lookup_text(false), "E. coli");
    }

    #[test]
    fn test_abbreviation_self_reference_is_unresolved() {
        let short = Span::new(0, 7, "E. coli");
        assert!(!Abbreviation::new(short.clone(), None).is_resolved());
        assert!(!Abbreviation::new(short.clone(), Some(short.clone())).is_resolved());
        assert!(
            Abbreviation::new(short, Some(Span::new(20, 36, "Escherichia coli"))).is_resolved()
        );
    }

    #[test]
    fn test_candidate_best_similarity() {
        let mut candidate = Candidate::new("GBIF:1");
        candidate.push("Ursus arctos", 0.82);
        candidate.push("Brown bear", 0.91);
        assert!((candidate.best_similarity() - 0.91).abs() < f32::EPSILON);
    }

    #[test]
    fn test_concept_optional_fields() {
        let concept: Concept = serde_json::from_str(
            r#"{"concept_id": "1", "canonical_name": "Ursus arctos", "aliases": ["brown bear"]}"#,
        )
        .unwrap();
        assert!(concept.types.is_empty());
        assert!(!concept.has_definition());

        let missing: std::result::Result<Concept, _> =
            serde_json::from_str(r#"{"canonical_name": "Ursus arctos", "aliases": []}"#);
        assert!(missing.is_err());
    }

    #[test]
    fn test_char_offset_multibyte() {
        let doc = Document::new("Épinoche Gasterosteus aculeatus");
        let byte = doc.text.find("Gasterosteus").unwrap();
        assert_eq!(byte, 10);
        assert_eq!(doc.char_offset(byte), 9);
        assert_eq!(doc.char_offset(doc.text.len()), doc.text.chars().count());
    }

    #[test]
    fn test_sentence_index() {
        let mut doc = Document::new("One. Two.");
        doc.sentences = Some(vec![0..5, 5..9]);
        assert_eq!(doc.sentence_index(0), Some(0));
        assert_eq!(doc.sentence_index(6), Some(1));
        assert_eq!(doc.sentence_index(42), None);
    }

    proptest::proptest! {
        #[test]
        fn test_overlap_is_symmetric(
            a in 0usize..100,
            la in 0usize..20,
            b in 0usize..100,
            lb in 0usize..20,
        ) {
            let x = Span::new(a, a + la, "");
            let y = Span::new(b, b + lb, "");
            proptest::prop_assert_eq!(x.overlaps(&y), y.overlaps(&x));
            proptest::prop_assert!(x.overlaps(&x));
        }
    }

    #[test]
    fn test_entity_record_tsv_row() {
        let record = EntityRecord {
            id: 0,
            label: DEFAULT_LABEL.to_string(),
            start: 0,
            end: 16,
            text: "Escherichia coli".to_string(),
            kb_ents: Some(vec![KbEntity::new("GBIF:1", "Escherichia coli", 1.0)]),
            sentence: Some(0),
        };
        assert_eq!(
            record.to_tsv_row(),
            "T0\tLIVB 0 16\tEscherichia coli\tGBIF:1|Escherichia coli|1.0000\t0"
        );
    }
}
