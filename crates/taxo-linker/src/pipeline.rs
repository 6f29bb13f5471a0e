//! Ordered stage pipeline and the recognition facade
//!
//! A [`Pipeline`] runs its stages in declaration order over one document and
//! hands the result to the [`SpanReconciler`]. [`TaxonRecognizer`] assembles
//! the pipeline from configuration and adds file and corpus entry points.
//!
//! Author: hephaex@gmail.com

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use taxo_core::{AppConfig, Document, EntityRecord, PipelineConfig, Result, Stage, TaxoError};
use tracing::{debug, info, warn};

use crate::abbreviation::AbbreviationResolver;
use crate::candidate::CandidateGenerator;
use crate::linker::EntityLinker;
use crate::ner::RuleBasedRecognizer;
use crate::reconcile::SpanReconciler;
use crate::sentence::SentenceSegmenter;
use crate::EntityRecognizer;

// ============================================================================
// Recognizer Stage
// ============================================================================

/// Runs an [`EntityRecognizer`] and attaches its mentions to the document
#[derive(Clone)]
pub struct RecognizerStage {
    recognizer: Arc<dyn EntityRecognizer>,
    label: String,
}

impl RecognizerStage {
    pub fn new(recognizer: Arc<dyn EntityRecognizer>, label: impl Into<String>) -> Self {
        Self {
            recognizer,
            label: label.into(),
        }
    }
}

impl Stage for RecognizerStage {
    fn name(&self) -> &str {
        "recognizer"
    }

    fn process(&self, doc: Document) -> Result<Document> {
        let mentions = self.recognizer.recognize(&doc.text, &self.label)?;
        Ok(doc.with_mentions(mentions))
    }

    fn fork(&self) -> Result<Box<dyn Stage>> {
        Ok(Box::new(self.clone()))
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Stages applied in order, followed by span reconciliation
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    reconciler: SpanReconciler,
}

impl Pipeline {
    pub fn new(reconciler: SpanReconciler) -> Self {
        Self {
            stages: Vec::new(),
            reconciler,
        }
    }

    /// Append a stage; it runs after every stage registered before it
    pub fn register<S: Stage + 'static>(&mut self, stage: S) {
        self.stages.push(Box::new(stage));
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage over the document
    pub fn run(&self, mut doc: Document) -> Result<Document> {
        for stage in &self.stages {
            let started = std::time::Instant::now();
            doc = stage.process(doc)?;
            debug!(
                stage = stage.name(),
                mentions = doc.mentions.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage finished"
            );
        }
        Ok(doc)
    }

    /// Run the stages and reconcile the result into output records
    pub fn annotate(&self, text: &str) -> Result<Vec<EntityRecord>> {
        let doc = self.run(Document::new(text))?;
        Ok(self.reconciler.reconcile(&doc))
    }

    /// An independent pipeline for another worker
    pub fn fork(&self) -> Result<Self> {
        let stages = self
            .stages
            .iter()
            .map(|s| s.fork())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            stages,
            reconciler: self.reconciler.clone(),
        })
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("reconciler", &self.reconciler)
            .finish()
    }
}

// ============================================================================
// Facade
// ============================================================================

/// Finds and links taxon mentions in text, files and corpora
#[derive(Debug)]
pub struct TaxonRecognizer {
    pipeline: Pipeline,
}

impl TaxonRecognizer {
    /// Assemble the pipeline: recognition, sentences, abbreviations, linking
    ///
    /// `linker` is required when `config.with_linking` is set.
    pub fn new(
        recognizer: Arc<dyn EntityRecognizer>,
        linker: Option<EntityLinker>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let mut pipeline = Pipeline::new(SpanReconciler::new(config));
        pipeline.register(RecognizerStage::new(recognizer, config.label.clone()));

        if config.with_sentence {
            pipeline.register(SentenceSegmenter::new()?);
        }
        if config.with_abbrev {
            pipeline.register(AbbreviationResolver::new(config.unresolved_self_reference)?);
        }
        if config.with_linking {
            let linker = linker.ok_or_else(|| {
                TaxoError::ConfigError(
                    "Linking is enabled but no entity linker was given".to_string(),
                )
            })?;
            pipeline.register(linker);
        }

        info!(stages = ?pipeline.stage_names(), "Pipeline ready");
        Ok(Self { pipeline })
    }

    /// Build from application configuration, loading the linker if enabled
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let recognizer: Arc<dyn EntityRecognizer> = Arc::new(RuleBasedRecognizer::new()?);

        let linker = if config.pipeline.with_linking {
            let mut builder = CandidateGenerator::builder().ef_search(config.linker.ef_search);
            if let Some(name) = &config.linker.linker_name {
                builder = builder.linker(name.clone());
            }
            let generator = builder.build(&config.cache).await?;
            Some(EntityLinker::new(generator, config.linker.clone())?)
        } else {
            None
        };

        Self::new(recognizer, linker, &config.pipeline)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// An independent facade for another worker, sharing the index and
    /// encoder but holding its own alias store connection
    pub fn fork(&self) -> Result<Self> {
        Ok(Self {
            pipeline: self.pipeline.fork()?,
        })
    }

    pub fn find_entities(&self, text: &str) -> Result<Vec<EntityRecord>> {
        self.pipeline.annotate(text)
    }

    pub fn find_in_file(&self, path: impl AsRef<Path>) -> Result<Vec<EntityRecord>> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(TaxoError::NotFound(format!(
                "No such file: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            TaxoError::StorageError(format!("Failed to read {}: {e}", path.display()))
        })?;
        let records = self.find_entities(&text)?;
        debug!(path = %path.display(), entities = records.len(), "Processed file");
        Ok(records)
    }

    /// Process every `*.txt` file of a directory, skipping files that fail
    pub fn find_in_corpus(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<Vec<(PathBuf, Vec<EntityRecord>)>> {
        let files = corpus_files(dir)?;
        let mut results = Vec::with_capacity(files.len());
        for path in files {
            match self.find_in_file(&path) {
                Ok(records) => results.push((path, records)),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping file"),
            }
        }
        Ok(results)
    }
}

/// Sorted `*.txt` files directly inside `dir`
pub fn corpus_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(TaxoError::NotFound(format!(
            "No such directory: {}",
            dir.display()
        )));
    }
    let entries = std::fs::read_dir(dir).map_err(|e| {
        TaxoError::StorageError(format!("Failed to list {}: {e}", dir.display()))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "txt"))
        .collect();
    files.sort();
    Ok(files)
}

/// `<stem>.ann` for an input text file
pub fn ann_file_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}.ann")
}

/// Write records as tab-separated rows, one per line
pub fn write_records<W: Write>(writer: &mut W, records: &[EntityRecord]) -> Result<()> {
    for record in records {
        writeln!(writer, "{}", record.to_tsv_row())
            .map_err(|e| TaxoError::StorageError(format!("Failed to write records: {e}")))?;
    }
    Ok(())
}
