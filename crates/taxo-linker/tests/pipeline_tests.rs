//! End-to-end tests: recognition, abbreviations, linking and reconciliation
//! over a small in-test knowledge base.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use taxo_core::{AppConfig, IndexBuildConfig, LinkerConfig, PipelineConfig};
use taxo_kb::{AliasStore, KbSource, KnowledgeBase};
use taxo_linker::{
    build_linker_artifacts, fit_artifacts, CandidateGenerator, EntityLinker, EntityRecognizer,
    RuleBasedRecognizer, TaxonRecognizer,
};

const RECORDS: &str = r#"{"concept_id": "562", "canonical_name": "Escherichia coli", "aliases": ["E. coli"], "types": ["species"], "definition": "Gram-negative rod-shaped bacterium"}
{"concept_id": "9644", "canonical_name": "Ursus arctos", "aliases": ["brown bear"], "types": ["species"], "definition": "Large bear of Eurasia and North America"}
{"concept_id": "9627", "canonical_name": "Vulpes vulpes", "aliases": ["red fox"], "types": ["species"], "definition": "Red fox"}
{"concept_id": "9612", "canonical_name": "Canis lupus", "aliases": ["grey wolf", "gray wolf"], "types": ["species"], "definition": "Wolf"}
{"concept_id": "28901", "canonical_name": "Salmonella enterica", "aliases": [], "types": ["species"]}
"#;

const ECOLI: &str = "Escherichia coli (E. coli) is a bacterium. E. coli is common.";

fn build_config() -> IndexBuildConfig {
    IndexBuildConfig {
        min_df: 1,
        m: 8,
        ef_construction: 64,
        seed: 7,
    }
}

fn write_kb(dir: &Path) -> KbSource {
    let path = dir.join("taxa.jsonl");
    std::fs::write(&path, RECORDS).unwrap();
    KbSource::new(path, "NCBI:")
}

fn generator(dir: &Path) -> CandidateGenerator {
    let kb = KnowledgeBase::open(write_kb(dir)).unwrap();
    fit_artifacts(&kb, &build_config())
        .unwrap()
        .into_generator(kb, 64)
        .unwrap()
}

fn full_pipeline(dir: &Path) -> TaxonRecognizer {
    let config = PipelineConfig {
        with_abbrev: true,
        with_linking: true,
        with_sentence: true,
        ..PipelineConfig::default()
    };
    pipeline_with(dir, &config)
}

fn pipeline_with(dir: &Path, config: &PipelineConfig) -> TaxonRecognizer {
    let linker = EntityLinker::new(generator(dir), LinkerConfig::default()).unwrap();
    let ner: Arc<dyn EntityRecognizer> = Arc::new(RuleBasedRecognizer::new().unwrap());
    TaxonRecognizer::new(ner, Some(linker), config).unwrap()
}

#[test]
fn test_abbreviation_shares_concept_with_long_form() {
    let dir = tempfile::tempdir().unwrap();
    let facade = full_pipeline(dir.path());

    let records = facade.find_entities(ECOLI).unwrap();
    let rows: Vec<(&str, usize, usize)> = records
        .iter()
        .map(|r| (r.text.as_str(), r.start, r.end))
        .collect();
    assert_eq!(
        rows,
        vec![
            ("Escherichia coli", 0, 16),
            ("E. coli", 18, 25),
            ("E. coli", 43, 50)
        ]
    );
    for record in &records {
        let kb_ents = record.kb_ents.as_ref().unwrap();
        assert_eq!(kb_ents[0].concept_id, "NCBI:562");
    }
    assert_eq!(records[0].sentence, Some(0));
    assert_eq!(records[2].sentence, Some(1));
    assert_eq!(
        records[1].to_tsv_row().split('\t').take(3).collect::<Vec<_>>(),
        vec!["T1", "LIVB 18 25", "E. coli"]
    );
}

#[test]
fn test_self_referenced_short_form_links_without_promotion() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig {
        with_abbrev: true,
        with_linking: true,
        unresolved_self_reference: true,
        ..PipelineConfig::default()
    };
    let facade = pipeline_with(dir.path(), &config);

    let records = facade
        .find_entities("E. coli grows fast. Later, Escherichia coli thrives.")
        .unwrap();
    let rows: Vec<(&str, usize, usize)> = records
        .iter()
        .map(|r| (r.text.as_str(), r.start, r.end))
        .collect();
    assert_eq!(rows, vec![("E. coli", 0, 7), ("Escherichia coli", 27, 43)]);
    for record in &records {
        assert_eq!(record.kb_ents.as_ref().unwrap()[0].concept_id, "NCBI:562");
    }
}

#[test]
fn test_empty_text_yields_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let facade = full_pipeline(dir.path());
    assert!(facade.find_entities("").unwrap().is_empty());
}

#[test]
fn test_unknown_taxon_is_dropped_when_linking() {
    let dir = tempfile::tempdir().unwrap();
    let facade = full_pipeline(dir.path());

    let records = facade
        .find_entities("We saw Zyzzyva quixotica near Ursus arctos.")
        .unwrap();
    let texts: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
    assert_eq!(texts, vec!["Ursus arctos"]);
}

#[test]
fn test_no_shared_trigram_gives_empty_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let generator = generator(dir.path());
    let candidates = generator
        .generate(&["qqqq zzzz".to_string(), "Canis lupus".to_string()], 10)
        .unwrap();
    assert!(candidates[0].is_empty());
    assert_eq!(candidates[1][0].concept_id, "NCBI:9612");
}

#[test]
fn test_batch_invariance() {
    let dir = tempfile::tempdir().unwrap();
    let generator = generator(dir.path());
    let ids = |candidates: &[taxo_core::Candidate]| -> BTreeSet<String> {
        candidates.iter().map(|c| c.concept_id.clone()).collect()
    };

    let alone = generator.generate(&["Ursus arctos".to_string()], 10).unwrap();
    let batch = generator
        .generate(
            &[
                "Vulpes vulpes".to_string(),
                "Ursus arctos".to_string(),
                "grey wolf".to_string(),
            ],
            10,
        )
        .unwrap();
    assert_eq!(ids(&alone[0]), ids(&batch[1]));
}

#[test]
fn test_alias_store_build_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_kb(dir.path());
    let concepts = taxo_kb::read_concepts(&source.file_path).unwrap();

    let first = AliasStore::create(dir.path().join("first.db"), &concepts).unwrap();
    let second = AliasStore::create(dir.path().join("second.db"), &concepts).unwrap();
    assert_eq!(first.alias_map().unwrap(), second.alias_map().unwrap());
}

#[test]
fn test_offsets_within_text() {
    let dir = tempfile::tempdir().unwrap();
    let facade = full_pipeline(dir.path());
    let text = "Épinoche et Vulpes vulpes. Le renard (V. vulpes) chasse.\nCanis\nlupus aussi.";

    let records = facade.find_entities(text).unwrap();
    let length = text.chars().count();
    assert!(!records.is_empty());
    for record in &records {
        assert!(record.start < record.end);
        assert!(record.end <= length);
        let chars: String = text
            .chars()
            .skip(record.start)
            .take(record.end - record.start)
            .collect();
        assert_eq!(chars.replace('\n', " "), record.text);
    }
}

#[test]
fn test_workers_share_index() {
    let dir = tempfile::tempdir().unwrap();
    let facade = full_pipeline(dir.path());
    let expected = facade.find_entities(ECOLI).unwrap();

    let workers: Vec<TaxonRecognizer> = (0..3).map(|_| facade.fork().unwrap()).collect();
    std::thread::scope(|scope| {
        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| scope.spawn(move || worker.find_entities(ECOLI).unwrap()))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    });
}

#[tokio::test]
async fn test_from_config_with_built_linker() {
    let dir = tempfile::tempdir().unwrap();
    let kb = KnowledgeBase::open(write_kb(dir.path())).unwrap();
    let out = dir.path().join("linker");
    build_linker_artifacts("test_taxa", &kb, &out, &build_config()).unwrap();

    let mut config = AppConfig::default();
    config.cache.cache_dir = dir.path().join("cache");
    config.linker.linker_name = Some(out.display().to_string());
    config.pipeline.with_linking = true;
    config.pipeline.with_abbrev = true;

    let facade = TaxonRecognizer::from_config(&config).await.unwrap();
    let records = facade.find_entities("A red fox, Vulpes vulpes, hunts.").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].kb_ents.as_ref().unwrap()[0].concept_id,
        "NCBI:9627"
    );
}

#[tokio::test]
async fn test_unknown_linker_fails_before_processing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.cache.cache_dir = dir.path().join("cache");
    config.linker.linker_name = Some("no_such_linker".to_string());
    config.pipeline.with_linking = true;

    let result = TaxonRecognizer::from_config(&config).await;
    assert!(matches!(result, Err(taxo_core::TaxoError::ConfigError(_))));
}
