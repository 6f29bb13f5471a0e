//! Entity linking
//!
//! Assigns each mention a short ranked list of knowledge base concepts.
//! Short forms are looked up through their resolved long form, candidates
//! without a curated definition must clear a stricter threshold, and mentions
//! left without any acceptable candidate are dropped.

use std::collections::{HashMap, HashSet};

use taxo_core::{Candidate, Document, KbEntity, LinkerConfig, Mention, Result, Stage};
use tracing::debug;

use crate::candidate::CandidateGenerator;

/// Links mentions to knowledge base concepts
#[derive(Debug)]
pub struct EntityLinker {
    generator: CandidateGenerator,
    config: LinkerConfig,
}

impl EntityLinker {
    pub fn new(generator: CandidateGenerator, config: LinkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { generator, config })
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    pub fn generator(&self) -> &CandidateGenerator {
        &self.generator
    }

    /// Fill in `kb_ents` for every mention
    ///
    /// With `resolve` set, a mention carrying a long form is looked up by the
    /// long form's text. Every distinct lookup string is generated once.
    pub fn link_mentions(&self, mentions: &mut [Mention], resolve: bool) -> Result<()> {
        let lookup: Vec<String> = mentions
            .iter()
            .map(|m| m.lookup_text(resolve).to_string())
            .collect();

        let mut unique: Vec<String> = Vec::new();
        let mut position: HashMap<&str, usize> = HashMap::new();
        for text in &lookup {
            position.entry(text.as_str()).or_insert_with(|| {
                unique.push(text.clone());
                unique.len() - 1
            });
        }
        if unique.is_empty() {
            return Ok(());
        }

        let batch = self.generator.generate(&unique, self.config.k)?;
        let defined = self.defined_concepts(&batch)?;

        let ranked: Vec<Vec<KbEntity>> = batch
            .iter()
            .map(|candidates| rank_candidates(candidates, &defined, &self.config))
            .collect();

        for (mention, text) in mentions.iter_mut().zip(lookup.iter()) {
            if let Some(&i) = position.get(text.as_str()) {
                mention.annotations.kb_ents = ranked[i].clone();
            }
        }
        Ok(())
    }

    /// Concepts with a definition, among those that would need one
    fn defined_concepts(&self, batch: &[Vec<Candidate>]) -> Result<HashSet<String>> {
        if !self.config.filter_for_definitions {
            return Ok(HashSet::new());
        }

        let mut seen = HashSet::new();
        let weak: Vec<String> = batch
            .iter()
            .flatten()
            .filter(|c| c.best_similarity() < self.config.no_definition_threshold)
            .filter(|c| seen.insert(c.concept_id.as_str()))
            .map(|c| c.concept_id.clone())
            .collect();
        if weak.is_empty() {
            return Ok(HashSet::new());
        }

        let concepts = self.generator.kb().concepts(&weak)?;
        Ok(concepts
            .into_iter()
            .filter(|(_, concept)| concept.has_definition())
            .map(|(id, _)| id)
            .collect())
    }
}

/// Score, filter, sort and cap one mention's candidates
///
/// `defined` must contain every concept id with a definition among the
/// candidates scoring below the no-definition threshold. Ties keep
/// discovery order.
pub fn rank_candidates(
    candidates: &[Candidate],
    defined: &HashSet<String>,
    config: &LinkerConfig,
) -> Vec<KbEntity> {
    let mut ranked: Vec<KbEntity> = Vec::new();
    for candidate in candidates {
        let score = candidate.best_similarity();
        if config.filter_for_definitions
            && score < config.no_definition_threshold
            && !defined.contains(&candidate.concept_id)
        {
            continue;
        }
        if score > config.threshold {
            let alias = candidate.aliases.first().cloned().unwrap_or_default();
            ranked.push(KbEntity::new(candidate.concept_id.clone(), alias, score));
        }
    }
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(config.max_entities_per_mention);
    ranked
}

impl Stage for EntityLinker {
    fn name(&self) -> &str {
        "entity_linker"
    }

    fn process(&self, mut doc: Document) -> Result<Document> {
        let resolve = self.config.resolve_abbreviations && doc.abbreviations_detected;
        self.link_mentions(&mut doc.mentions, resolve)?;

        let before = doc.mentions.len();
        doc.mentions.retain(|m| m.is_linked());
        debug!(
            document = %doc.id,
            linked = doc.mentions.len(),
            dropped = before - doc.mentions.len(),
            "Linked mentions"
        );
        doc.linked = true;
        Ok(doc)
    }

    fn fork(&self) -> Result<Box<dyn Stage>> {
        Ok(Box::new(Self {
            generator: self.generator.fork()?,
            config: self.config.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::fit_artifacts;
    use proptest::prelude::*;
    use taxo_core::{IndexBuildConfig, Span};
    use taxo_kb::{KbSource, KnowledgeBase};

    const RECORDS: &str = r#"{"concept_id": "1", "canonical_name": "Escherichia coli", "aliases": [], "definition": "Gram-negative bacterium"}
{"concept_id": "2", "canonical_name": "Ursus arctos", "aliases": ["brown bear"], "definition": "Bear"}
{"concept_id": "3", "canonical_name": "Ursus arctos horribilis", "aliases": []}
"#;

    fn linker(dir: &std::path::Path, config: LinkerConfig) -> EntityLinker {
        let path = dir.join("kb.jsonl");
        std::fs::write(&path, RECORDS).unwrap();
        let kb = KnowledgeBase::open(KbSource::new(path, "")).unwrap();
        let build = IndexBuildConfig {
            min_df: 1,
            m: 4,
            ef_construction: 32,
            seed: 5,
        };
        let generator = fit_artifacts(&kb, &build).unwrap().into_generator(kb, 32).unwrap();
        EntityLinker::new(generator, config).unwrap()
    }

    fn candidate(id: &str, similarities: &[f32]) -> Candidate {
        let mut c = Candidate::new(id);
        for (i, s) in similarities.iter().enumerate() {
            c.push(format!("{id}-alias-{i}"), *s);
        }
        c
    }

    #[test]
    fn test_rank_applies_thresholds() {
        let config = LinkerConfig::default();
        let defined: HashSet<String> = ["a".to_string()].into_iter().collect();
        let candidates = vec![
            candidate("a", &[0.75, 0.8]),
            candidate("b", &[0.9]),  // no definition, below 0.95
            candidate("c", &[0.97]), // no definition, strong enough
            candidate("d", &[0.7]),  // not above threshold
        ];

        let ranked = rank_candidates(&candidates, &defined, &config);
        let ids: Vec<&str> = ranked.iter().map(|e| e.concept_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(ranked[1].alias, "a-alias-0");
        assert!((ranked[1].score - 0.8).abs() < f32::EPSILON);
    }

    #[test]
    fn test_rank_without_definition_filter() {
        let config = LinkerConfig {
            filter_for_definitions: false,
            ..LinkerConfig::default()
        };
        let ranked = rank_candidates(&[candidate("b", &[0.9])], &HashSet::new(), &config);
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn test_rank_ties_keep_discovery_order() {
        let config = LinkerConfig {
            filter_for_definitions: false,
            max_entities_per_mention: 2,
            ..LinkerConfig::default()
        };
        let candidates = vec![
            candidate("first", &[0.9]),
            candidate("second", &[0.9]),
            candidate("third", &[0.9]),
        ];
        let ranked = rank_candidates(&candidates, &HashSet::new(), &config);
        let ids: Vec<&str> = ranked.iter().map(|e| e.concept_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    proptest! {
        #[test]
        fn test_rank_sorted_and_capped(
            scores in proptest::collection::vec(0.0f32..=1.0, 0..40),
            max in 1usize..8,
        ) {
            let config = LinkerConfig {
                filter_for_definitions: false,
                max_entities_per_mention: max,
                ..LinkerConfig::default()
            };
            let candidates: Vec<Candidate> = scores
                .iter()
                .enumerate()
                .map(|(i, s)| candidate(&i.to_string(), &[*s]))
                .collect();
            let ranked = rank_candidates(&candidates, &HashSet::new(), &config);
            prop_assert!(ranked.len() <= max);
            prop_assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
            prop_assert!(ranked.iter().all(|e| e.score > config.threshold));
        }
    }

    #[test]
    fn test_long_form_substitution() {
        let dir = tempfile::tempdir().unwrap();
        let linker = linker(dir.path(), LinkerConfig::default());

        let mut short = Mention::new(18, 25, "E. coli", "LIVB");
        short.annotations.long_form = Some(Span::new(0, 16, "Escherichia coli"));
        let mut mentions = vec![Mention::new(0, 16, "Escherichia coli", "LIVB"), short];

        linker.link_mentions(&mut mentions, true).unwrap();
        assert_eq!(mentions[0].annotations.kb_ents[0].concept_id, "1");
        assert_eq!(mentions[1].annotations.kb_ents, mentions[0].annotations.kb_ents);
    }

    #[test]
    fn test_stage_drops_unlinked_mentions() {
        let dir = tempfile::tempdir().unwrap();
        let linker = linker(dir.path(), LinkerConfig::default());

        let doc = Document::new("Ursus arctos and Qqqq zzzz").with_mentions(vec![
            Mention::new(0, 12, "Ursus arctos", "LIVB"),
            Mention::new(17, 26, "Qqqq zzzz", "LIVB"),
        ]);
        let doc = linker.process(doc).unwrap();
        assert!(doc.linked);
        assert_eq!(doc.mentions.len(), 1);
        assert_eq!(doc.mentions[0].annotations.kb_ents[0].concept_id, "2");
    }

    #[test]
    fn test_weak_undefined_concept_is_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let config = LinkerConfig {
            threshold: 0.3,
            ..LinkerConfig::default()
        };
        let linker = linker(dir.path(), config);

        // Concept 3 has no definition and only matches partially
        let mut mentions = vec![Mention::new(0, 12, "Ursus arctos", "LIVB")];
        linker.link_mentions(&mut mentions, false).unwrap();
        let ids: Vec<&str> = mentions[0]
            .annotations
            .kb_ents
            .iter()
            .map(|e| e.concept_id.as_str())
            .collect();
        assert!(ids.contains(&"2"));
        assert!(!ids.contains(&"3"));
    }
}
