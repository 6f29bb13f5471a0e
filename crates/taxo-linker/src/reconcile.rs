//! Span reconciliation
//!
//! Merges recognized mentions, their links and the abbreviations found in a
//! document into one deduplicated list of output records.

use taxo_core::{spans_overlap, Document, EntityRecord, KbEntity, PipelineConfig, Span};
use tracing::debug;

/// An entity accepted for output, still in byte offsets
#[derive(Debug, Clone, PartialEq)]
struct Accepted {
    start: usize,
    end: usize,
    text: String,
    kb_ents: Vec<KbEntity>,
    sentence: Option<usize>,
}

/// Builds the final entity records of a document
#[derive(Debug, Clone)]
pub struct SpanReconciler {
    label: String,
    with_abbrev: bool,
    with_linking: bool,
    with_sentence: bool,
}

impl SpanReconciler {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            label: config.label.clone(),
            with_abbrev: config.with_abbrev,
            with_linking: config.with_linking,
            with_sentence: config.with_sentence,
        }
    }

    /// Conflict-free records in document order, numbered from zero
    pub fn reconcile(&self, doc: &Document) -> Vec<EntityRecord> {
        let mut accepted: Vec<Accepted> = doc
            .mentions
            .iter()
            .filter(|m| m.start < m.end)
            .filter_map(|m| {
                let text = doc.text.get(m.start..m.end)?;
                if text.trim_matches('\n').contains('\n') {
                    return None;
                }
                if self.with_linking && !m.is_linked() {
                    return None;
                }
                Some(Accepted {
                    start: m.start,
                    end: m.end,
                    text: text.to_string(),
                    kb_ents: m.annotations.kb_ents.clone(),
                    sentence: m.annotations.sentence,
                })
            })
            .collect();
        let recognized = accepted.len();

        if self.with_abbrev {
            let promoted = self.promote_abbreviations(doc, &accepted);
            accepted.extend(promoted);
        }

        accepted.sort_by_key(|e| (e.start, e.end));
        let mut unique: Vec<Accepted> = Vec::with_capacity(accepted.len());
        for entity in accepted {
            let duplicate = unique
                .iter()
                .rev()
                .take_while(|u| (u.start, u.end) == (entity.start, entity.end))
                .any(|u| u.text == entity.text && u.kb_ents == entity.kb_ents);
            if !duplicate {
                unique.push(entity);
            }
        }

        debug!(
            document = %doc.id,
            recognized,
            records = unique.len(),
            "Reconciled entities"
        );

        unique
            .into_iter()
            .enumerate()
            .map(|(id, entity)| self.record(doc, id, entity))
            .collect()
    }

    /// Abbreviations that become entities of their own
    fn promote_abbreviations(&self, doc: &Document, entities: &[Accepted]) -> Vec<Accepted> {
        let short_forms: Vec<Span> = doc
            .abbreviations
            .iter()
            .map(|a| a.short_form.clone())
            .collect();
        let kept = select_longest(&short_forms);

        let mut promoted = Vec::new();
        for index in kept {
            let abbreviation = &doc.abbreviations[index];
            let short = &abbreviation.short_form;
            if entities
                .iter()
                .any(|e| spans_overlap(e.start, e.end, short.start, short.end))
            {
                continue;
            }
            if !abbreviation.is_resolved() || short.is_empty() {
                continue;
            }
            let Some(long_form) = &abbreviation.long_form else {
                continue;
            };
            let Some(source) = find_long_form_entity(entities, long_form) else {
                continue;
            };
            let Some(text) = doc.text.get(short.start..short.end) else {
                continue;
            };
            if text.trim_matches('\n').contains('\n') {
                continue;
            }
            promoted.push(Accepted {
                start: short.start,
                end: short.end,
                text: text.to_string(),
                kb_ents: if self.with_linking {
                    source.kb_ents.clone()
                } else {
                    Vec::new()
                },
                sentence: None,
            });
        }
        promoted
    }

    fn record(&self, doc: &Document, id: usize, entity: Accepted) -> EntityRecord {
        let sentence = if self.with_sentence {
            entity.sentence.or_else(|| doc.sentence_index(entity.start))
        } else {
            None
        };
        let (start, end) = if doc.text.is_ascii() {
            (entity.start, entity.end)
        } else {
            (doc.char_offset(entity.start), doc.char_offset(entity.end))
        };
        EntityRecord {
            id,
            label: self.label.clone(),
            start,
            end,
            text: entity.text.replace('\n', " "),
            kb_ents: self.with_linking.then_some(entity.kb_ents),
            sentence,
        }
    }
}

/// The entity a long form refers to: same offsets if present, otherwise the
/// first entity with the same text
fn find_long_form_entity<'a>(entities: &'a [Accepted], long_form: &Span) -> Option<&'a Accepted> {
    entities
        .iter()
        .find(|e| e.start == long_form.start && e.end == long_form.end)
        .or_else(|| entities.iter().find(|e| e.text == long_form.text))
}

/// Among mutually overlapping spans keep only the longest
///
/// Returns the indices of the kept spans in input order. Equal lengths favour
/// the span that comes first in `spans`.
pub fn select_longest(spans: &[Span]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..spans.len()).collect();
    order.sort_by(|&a, &b| spans[b].len().cmp(&spans[a].len()));

    let mut kept: Vec<usize> = Vec::new();
    for index in order {
        if !kept.iter().any(|&k| spans[k].overlaps(&spans[index])) {
            kept.push(index);
        }
    }
    kept.sort_unstable();
    kept
}
