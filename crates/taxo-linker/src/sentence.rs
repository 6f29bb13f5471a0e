//! Rule-based sentence segmentation

use std::ops::Range;

use regex::Regex;
use taxo_core::{Document, Result, Stage, TaxoError};

/// Splits text after terminal punctuation followed by a capitalized word
#[derive(Debug, Clone)]
pub struct SentenceSegmenter {
    boundary: Regex,
}

impl SentenceSegmenter {
    pub fn new() -> Result<Self> {
        let boundary = Regex::new(r"[.!?]+\s+\p{Lu}")
            .map_err(|e| TaxoError::ConfigError(format!("Invalid sentence pattern: {e}")))?;
        Ok(Self { boundary })
    }

    /// Sentence byte ranges covering the whole text
    ///
    /// A period closing a capital initial ("E. coli") never ends a sentence.
    pub fn split(&self, text: &str) -> Vec<Range<usize>> {
        if text.is_empty() {
            return Vec::new();
        }

        let mut sentences = Vec::new();
        let mut start = 0;
        for boundary in self.boundary.find_iter(text) {
            if ends_with_initial(&text[..boundary.start() + 1]) {
                continue;
            }
            // Next sentence starts at the capital letter
            let Some(capital) = text[boundary.range()].char_indices().next_back() else {
                continue;
            };
            let next = boundary.start() + capital.0;
            sentences.push(start..next);
            start = next;
        }
        sentences.push(start..text.len());
        sentences
    }
}

/// Text ends with a lone capital letter and a period
fn ends_with_initial(text: &str) -> bool {
    let mut chars = text.chars().rev();
    match (chars.next(), chars.next(), chars.next()) {
        (Some('.'), Some(letter), before) => {
            letter.is_uppercase() && before.map_or(true, |c| !c.is_alphanumeric())
        }
        _ => false,
    }
}

impl Stage for SentenceSegmenter {
    fn name(&self) -> &str {
        "sentence_segmenter"
    }

    fn process(&self, mut doc: Document) -> Result<Document> {
        let sentences = self.split(&doc.text);
        for mention in doc.mentions.iter_mut() {
            mention.annotations.sentence = sentences
                .iter()
                .position(|range| range.start <= mention.start && mention.start < range.end);
        }
        doc.sentences = Some(sentences);
        Ok(doc)
    }

    fn fork(&self) -> Result<Box<dyn Stage>> {
        Ok(Box::new(self.clone()))
    }
}
