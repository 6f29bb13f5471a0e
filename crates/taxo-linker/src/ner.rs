//! Rule-based taxon recognition
//!
//! Stands in for a trained recognizer: regex patterns for binomial names
//! ("Ursus arctos") and abbreviated binomials ("E. coli"), plus an optional
//! dictionary of known names. Overlapping matches are resolved in favour of
//! the higher-confidence, then longer, match.

use std::collections::HashSet;

use regex::Regex;
use taxo_core::{Mention, Result, TaxoError};

use crate::EntityRecognizer;

/// Endings accepted for a specific epithet
const EPITHET_ENDINGS: &[&str] = &[
    "us", "a", "um", "is", "i", "ae", "es", "os", "on", "ix", "ex", "ensis", "oides",
];

/// Capitalized words that start sentences far more often than genera
const GENUS_STOPWORDS: &[&str] = &[
    "The", "This", "These", "Those", "That", "There", "Their", "They", "Then", "Thus", "In",
    "On", "At", "An", "As", "We", "It", "Its", "Our", "For", "From", "With", "When", "Where",
    "While", "Which", "After", "Before", "During", "Here", "Some", "Many", "Most", "All",
    "Each", "Both", "Such", "However", "Moreover", "Although", "Figure", "Table", "Data",
];

/// A raw pattern or dictionary match
#[derive(Debug, Clone)]
struct Match {
    start: usize,
    end: usize,
    confidence: f32,
}

/// Pattern and dictionary recognizer for taxon names
#[derive(Debug, Clone)]
pub struct RuleBasedRecognizer {
    binomial: Regex,
    abbreviated: Regex,
    dictionary: Vec<String>,
    stopwords: HashSet<&'static str>,
}

impl RuleBasedRecognizer {
    pub fn new() -> Result<Self> {
        let binomial = Regex::new(r"\b[A-Z][a-z]{2,}\s+[a-z]{3,}\b")
            .map_err(|e| TaxoError::ConfigError(format!("Invalid binomial pattern: {e}")))?;
        let abbreviated = Regex::new(r"\b[A-Z]\.\s?[a-z]{3,}\b")
            .map_err(|e| TaxoError::ConfigError(format!("Invalid abbreviation pattern: {e}")))?;
        Ok(Self {
            binomial,
            abbreviated,
            dictionary: Vec::new(),
            stopwords: GENUS_STOPWORDS.iter().copied().collect(),
        })
    }

    /// Also recognize these exact names (vernacular names, genera, ...)
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dictionary.extend(
            names
                .into_iter()
                .map(Into::<String>::into)
                .filter(|n| !n.trim().is_empty()),
        );
        self
    }

    fn has_epithet_ending(word: &str) -> bool {
        EPITHET_ENDINGS.iter().any(|ending| word.ends_with(ending))
    }

    fn match_binomials(&self, text: &str) -> Vec<Match> {
        self.binomial
            .find_iter(text)
            .filter(|m| {
                let mut words = m.as_str().split_whitespace();
                match (words.next(), words.next()) {
                    (Some(genus), Some(epithet)) => {
                        !self.stopwords.contains(genus) && Self::has_epithet_ending(epithet)
                    }
                    _ => false,
                }
            })
            .map(|m| Match {
                start: m.start(),
                end: m.end(),
                confidence: 0.8,
            })
            .collect()
    }

    fn match_abbreviated(&self, text: &str) -> Vec<Match> {
        self.abbreviated
            .find_iter(text)
            .filter(|m| {
                m.as_str()
                    .rsplit(|c: char| c == '.' || c.is_whitespace())
                    .next()
                    .map(Self::has_epithet_ending)
                    .unwrap_or(false)
            })
            .map(|m| Match {
                start: m.start(),
                end: m.end(),
                confidence: 0.85,
            })
            .collect()
    }

    fn match_dictionary(&self, text: &str) -> Vec<Match> {
        let mut matches = Vec::new();
        for name in &self.dictionary {
            for (start, found) in text.match_indices(name.as_str()) {
                let end = start + found.len();
                let before = text[..start].chars().next_back();
                let after = text[end..].chars().next();
                if before.map_or(true, |c| !c.is_alphanumeric())
                    && after.map_or(true, |c| !c.is_alphanumeric())
                {
                    matches.push(Match {
                        start,
                        end,
                        confidence: 0.95,
                    });
                }
            }
        }
        matches
    }

    /// Drop overlapping matches, keeping the most confident then the longest
    fn deduplicate(mut matches: Vec<Match>) -> Vec<Match> {
        matches.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then((b.end - b.start).cmp(&(a.end - a.start)))
                .then(a.start.cmp(&b.start))
        });

        let mut kept: Vec<Match> = Vec::new();
        for candidate in matches {
            if !kept
                .iter()
                .any(|k| candidate.start < k.end && k.start < candidate.end)
            {
                kept.push(candidate);
            }
        }
        kept.sort_by_key(|m| m.start);
        kept
    }
}

impl EntityRecognizer for RuleBasedRecognizer {
    fn recognize(&self, text: &str, label: &str) -> Result<Vec<Mention>> {
        let mut matches = self.match_dictionary(text);
        matches.extend(self.match_abbreviated(text));
        matches.extend(self.match_binomials(text));

        Ok(Self::deduplicate(matches)
            .into_iter()
            .map(|m| Mention::new(m.start, m.end, &text[m.start..m.end], label))
            .collect())
    }
}
