//! Abbreviation resolution
//!
//! Two passes run over each document. The parenthetical pass finds
//! "long form (SHORT)" and "SHORT (long form)" definitions in the raw text and
//! records every later occurrence of a defined short form. The taxonomic pass
//! pairs abbreviated scientific names such as "E. coli" with an earlier
//! spelled-out mention such as "Escherichia coli".
//!
//! Author: hephaex@gmail.com

use std::collections::{HashMap, HashSet};

use regex::Regex;
use taxo_core::{Abbreviation, Document, Mention, Result, Span, Stage, TaxoError};
use tracing::debug;

/// Parenthesised groups with more tokens than this are ignored
const MAX_PAREN_TOKENS: usize = 8;

/// Leading punctuation split off a whitespace-delimited word
const OPENING: &[char] = &['(', '[', '{', '"', '\''];

/// Trailing punctuation split off a whitespace-delimited word
const CLOSING: &[char] = &[')', ']', '}', '"', '\'', ',', ';', ':', '.', '!', '?'];

// ============================================================================
// Tokens
// ============================================================================

/// A token of the source text (byte offsets)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub start: usize,
    pub end: usize,
    pub text: &'a str,
}

impl<'a> Token<'a> {
    fn new(source: &'a str, start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            text: &source[start..end],
        }
    }
}

/// Split on whitespace, then peel brackets, quotes and punctuation off each
/// word. A capital initial such as "E." stays whole.
pub(crate) fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut word_start: Option<usize> = None;

    for (i, c) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
        if c.is_whitespace() {
            if let Some(start) = word_start.take() {
                split_punctuation(text, start, i, &mut tokens);
            }
        } else if word_start.is_none() {
            word_start = Some(i);
        }
    }
    tokens
}

fn split_punctuation<'a>(
    text: &'a str,
    mut start: usize,
    mut end: usize,
    tokens: &mut Vec<Token<'a>>,
) {
    while let Some(c) = text[start..end].chars().next() {
        if !OPENING.contains(&c) {
            break;
        }
        tokens.push(Token::new(text, start, start + c.len_utf8()));
        start += c.len_utf8();
    }

    let mut trailing = Vec::new();
    while let Some(c) = text[start..end].chars().next_back() {
        if !CLOSING.contains(&c) || (c == '.' && is_initial(&text[start..end])) {
            break;
        }
        trailing.push(Token::new(text, end - c.len_utf8(), end));
        end -= c.len_utf8();
    }

    if start < end {
        tokens.push(Token::new(text, start, end));
    }
    tokens.extend(trailing.into_iter().rev());
}

/// A single capital letter followed by a period
fn is_initial(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some(c), Some('.'), None) if c.is_uppercase()
    )
}

fn tokens_span(text: &str, tokens: &[Token<'_>]) -> Option<Span> {
    let (first, last) = (tokens.first()?, tokens.last()?);
    Span::from_source(text, first.start, last.end)
}

// ============================================================================
// Parenthetical Definitions
// ============================================================================

/// Find "long form (SHORT)" and "SHORT (long form)" definitions
///
/// Returns one abbreviation per occurrence of each defined short form, grouped
/// by definition in the order definitions appear. A long or short form text
/// is only ever defined once per document.
pub fn detect_parenthetical(text: &str) -> Vec<Abbreviation> {
    let tokens = tokenize(text);

    let mut seen_long: HashSet<&str> = HashSet::new();
    let mut seen_short: HashSet<&str> = HashSet::new();
    let mut definitions: Vec<(Span, &[Token<'_>])> = Vec::new();

    for (long_candidate, short_candidate) in parenthetical_candidates(text, &tokens) {
        let Some(first) = find_long_form(long_candidate, short_candidate) else {
            continue;
        };
        let (Some(long_form), Some(short_form)) = (
            tokens_span(text, &long_candidate[first..]),
            tokens_span(text, short_candidate),
        ) else {
            continue;
        };
        let long_text = &text[long_form.start..long_form.end];
        let short_text = &text[short_form.start..short_form.end];
        if seen_long.contains(long_text) || seen_short.contains(short_text) {
            continue;
        }
        seen_long.insert(long_text);
        seen_short.insert(short_text);
        definitions.push((long_form, short_candidate));
    }

    let mut abbreviations = Vec::new();
    for (long_form, short_tokens) in definitions {
        let width = short_tokens.len();
        for window_start in 0..tokens.len().saturating_sub(width - 1) {
            let window = &tokens[window_start..window_start + width];
            let matches = window
                .iter()
                .zip(short_tokens.iter())
                .all(|(a, b)| a.text == b.text);
            if !matches {
                continue;
            }
            if let Some(short_form) = tokens_span(text, window) {
                abbreviations.push(Abbreviation::new(short_form, Some(long_form.clone())));
            }
        }
    }
    abbreviations
}

/// (long form candidate, short form candidate) for every parenthesised group
fn parenthetical_candidates<'t, 'a>(
    text: &str,
    tokens: &'t [Token<'a>],
) -> Vec<(&'t [Token<'a>], &'t [Token<'a>])> {
    let mut candidates = Vec::new();
    let mut i = 0;

    while i < tokens.len() {
        if tokens[i].text != "(" {
            i += 1;
            continue;
        }
        let start = i + 1;
        i = start;
        let Some(offset) = tokens[start..].iter().position(|t| t.text == ")") else {
            break;
        };
        let end = start + offset;

        // Empty, too long, or opening the document
        if end == start || end - start > MAX_PAREN_TOKENS || start == 1 {
            continue;
        }

        let (long_candidate, short_candidate) = if end - start > 3 {
            // Long form inside the parentheses, short form is the word before
            (&tokens[start..end], &tokens[start - 2..start - 1])
        } else {
            let short = &tokens[start..end];
            let length: usize = short.iter().map(|t| t.text.chars().count()).sum();
            let max_words = (length + 5).min(length * 2);
            (&tokens[(start - 1).saturating_sub(max_words)..start - 1], short)
        };

        if short_form_filter(text, short_candidate) {
            candidates.push((long_candidate, short_candidate));
        }
    }
    candidates
}

fn short_form_filter(text: &str, short: &[Token<'_>]) -> bool {
    if !short
        .iter()
        .all(|t| (2..10).contains(&t.text.chars().count()))
    {
        return false;
    }
    let Some(span) = tokens_span(text, short) else {
        return false;
    };
    let total = span.text.chars().count();
    let alphabetic = span.text.chars().filter(|c| c.is_alphabetic()).count();
    if alphabetic * 2 < total {
        return false;
    }
    span.text
        .chars()
        .next()
        .map(char::is_alphabetic)
        .unwrap_or(false)
}

fn lower(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

/// Index of the first long-form token, matching the short form's characters
/// right to left. The first short-form character must start a word.
fn find_long_form(long_candidate: &[Token<'_>], short_candidate: &[Token<'_>]) -> Option<usize> {
    let join = |tokens: &[Token<'_>]| -> Vec<char> {
        tokens
            .iter()
            .map(|t| t.text)
            .collect::<Vec<_>>()
            .join(" ")
            .chars()
            .collect()
    };
    let long = join(long_candidate);
    let short = join(short_candidate);

    let mut long_index = long.len() as isize - 1;
    let mut short_index = short.len() as isize - 1;

    while short_index >= 0 {
        let current = lower(short[short_index as usize]);
        if !current.is_alphanumeric() {
            short_index -= 1;
            continue;
        }
        while (long_index >= 0 && lower(long[long_index as usize]) != current)
            || (short_index == 0
                && long_index > 0
                && long[(long_index - 1) as usize].is_alphanumeric())
        {
            long_index -= 1;
        }
        if long_index < 0 {
            return None;
        }
        long_index -= 1;
        short_index -= 1;
    }

    let long_index = (long_index + 1) as usize;
    let mut covered = 0;
    for (i, token) in long_candidate.iter().enumerate() {
        covered += token.text.chars().count() + 1;
        if covered > long_index {
            return Some(i);
        }
    }
    None
}

// ============================================================================
// Abbreviation Resolver
// ============================================================================

/// Detects abbreviations and attaches long forms to mentions
#[derive(Debug, Clone)]
pub struct AbbreviationResolver {
    initial: Regex,
    unresolved_self_reference: bool,
}

impl AbbreviationResolver {
    pub fn new(unresolved_self_reference: bool) -> Result<Self> {
        let initial = Regex::new(r"^[A-Z]\.$")
            .map_err(|e| TaxoError::ConfigError(format!("Invalid initial pattern: {e}")))?;
        Ok(Self {
            initial,
            unresolved_self_reference,
        })
    }

    /// Multi-token mention whose first token is a capital initial ("E. coli")
    pub fn is_abbreviated_name(&self, mention: &Mention) -> bool {
        let mut tokens = mention.text.split_whitespace();
        match (tokens.next(), tokens.next()) {
            (Some(first), Some(_)) => self.initial.is_match(first),
            _ => false,
        }
    }

    /// Whether `candidate` spells out the abbreviated name `short`
    pub fn is_long_form_of(&self, candidate: &Mention, short: &Mention) -> bool {
        if candidate.text == short.text || candidate.end >= short.start {
            return false;
        }
        let long_tokens: Vec<&str> = candidate.text.split_whitespace().collect();
        let short_tokens: Vec<&str> = short.text.split_whitespace().collect();
        if long_tokens.len() != short_tokens.len() || long_tokens.is_empty() {
            return false;
        }
        long_tokens[0].chars().next() == short_tokens[0].chars().next()
            && long_tokens[1..] == short_tokens[1..]
    }

    /// Resolve abbreviated scientific names against earlier mentions
    ///
    /// `mentions` must be in document order; when several long forms qualify
    /// the first one wins. The choice made for the first occurrence of a short
    /// text applies to every later occurrence. A long form already attached by
    /// the parenthetical pass is kept when no taxonomic one is found.
    pub fn resolve_taxonomic(&self, mentions: &mut [Mention]) -> Vec<Abbreviation> {
        let mut resolved: HashMap<String, Option<Span>> = HashMap::new();
        let mut abbreviations = Vec::new();

        for i in 0..mentions.len() {
            let short = &mentions[i];
            if !resolved.contains_key(&short.text) && self.is_abbreviated_name(short) {
                let long_form = mentions
                    .iter()
                    .find(|candidate| self.is_long_form_of(candidate, short))
                    .map(Mention::span);
                resolved.insert(short.text.clone(), long_form);
            }

            let Some(long_form) = resolved.get(&mentions[i].text).cloned() else {
                continue;
            };
            let mention = &mut mentions[i];
            match long_form {
                Some(long_form) => mention.annotations.long_form = Some(long_form),
                None if mention.annotations.long_form.is_none()
                    && self.unresolved_self_reference =>
                {
                    mention.annotations.long_form = Some(mention.span());
                }
                None => {}
            }
            abbreviations.push(Abbreviation::new(
                mention.span(),
                mention.annotations.long_form.clone(),
            ));
        }
        abbreviations
    }
}

/// Attach parenthetical long forms to mentions covering exactly a short form
fn attach_long_forms(mentions: &mut [Mention], abbreviations: &[Abbreviation]) {
    let mut by_offsets: HashMap<(usize, usize), &Span> = HashMap::new();
    for abbreviation in abbreviations {
        if let Some(long_form) = &abbreviation.long_form {
            by_offsets
                .entry((abbreviation.short_form.start, abbreviation.short_form.end))
                .or_insert(long_form);
        }
    }
    for mention in mentions.iter_mut() {
        if let Some(long_form) = by_offsets.get(&(mention.start, mention.end)) {
            mention.annotations.long_form = Some((*long_form).clone());
        }
    }
}

impl Stage for AbbreviationResolver {
    fn name(&self) -> &str {
        "abbreviation_detector"
    }

    fn process(&self, mut doc: Document) -> Result<Document> {
        doc.mentions.sort_by_key(|m| (m.start, m.end));

        let mut abbreviations = detect_parenthetical(&doc.text);
        attach_long_forms(&mut doc.mentions, &abbreviations);
        let parenthetical = abbreviations.len();
        abbreviations.extend(self.resolve_taxonomic(&mut doc.mentions));

        debug!(
            document = %doc.id,
            parenthetical,
            taxonomic = abbreviations.len() - parenthetical,
            resolved = abbreviations.iter().filter(|a| a.is_resolved()).count(),
            "Detected abbreviations"
        );
        doc.abbreviations = abbreviations;
        doc.abbreviations_detected = true;
        Ok(doc)
    }

    fn fork(&self) -> Result<Box<dyn Stage>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECOLI: &str = "Escherichia coli (E. coli) is a bacterium. E. coli is common.";

    fn texts<'a>(tokens: &[Token<'a>]) -> Vec<&'a str> {
        tokens.iter().map(|t| t.text).collect()
    }

    fn mention(text: &str, needle: &str, nth: usize) -> Mention {
        let (start, _) = text.match_indices(needle).nth(nth).unwrap();
        Mention::new(start, start + needle.len(), needle, "LIVB")
    }

    #[test]
    fn test_tokenize_peels_punctuation() {
        let tokens = tokenize(ECOLI);
        assert_eq!(
            texts(&tokens),
            vec![
                "Escherichia", "coli", "(", "E.", "coli", ")", "is", "a", "bacterium", ".", "E.",
                "coli", "is", "common", "."
            ]
        );
        for token in &tokens {
            assert_eq!(&ECOLI[token.start..token.end], token.text);
        }
    }

    #[test]
    fn test_tokenize_initial_before_comma() {
        assert_eq!(texts(&tokenize("see A., then")), vec!["see", "A.", ",", "then"]);
    }

    #[test]
    fn test_parenthetical_short_form_inside() {
        let abbreviations = detect_parenthetical(ECOLI);
        assert_eq!(abbreviations.len(), 2);
        for abbreviation in &abbreviations {
            assert_eq!(abbreviation.short_form.text, "E. coli");
            assert_eq!(
                abbreviation.long_form,
                Some(Span::new(0, 16, "Escherichia coli"))
            );
        }
        assert_eq!(abbreviations[0].short_form.start, 18);
        assert_eq!(abbreviations[1].short_form.start, 43);
    }

    #[test]
    fn test_parenthetical_acronym() {
        let text = "We ran a polymerase chain reaction (PCR) twice. PCR failed.";
        let abbreviations = detect_parenthetical(text);
        assert_eq!(abbreviations.len(), 2);
        assert_eq!(
            abbreviations[0].long_form.as_ref().unwrap().text,
            "polymerase chain reaction"
        );
        assert_eq!(abbreviations[1].short_form.text, "PCR");
    }

    #[test]
    fn test_parenthetical_long_form_inside() {
        let text = "The ARG (antibiotic resistance gene family) spreads.";
        let abbreviations = detect_parenthetical(text);
        assert_eq!(abbreviations.len(), 1);
        assert_eq!(abbreviations[0].short_form.text, "ARG");
        assert_eq!(
            abbreviations[0].long_form.as_ref().unwrap().text,
            "antibiotic resistance gene family"
        );
    }

    #[test]
    fn test_parenthetical_filters() {
        // Starts the document
        assert!(detect_parenthetical("(PCR) was run").is_empty());
        // Single-character token
        assert!(detect_parenthetical("in the results (see 2) below").is_empty());
        // No matching characters before the parentheses
        assert!(detect_parenthetical("some words here (XYZ) today").is_empty());
    }

    #[test]
    fn test_abbreviated_name_pattern() {
        let resolver = AbbreviationResolver::new(false).unwrap();
        assert!(resolver.is_abbreviated_name(&Mention::new(0, 7, "E. coli", "LIVB")));
        assert!(!resolver.is_abbreviated_name(&Mention::new(0, 6, "E coli", "LIVB")));
        assert!(!resolver.is_abbreviated_name(&Mention::new(0, 2, "E.", "LIVB")));
        assert!(!resolver.is_abbreviated_name(&Mention::new(0, 8, "Ec. coli", "LIVB")));
    }

    #[test]
    fn test_taxonomic_resolution_first_in_document_order() {
        let text = "Salmonella enterica and Shigella enterica differ from S. enterica here.";
        let resolver = AbbreviationResolver::new(false).unwrap();
        let mut mentions = vec![
            mention(text, "Salmonella enterica", 0),
            mention(text, "Shigella enterica", 0),
            mention(text, "S. enterica", 0),
        ];

        let abbreviations = resolver.resolve_taxonomic(&mut mentions);
        assert_eq!(abbreviations.len(), 1);
        assert_eq!(
            mentions[2].annotations.long_form.as_ref().unwrap().text,
            "Salmonella enterica"
        );
        assert!(abbreviations[0].is_resolved());
    }

    #[test]
    fn test_long_form_must_precede() {
        let text = "E. coli before Escherichia coli";
        let mut mentions = vec![
            mention(text, "E. coli", 0),
            mention(text, "Escherichia coli", 0),
        ];

        let resolver = AbbreviationResolver::new(false).unwrap();
        let abbreviations = resolver.resolve_taxonomic(&mut mentions);
        assert_eq!(abbreviations.len(), 1);
        assert!(abbreviations[0].long_form.is_none());
        assert!(mentions[0].annotations.long_form.is_none());

        let resolver = AbbreviationResolver::new(true).unwrap();
        let abbreviations = resolver.resolve_taxonomic(&mut mentions);
        assert_eq!(mentions[0].annotations.long_form, Some(mentions[0].span()));
        assert!(!abbreviations[0].is_resolved());
    }

    #[test]
    fn test_self_reference_for_unresolved_short_form() {
        let text = "E. coli grows fast. Later, Escherichia coli thrives.";
        let mut mentions = vec![
            mention(text, "E. coli", 0),
            mention(text, "Escherichia coli", 0),
        ];

        let resolver = AbbreviationResolver::new(true).unwrap();
        let abbreviations = resolver.resolve_taxonomic(&mut mentions);
        assert_eq!(abbreviations.len(), 1);
        assert_eq!(
            mentions[0].annotations.long_form,
            Some(Span::new(0, 7, "E. coli"))
        );
        assert_eq!(abbreviations[0].long_form, Some(mentions[0].span()));
        assert!(!abbreviations[0].is_resolved());
        assert!(mentions[1].annotations.long_form.is_none());
    }

    #[test]
    fn test_self_reference_keeps_existing_long_form() {
        let text = "Strains of Escherichia coli (E. coli) were isolated.";
        let long_form = Span::new(11, 27, "Escherichia coli");
        let mut short = mention(text, "E. coli", 0);
        short.annotations.long_form = Some(long_form.clone());
        let mut mentions = vec![short];

        let resolver = AbbreviationResolver::new(true).unwrap();
        let abbreviations = resolver.resolve_taxonomic(&mut mentions);
        assert_eq!(mentions[0].annotations.long_form, Some(long_form.clone()));
        assert_eq!(abbreviations[0].long_form, Some(long_form));
        assert!(abbreviations[0].is_resolved());
    }

    #[test]
    fn test_stage_resolves_every_occurrence() {
        let resolver = AbbreviationResolver::new(false).unwrap();
        let doc = Document::new(ECOLI).with_mentions(vec![
            mention(ECOLI, "E. coli", 1),
            mention(ECOLI, "Escherichia coli", 0),
            mention(ECOLI, "E. coli", 0),
        ]);

        let doc = resolver.process(doc).unwrap();
        assert!(doc.abbreviations_detected);
        for short in &doc.mentions[1..] {
            assert_eq!(short.text, "E. coli");
            assert_eq!(
                short.annotations.long_form,
                Some(Span::new(0, 16, "Escherichia coli"))
            );
        }
        assert!(doc.mentions[0].annotations.long_form.is_none());
        // Two parenthetical and two taxonomic records
        assert_eq!(doc.abbreviations.len(), 4);
    }

    #[test]
    fn test_parenthetical_long_form_kept_when_not_taxonomic() {
        let text = "We ran a polymerase chain reaction (PCR) twice. PCR failed.";
        let resolver = AbbreviationResolver::new(true).unwrap();
        let doc = Document::new(text).with_mentions(vec![mention(text, "PCR", 1)]);

        let doc = resolver.process(doc).unwrap();
        assert_eq!(
            doc.mentions[0].annotations.long_form.as_ref().unwrap().text,
            "polymerase chain reaction"
        );
    }
}
