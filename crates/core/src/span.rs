use crate::error::{EngineError, EngineResult};
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use serde::{Deserialize, Serialize};

/// A `[start, end)` range of character offsets into an artifact text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Checks `start < end <= len` for a text of `len` characters.
    pub fn validate(&self, len: usize) -> EngineResult<()> {
        if self.start < self.end && self.end <= len {
            Ok(())
        } else {
            Err(EngineError::InvalidSpan {
                start: self.start,
                end: self.end,
                len,
            })
        }
    }

    /// Returns the substring this span covers.
    pub fn slice(&self, text: &str) -> String {
        text.chars()
            .skip(self.start)
            .take(self.end.saturating_sub(self.start))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Normalized,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanResolution {
    pub span: Option<Span>,
    /// The artifact text covered by `span`, which is what gets highlighted.
    pub matched_text: Option<String>,
    pub method: MatchMethod,
}

impl SpanResolution {
    fn unresolved() -> Self {
        Self {
            span: None,
            matched_text: None,
            method: MatchMethod::Unresolved,
        }
    }
}

// Words shorter than this never count as "mentioned" by a turn.
const MIN_MENTION_WORD_LEN: usize = 4;
// SkimMatcherV2 awards 16 points per matched character, so a word that only
// reaches this score per character appeared contiguously in the turn.
const MENTION_SCORE_PER_CHAR: i64 = 16;

/// The artifact text folded to lower case, without punctuation and with
/// whitespace collapsed, remembering where each folded char came from.
struct NormalizedText {
    chars: Vec<char>,
    origin: Vec<usize>,
}

fn normalize(text: &str) -> NormalizedText {
    let mut chars = Vec::new();
    let mut origin = Vec::new();
    let mut pending_space: Option<usize> = None;

    for (idx, ch) in text.chars().enumerate() {
        if ch.is_whitespace() {
            if !chars.is_empty() {
                pending_space = Some(idx);
            }
            continue;
        }
        if !ch.is_alphanumeric() {
            continue;
        }
        if let Some(space_idx) = pending_space.take() {
            chars.push(' ');
            origin.push(space_idx);
        }
        for lower in ch.to_lowercase() {
            chars.push(lower);
            origin.push(idx);
        }
    }

    NormalizedText { chars, origin }
}

fn find_all(haystack: &[char], needle: &[char]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(|(_, window)| *window == needle)
        .map(|(idx, _)| idx)
        .collect()
}

fn nearest(starts: &[usize], anchor: Option<usize>) -> Option<usize> {
    match anchor {
        Some(anchor) => starts.iter().copied().min_by_key(|s| s.abs_diff(anchor)),
        None => starts.first().copied(),
    }
}

/// Resolves quoted or spoken fragments to character offsets in one artifact.
///
/// Resolution is a pure function of the artifact, the fragment and the
/// anchor, so running it twice always yields the same offsets.
pub struct SpanLocator<'a> {
    text: &'a str,
    chars: Vec<char>,
    normalized: NormalizedText,
    matcher: SkimMatcherV2,
}

impl<'a> SpanLocator<'a> {
    pub fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.chars().collect(),
            normalized: normalize(text),
            matcher: SkimMatcherV2::default(),
        }
    }

    /// Length of the artifact in characters.
    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// The artifact text covered by an already validated span.
    pub fn slice(&self, span: Span) -> String {
        self.chars[span.start..span.end].iter().collect()
    }

    /// Finds `fragment` in the artifact.
    ///
    /// An exact, case-sensitive match is tried first, then a match on the
    /// normalized forms of both texts. When the fragment occurs more than once
    /// the occurrence closest to `anchor` wins, or the first one without an
    /// anchor.
    pub fn locate(&self, fragment: &str, anchor: Option<usize>) -> SpanResolution {
        let needle: Vec<char> = fragment.chars().collect();
        if let Some(start) = nearest(&find_all(&self.chars, &needle), anchor) {
            let span = Span::new(start, start + needle.len());
            return SpanResolution {
                span: Some(span),
                matched_text: Some(fragment.to_string()),
                method: MatchMethod::Exact,
            };
        }

        let folded = normalize(fragment).chars;
        let windows = find_all(&self.normalized.chars, &folded);
        let starts: Vec<usize> = windows
            .iter()
            .map(|idx| self.normalized.origin[*idx])
            .collect();
        let Some(start) = nearest(&starts, anchor) else {
            return SpanResolution::unresolved();
        };

        // Map the chosen window back onto the original text through the
        // origin of its last folded char.
        let Some(window) = windows
            .iter()
            .find(|idx| self.normalized.origin[**idx] == start)
        else {
            return SpanResolution::unresolved();
        };
        let end = self.normalized.origin[window + folded.len() - 1] + 1;
        let span = Span::new(start, end);

        SpanResolution {
            span: Some(span),
            matched_text: Some(span.slice(self.text)),
            method: MatchMethod::Normalized,
        }
    }

    /// Returns the offset of the artifact line a turn talks about most, if any.
    ///
    /// Each word of each line is fuzzy matched against the turn; only words
    /// that appear (nearly) contiguously count as mentioned, and the line with
    /// the highest total wins. Ties go to the earlier line.
    pub fn anchor_from_turn(&self, turn_text: &str) -> Option<usize> {
        let turn_lower = turn_text.to_lowercase();
        let mut best: Option<(i64, usize)> = None;
        let mut line_start = 0;

        for line in self.text.split('\n') {
            let score: i64 = line
                .split(|c: char| !c.is_alphanumeric())
                .filter(|word| word.chars().count() >= MIN_MENTION_WORD_LEN)
                .filter_map(|word| {
                    let word = word.to_lowercase();
                    let threshold = MENTION_SCORE_PER_CHAR * word.chars().count() as i64;
                    self.matcher
                        .fuzzy_match(&turn_lower, &word)
                        .filter(|score| *score >= threshold)
                })
                .sum();

            if score > 0 && best.is_none_or(|(top, _)| score > top) {
                best = Some((score, line_start));
            }
            line_start += line.chars().count() + 1;
        }

        best.map(|(_, offset)| offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_reports_exact_offsets() {
        let locator = SpanLocator::new("The moment passed quietly.");
        let res = locator.locate("passed", None);
        assert_eq!(res.method, MatchMethod::Exact);
        assert_eq!(res.span, Some(Span::new(11, 17)));
        assert_eq!(res.matched_text.as_deref(), Some("passed"));
    }

    #[test]
    fn normalized_match_spans_original_text() {
        let text = "The moment passed quietly.";
        let locator = SpanLocator::new(text);
        let res = locator.locate("the moment", None);
        assert_eq!(res.method, MatchMethod::Normalized);
        assert_eq!(res.span, Some(Span::new(0, 10)));
        assert_eq!(res.matched_text.as_deref(), Some("The moment"));
    }

    #[test]
    fn normalized_match_ignores_punctuation_and_whitespace_drift() {
        let text = "Oh, silver   moon!\nYou rise again.";
        let locator = SpanLocator::new(text);
        let res = locator.locate("oh silver moon", None);
        let span = res.span.expect("should resolve");
        assert_eq!(span.slice(text), "Oh, silver   moon");
        assert_eq!(res.method, MatchMethod::Normalized);
    }

    #[test]
    fn multiple_matches_prefer_anchor() {
        let text = "the rain\nthe sun\nthe rain";
        let locator = SpanLocator::new(text);
        assert_eq!(locator.locate("the rain", None).span, Some(Span::new(0, 8)));
        assert_eq!(
            locator.locate("the rain", Some(20)).span,
            Some(Span::new(17, 25))
        );
        // Normalized matches use the same locality rule.
        assert_eq!(
            locator.locate("The Rain", Some(20)).span,
            Some(Span::new(17, 25))
        );
    }

    #[test]
    fn unresolved_fragment_has_no_span() {
        let locator = SpanLocator::new("The moment passed quietly.");
        let res = locator.locate("a thundering storm", None);
        assert_eq!(res, SpanResolution::unresolved());
        assert_eq!(locator.locate("!!!", None).method, MatchMethod::Unresolved);
    }

    #[test]
    fn resolution_is_deterministic() {
        let text = "Waves upon waves, the waves keep coming.";
        let locator = SpanLocator::new(text);
        let first = locator.locate("WAVES", Some(18));
        for _ in 0..5 {
            assert_eq!(SpanLocator::new(text).locate("WAVES", Some(18)), first);
        }
    }

    #[test]
    fn offsets_are_counted_in_characters() {
        let text = "Café à la mode, café noir";
        let locator = SpanLocator::new(text);
        let span = locator.locate("café noir", None).span.unwrap();
        assert_eq!(span, Span::new(16, 25));
        assert_eq!(span.slice(text), "café noir");
    }

    #[test]
    fn anchor_points_at_the_mentioned_line() {
        let text = "Quiet zephyrs drift\nBronze lanterns glow\nwaxing";
        let locator = SpanLocator::new(text);
        let anchor = locator.anchor_from_turn("I really like the lanterns and the bronze colour");
        assert_eq!(anchor, Some(20));
    }

    #[test]
    fn span_validation() {
        assert!(Span::new(0, 3).validate(3).is_ok());
        assert!(Span::new(2, 2).validate(3).is_err());
        assert!(Span::new(1, 4).validate(3).is_err());
    }
}
