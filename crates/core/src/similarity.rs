//! Text similarity and comparison scoring.
//!
//! Engines transcribing the same audio should mostly agree; an engine whose
//! text is close to every other engine's text, and which is confident about
//! it, is the best recommendation. The exact weighting is a policy knob
//! ([`ScoringPolicy`]), not a fixed formula.

use serde::{Deserialize, Serialize};

/// Confidence assumed for an engine that did not report one.
pub const MISSING_CONFIDENCE: f64 = 0.5;

/// Weights used to combine agreement and self-reported confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringPolicy {
    pub agreement_weight: f64,
    pub confidence_weight: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            agreement_weight: 0.5,
            confidence_weight: 0.5,
        }
    }
}

/// Levenshtein edit distance over Unicode scalar values.
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// `1 - edit_distance / max_len`, in `0.0..=1.0`. Two empty strings are
/// identical.
pub fn normalized_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f64 / max_len as f64
}

/// One engine's output as seen by the scorer.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInput<'a> {
    pub text: &'a str,
    pub confidence: Option<f64>,
}

/// Result of scoring a set of engine outputs. Indices refer to the input
/// slice.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCard {
    /// `(i, j, similarity)` for every pair `i < j`.
    pub pairwise: Vec<(usize, usize, f64)>,
    pub scores: Vec<f64>,
    /// Index with the highest score; the earliest index wins ties.
    pub best: Option<usize>,
}

/// Score every input against the others.
///
/// Agreement is the mean similarity to the other inputs (1.0 when there is
/// nothing to compare against).
pub fn score(inputs: &[ScoreInput<'_>], policy: &ScoringPolicy) -> ScoreCard {
    let n = inputs.len();
    let mut pairwise = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    let mut agreement_sums = vec![0.0; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let sim = normalized_similarity(inputs[i].text, inputs[j].text);
            pairwise.push((i, j, sim));
            agreement_sums[i] += sim;
            agreement_sums[j] += sim;
        }
    }

    let scores: Vec<f64> = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let agreement = if n > 1 {
                agreement_sums[i] / (n - 1) as f64
            } else {
                1.0
            };
            let confidence = input
                .confidence
                .unwrap_or(MISSING_CONFIDENCE)
                .clamp(0.0, 1.0);
            policy.agreement_weight * agreement + policy.confidence_weight * confidence
        })
        .collect();

    let mut best: Option<usize> = None;
    for (i, s) in scores.iter().enumerate() {
        match best {
            Some(b) if scores[b] >= *s => {}
            _ => best = Some(i),
        }
    }

    ScoreCard {
        pairwise,
        scores,
        best,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(text: &str, confidence: Option<f64>) -> ScoreInput<'_> {
        ScoreInput { text, confidence }
    }

    #[test]
    fn distance_basics() {
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("same", "same"), 0);
    }

    #[test]
    fn distance_counts_chars_not_bytes() {
        assert_eq!(edit_distance("你好世界", "你好时间"), 2);
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(normalized_similarity("", ""), 1.0);
        assert_eq!(normalized_similarity("abc", "abc"), 1.0);
        assert_eq!(normalized_similarity("abc", "xyz"), 0.0);
    }

    #[test]
    fn majority_text_is_recommended() {
        let inputs = [
            input("the quick brown fox", Some(0.8)),
            input("the quick brown fox", Some(0.8)),
            input("a slow red dog", Some(0.8)),
        ];
        let card = score(&inputs, &ScoringPolicy::default());
        assert_eq!(card.pairwise.len(), 3);
        assert_eq!(card.best, Some(0));
        assert!(card.scores[2] < card.scores[0]);
    }

    #[test]
    fn confidence_breaks_agreement_tie() {
        let inputs = [input("hello world", Some(0.4)), input("hello world", Some(0.9))];
        let card = score(&inputs, &ScoringPolicy::default());
        assert_eq!(card.best, Some(1));
    }

    #[test]
    fn equal_scores_prefer_first() {
        let inputs = [input("a", None), input("a", None)];
        let card = score(&inputs, &ScoringPolicy::default());
        assert_eq!(card.best, Some(0));
    }

    #[test]
    fn single_input_scores_full_agreement() {
        let card = score(&[input("only", Some(1.0))], &ScoringPolicy::default());
        assert!((card.scores[0] - 1.0).abs() < f64::EPSILON);
        assert!(card.pairwise.is_empty());
    }

    #[test]
    fn empty_input_has_no_best() {
        let card = score(&[], &ScoringPolicy::default());
        assert_eq!(card.best, None);
    }
}
