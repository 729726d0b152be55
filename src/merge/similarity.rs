//! Text similarity used to spot the same utterance transcribed twice

use std::collections::HashMap;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Score in `[0, 1]`, symmetric in its arguments
pub trait TextSimilarity: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Token overlap ratio after case and diacritic folding
///
/// `|A ∩ B| / max(|A|, |B|)` over token multisets. Two texts without any
/// tokens score 0, so empty segments never collapse into each other.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenOverlap;

impl TextSimilarity for TokenOverlap {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let tokens_a = tokens(a);
        let tokens_b = tokens(b);
        let longest = tokens_a.len().max(tokens_b.len());
        if longest == 0 {
            return 0.0;
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for token in &tokens_a {
            *counts.entry(token.as_str()).or_default() += 1;
        }
        let mut shared = 0;
        for token in &tokens_b {
            if let Some(count) = counts.get_mut(token.as_str()) {
                if *count > 0 {
                    *count -= 1;
                    shared += 1;
                }
            }
        }

        shared as f64 / longest as f64
    }
}

/// Lowercase, strip diacritics and punctuation
pub fn normalize(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            // Stroke letters do not decompose
            'đ' => 'd',
            'ł' => 'l',
            'ø' => 'o',
            c if c.is_alphanumeric() => c,
            _ => ' ',
        })
        .collect()
}

fn tokens(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}
