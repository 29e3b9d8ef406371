use regex::Regex;
use std::sync::OnceLock;

/// Version tag recorded in run metadata; bump whenever tokenization changes.
pub const TOKENIZER_VERSION: &str = "bm25-tokenizer-v1";

fn word_regex() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"\w+").expect("valid word regex"))
}

/// Lowercase `text` and split it into maximal runs of Unicode word characters.
///
/// Punctuation and whitespace only separate tokens. No stop words are dropped
/// and nothing is stemmed.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    word_regex()
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .collect()
}
