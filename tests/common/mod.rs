//! Shared fixtures for integration tests.

use std::path::Path;

/// Build a minimal WordLevel tokenizer JSON over the given word list.
/// Ids: `[PAD]` = 0, `[UNK]` = 1, then `words` in order from 2.
pub fn word_level_tokenizer(words: &[&str]) -> String {
    let mut vocab_entries = vec!["\"[PAD]\": 0".to_string(), "\"[UNK]\": 1".to_string()];
    for (i, word) in words.iter().enumerate() {
        vocab_entries.push(format!("\"{}\": {}", word, i + 2));
    }
    format!(
        r#"{{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": {{"type": "Lowercase"}},
  "pre_tokenizer": {{"type": "Whitespace"}},
  "post_processor": null,
  "decoder": null,
  "model": {{
    "type": "WordLevel",
    "vocab": {{{}}},
    "unk_token": "[UNK]"
  }}
}}"#,
        vocab_entries.join(", ")
    )
}

/// Write a tokenizer file covering a small math-flavored word list.
pub fn write_tokenizer(path: &Path) {
    std::fs::write(
        path,
        word_level_tokenizer(&[
            "find", "all", "functions", "f", "such", "that", "prove", "for", "positive",
            "reals", "integers", "show", "problem",
        ]),
    )
    .unwrap();
}

/// Write a JSON example store with `n` records cycling through a few
/// tactics.
pub fn write_store(path: &Path, n: usize) {
    let tactics = ["x = 0", "y = 0", "Apply AM-GM", "Check small cases"];
    let records: Vec<String> = (0..n)
        .map(|i| {
            format!(
                r#"{{"statement": "problem {i} find all functions such that", "substitutions": ["{}"]}}"#,
                tactics[i % tactics.len()]
            )
        })
        .collect();
    std::fs::write(path, format!("[{}]", records.join(","))).unwrap();
}
