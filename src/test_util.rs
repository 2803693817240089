//! Shared helpers for unit tests.

/// Build a minimal WordLevel tokenizer JSON over the given word list.
///
/// Ids: `[PAD]` = 0, `[UNK]` = 1, then `words` in order from 2. Lowercase
/// normalization and whitespace pre-tokenization, so encoding is a plain
/// word lookup.
pub fn word_level_tokenizer(words: &[&str]) -> String {
    let mut vocab_entries = vec![
        "\"[PAD]\": 0".to_string(),
        "\"[UNK]\": 1".to_string(),
    ];
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
