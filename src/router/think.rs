use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref THINK_BLOCK: Regex = Regex::new(r"(?s)<think>.*?</think>").unwrap();
}

/// Removes every `<think>...</think>` block, which may span several lines,
/// and trims the remaining text.
pub(crate) fn strip_think_blocks(text: &str) -> String {
    THINK_BLOCK.replace_all(text, "").trim().to_string()
}
