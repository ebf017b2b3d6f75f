//! Markup stripping and the minimum-length gate applied to every extracted payload.

use crate::config::Config;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SCRIPT_BLOCK: Regex =
        Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("Invalid script regex");
    static ref STYLE_BLOCK: Regex =
        Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("Invalid style regex");
    static ref COMMENT: Regex = Regex::new(r"(?s)<!--.*?-->").expect("Invalid comment regex");
    static ref TAG: Regex = Regex::new(r"(?s)<[^>]*>").expect("Invalid tag regex");
    static ref ENTITY: Regex = Regex::new(r"&(?:#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z][a-zA-Z0-9]{1,31});")
        .expect("Invalid entity regex");
    static ref INVISIBLE: Regex =
        Regex::new("[\u{200B}-\u{200F}\u{2028}\u{2029}\u{2060}-\u{2064}\u{FEFF}\u{00AD}]")
            .expect("Invalid invisible-char regex");
    static ref WHITESPACE: Regex = Regex::new(r"\s+").expect("Invalid whitespace regex");
}

/// Turns raw markup into plain text and discards near-empty pages.
#[derive(Debug, Clone)]
pub struct ContentCleaner {
    min_chars: usize,
}

impl Default for ContentCleaner {
    fn default() -> Self {
        Self::new(Config::MIN_CONTENT_CHARS)
    }
}

impl ContentCleaner {
    pub fn new(min_chars: usize) -> Self {
        Self { min_chars }
    }

    pub fn min_chars(&self) -> usize {
        self.min_chars
    }

    /// Cleaned text, or `None` when the input is absent or the result is shorter than the gate.
    pub fn clean(&self, raw: Option<&str>) -> Option<String> {
        let text = strip_markup(raw?);
        if text.is_empty() || text.chars().count() < self.min_chars {
            return None;
        }
        Some(text)
    }
}

/// Remove scripts, styles, comments, tags, entities and invisible separators, then collapse
/// whitespace runs into single spaces and trim.
pub fn strip_markup(raw: &str) -> String {
    let text = SCRIPT_BLOCK.replace_all(raw, " ");
    let text = STYLE_BLOCK.replace_all(&text, " ");
    let text = COMMENT.replace_all(&text, " ");
    let text = TAG.replace_all(&text, " ");
    let text = ENTITY.replace_all(&text, " ");
    let text = INVISIBLE.replace_all(&text, "");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_scripts_and_styles_with_contents() {
        let html = r#"<html><head><style>body { color: red; }</style>
            <script type="text/javascript">var x = "<b>";</script></head>
            <body><p>Texto visible</p></body></html>"#;
        assert_eq!(strip_markup(html), "Texto visible");
    }

    #[test]
    fn test_keeps_inner_text_of_tags() {
        assert_eq!(
            strip_markup("<p>Hola <b>mundo</b>, <a href='/x'>link</a></p>"),
            "Hola mundo , link"
        );
    }

    #[test]
    fn test_removes_entities_and_invisible_chars() {
        let text = strip_markup("uno&nbsp;dos &amp; tres&#8203;\u{200B}cuatro\u{FEFF}");
        assert_eq!(text, "uno dos tres cuatro");
    }

    #[test]
    fn test_collapses_whitespace_and_trims() {
        assert_eq!(strip_markup("  a \n\n\t b   c  "), "a b c");
    }

    #[test]
    fn test_comments_are_dropped() {
        assert_eq!(strip_markup("antes<!-- <p>oculto</p> -->después"), "antes después");
    }

    #[test]
    fn test_content_gate_boundary() {
        let cleaner = ContentCleaner::default();
        let short = "a".repeat(49);
        let long = "a".repeat(51);
        let exact = "a".repeat(50);

        assert_eq!(cleaner.clean(Some(&format!("<p>{}</p>", short))), None);
        assert_eq!(cleaner.clean(Some(&format!("<p>{}</p>", long))), Some(long));
        assert_eq!(cleaner.clean(Some(&exact)), Some(exact));
    }

    #[test]
    fn test_gate_counts_characters_not_bytes() {
        let cleaner = ContentCleaner::default();
        // 30 two-byte characters: 60 bytes but under the 50 character gate.
        let accented = "ñ".repeat(30);
        assert_eq!(cleaner.clean(Some(&accented)), None);
    }

    #[test]
    fn test_absent_or_empty_input() {
        let cleaner = ContentCleaner::default();
        assert_eq!(cleaner.clean(None), None);
        assert_eq!(cleaner.clean(Some("<script>only code</script>")), None);
    }
}
