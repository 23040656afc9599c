//! Language-model reply parsing.

use std::sync::LazyLock;

use regex::Regex;

use crate::schema::ReplyFormat;

static RATIONALE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<<(.*?)>>").expect("rationale pattern is valid"));

static MARKDOWN_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_+#.-]*[ \t]*\n?(.*?)\s*```\s*$")
        .expect("fence pattern is valid")
});

/// Rationale and source extracted from one reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    /// Text of the first `<< >>` region.
    pub rationale: String,
    /// Text of the first source block.
    pub source: String,
}

/// Extracts rationale and source regions from replies.
#[derive(Debug, Clone)]
pub struct ReplyParser {
    source_block: Regex,
    strip_fences: bool,
}

impl ReplyParser {
    /// Build a parser for the given delimiters.
    pub fn new(format: &ReplyFormat) -> Result<Self, regex::Error> {
        let tag = regex::escape(&format.code_tag);
        let source_block = Regex::new(&format!(
            r"(?si)\[\[\s*{tag}_START\s*(.*?)\s*{tag}_END\s*\]\]"
        ))?;
        Ok(Self {
            source_block,
            strip_fences: format.strip_markdown_fences,
        })
    }

    /// Trimmed rationale, if present and non-empty.
    pub fn rationale(&self, reply: &str) -> Option<String> {
        let text = RATIONALE.captures(reply)?.get(1)?.as_str().trim();
        (!text.is_empty()).then(|| text.to_string())
    }

    /// Trimmed source block, if present and non-empty.
    pub fn source(&self, reply: &str) -> Option<String> {
        let mut text = self.source_block.captures(reply)?.get(1)?.as_str().trim();
        if self.strip_fences
            && let Some(inner) = MARKDOWN_FENCE.captures(text).and_then(|c| c.get(1))
        {
            text = inner.as_str().trim();
        }
        (!text.is_empty()).then(|| text.to_string())
    }

    /// Both regions, or `None` if either is missing.
    pub fn parse(&self, reply: &str) -> Option<ParsedReply> {
        Some(ParsedReply {
            rationale: self.rationale(reply)?,
            source: self.source(reply)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ReplyParser {
        ReplyParser::new(&ReplyFormat::default()).unwrap()
    }

    #[test]
    fn test_parse_well_formed() {
        let reply = "Sure.\n<< Remove the longest routes first. >>\n[[CODE_START\nclass Ruin {}\nCODE_END]]\nDone.";
        let parsed = parser().parse(reply).unwrap();
        assert_eq!(parsed.rationale, "Remove the longest routes first.");
        assert_eq!(parsed.source, "class Ruin {}");
    }

    #[test]
    fn test_markers_are_case_insensitive() {
        let reply = "<<idea>> [[ code_start x = 1 code_end ]]";
        assert_eq!(parser().source(reply).as_deref(), Some("x = 1"));
    }

    #[test]
    fn test_first_match_wins() {
        let reply = "<<first>> <<second>> [[CODE_START a CODE_END]] [[CODE_START b CODE_END]]";
        let parsed = parser().parse(reply).unwrap();
        assert_eq!(parsed.rationale, "first");
        assert_eq!(parsed.source, "a");
    }

    #[test]
    fn test_missing_region_fails() {
        assert!(parser().parse("[[CODE_START a CODE_END]]").is_none());
        assert!(parser().parse("<<idea>> ```java\nclass A {}\n```").is_none());
        assert!(parser().parse("<<idea>> [[CODE_START CODE_END]]").is_none());
    }

    #[test]
    fn test_inner_fence_stripped() {
        let reply = "<<idea>>\n[[CODE_START\n```java\nclass A {}\n```\nCODE_END]]";
        assert_eq!(parser().source(reply).as_deref(), Some("class A {}"));

        let keep = ReplyParser::new(&ReplyFormat {
            strip_markdown_fences: false,
            ..Default::default()
        })
        .unwrap();
        assert!(keep.source(reply).unwrap().starts_with("```java"));
    }

    #[test]
    fn test_custom_tag() {
        let parser = ReplyParser::new(&ReplyFormat {
            code_tag: "JAVA_CODE".into(),
            ..Default::default()
        })
        .unwrap();
        let reply = "<<idea>>[[JAVA_CODE_START\nclass A {}\nJAVA_CODE_END]]";
        assert_eq!(parser.source(reply).as_deref(), Some("class A {}"));
    }
}
