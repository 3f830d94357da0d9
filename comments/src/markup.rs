//! Validation of the small inline markup allowed in comment bodies.
//!
//! Only tags matching [`TAG_PATTERN`] are inspected, everything else is free
//! text. A tag written as `<i />` matches the pattern with ` /` as its
//! attributes, so it counts as an ordinary opening tag and has to be closed
//! explicitly. `<i/>` doesn't match the pattern at all and is left alone as
//! text.

use std::sync::LazyLock;

use regex::Regex;

pub const ALLOWED_TAGS: [&str; 4] = ["a", "code", "i", "strong"];

const TAG_PATTERN: &str = r"</?([a-zA-Z0-9]+)(\s[^>]*)?>";

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(TAG_PATTERN).expect("tag pattern is valid"));

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MarkupError {
    #[error("invalid tag: <{0}>")]
    InvalidTag(String),

    #[error("incorrect closing tag: <{0}>")]
    IncorrectClosingTag(String),

    /// Tags left open at the end of the text, in the order they were opened
    #[error("unclosed tags: {}", .0.join(", "))]
    UnclosedTags(Vec<String>),
}

/// Checks that every tag in `text` is allowed and properly nested.
pub fn validate(text: &str) -> Result<(), MarkupError> {
    let mut open_tags: Vec<String> = Vec::new();

    for tag in TAG_REGEX.captures_iter(text) {
        let name = tag[1].to_ascii_lowercase();
        if !ALLOWED_TAGS.contains(&name.as_str()) {
            return Err(MarkupError::InvalidTag(name));
        }

        if tag[0].starts_with("</") {
            if open_tags.last() != Some(&name) {
                return Err(MarkupError::IncorrectClosingTag(name));
            }
            open_tags.pop();
        } else {
            open_tags.push(name);
        }
    }

    if !open_tags.is_empty() {
        return Err(MarkupError::UnclosedTags(open_tags));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_accepts_allowed_nested_tags() {
        assert_eq!(validate("<strong>hi</strong>"), Ok(()));
        assert_eq!(
            validate(r#"see <a href="https://example.com" title="x">this <i>one</i></a>"#),
            Ok(())
        );
        assert_eq!(validate("<CODE>let x = 1;</Code>"), Ok(()), "Tag names are case-insensitive");
        assert_eq!(validate("plain text, 1 < 2 and 3 > 2"), Ok(()));
    }

    #[test]
    fn test_rejects_tags_outside_the_allow_list() {
        assert_eq!(
            validate("<b>hi</b>"),
            Err(MarkupError::InvalidTag("b".into()))
        );
        assert_eq!(
            validate("<strong>x</strong><script>alert(1)</script>"),
            Err(MarkupError::InvalidTag("script".into()))
        );
    }

    #[test]
    fn test_rejects_mismatched_closing_tag() {
        let err = validate("<a>x</i>").unwrap_err();
        assert_eq!(err, MarkupError::IncorrectClosingTag("i".into()));
        assert_eq!(err.to_string(), "incorrect closing tag: <i>");

        assert_eq!(
            validate("x</code>"),
            Err(MarkupError::IncorrectClosingTag("code".into())),
            "Closing with nothing open is the same failure"
        );
    }

    #[test]
    fn test_reports_unclosed_tags_in_opening_order() {
        assert_eq!(
            validate("<code>abc"),
            Err(MarkupError::UnclosedTags(vec!["code".into()]))
        );

        let err = validate("<strong><i>abc").unwrap_err();
        assert_eq!(err.to_string(), "unclosed tags: strong, i");
    }

    #[test]
    fn test_self_closing_syntax_is_not_special() {
        assert_eq!(
            validate("<i />"),
            Err(MarkupError::UnclosedTags(vec!["i".into()])),
            "A spaced self-closing tag counts as an opening tag"
        );
        assert_eq!(validate("<i/>"), Ok(()), "Unspaced form does not match the tag pattern");
    }
}
