//! Splits a reasoning preamble out of streamed text.
//!
//! Providers delimit the preamble with `<think>`/`</think>`, either
//! literal or with the angle brackets Unicode-escaped as emitted by JSON
//! encoders that escape `<`. Only the first block in a connection's
//! lifetime is treated as reasoning; later blocks, well-formed or not,
//! pass through as visible text.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";
const OPEN_TAG_ESCAPED: &str = "\\u003cthink\\u003e";
const CLOSE_TAG_ESCAPED: &str = "\\u003c/think\\u003e";

/// Result of running one text fragment through the extractor. Returned
/// only when the fragment was actually rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub visible: String,
    pub reasoning: Option<String>,
}

#[derive(Debug, Default)]
pub struct ThinkingState {
    in_block: bool,
    consumed: bool,
}

impl ThinkingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one fragment, which may arrive before, after, inside or
    /// straddling a tag boundary. `None` means the fragment passes
    /// through unmodified.
    pub fn extract(&mut self, text: &str) -> Option<Extraction> {
        if self.consumed {
            return None;
        }

        if self.in_block {
            return Some(match find_tag(text, CLOSE_TAG, CLOSE_TAG_ESCAPED) {
                Some((at, len)) => {
                    self.in_block = false;
                    self.consumed = true;
                    Extraction {
                        visible: text[at + len..].to_string(),
                        reasoning: Some(text[..at].to_string()),
                    }
                }
                None => Extraction {
                    visible: String::new(),
                    reasoning: Some(text.to_string()),
                },
            });
        }

        let (open_at, open_len) = find_tag(text, OPEN_TAG, OPEN_TAG_ESCAPED)?;
        let before = &text[..open_at];
        let rest = &text[open_at + open_len..];

        Some(match find_tag(rest, CLOSE_TAG, CLOSE_TAG_ESCAPED) {
            Some((close_at, close_len)) => {
                self.consumed = true;
                Extraction {
                    visible: format!("{}{}", before, &rest[close_at + close_len..]),
                    reasoning: Some(rest[..close_at].to_string()),
                }
            }
            None => {
                self.in_block = true;
                Extraction {
                    visible: before.to_string(),
                    reasoning: Some(rest.to_string()),
                }
            }
        })
    }
}

/// Earliest occurrence of either tag form wins; the byte length of the
/// matched form is what gets skipped when slicing.
fn find_tag(text: &str, literal: &str, escaped: &str) -> Option<(usize, usize)> {
    match (text.find(literal), text.find(escaped)) {
        (Some(a), Some(b)) if b < a => Some((b, escaped.len())),
        (Some(a), _) => Some((a, literal.len())),
        (None, Some(b)) => Some((b, escaped.len())),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_text_passes_through() {
        let mut state = ThinkingState::new();
        assert_eq!(state.extract("plain answer text"), None);
        assert_eq!(state.extract(""), None);
    }

    #[test]
    fn complete_block_in_one_fragment() {
        let mut state = ThinkingState::new();
        let out = state.extract("Hello <think>plan</think> world").unwrap();
        assert_eq!(out.visible, "Hello  world");
        assert_eq!(out.reasoning.as_deref(), Some("plan"));
    }

    #[test]
    fn only_first_block_is_honored() {
        let mut state = ThinkingState::new();
        let out = state
            .extract("Hello <think>first</think> mid <think>second</think> end")
            .unwrap();
        assert_eq!(out.reasoning.as_deref(), Some("first"));
        assert_eq!(out.visible, "Hello  mid <think>second</think> end");
        // Later fragments are never rewritten again.
        assert_eq!(state.extract("<think>third</think>"), None);
    }

    #[test]
    fn block_split_across_fragments() {
        let mut state = ThinkingState::new();
        let first = state.extract("Hello <think>partial").unwrap();
        assert_eq!(first.visible, "Hello ");
        assert_eq!(first.reasoning.as_deref(), Some("partial"));

        let second = state.extract(" more</think> tail").unwrap();
        assert_eq!(second.visible, " tail");
        assert_eq!(second.reasoning.as_deref(), Some(" more"));

        assert_eq!(state.extract("after"), None);
    }

    #[test]
    fn fragment_entirely_inside_block() {
        let mut state = ThinkingState::new();
        state.extract("<think>one").unwrap();
        let mid = state.extract("two").unwrap();
        assert_eq!(mid.visible, "");
        assert_eq!(mid.reasoning.as_deref(), Some("two"));
        let end = state.extract("three</think>done").unwrap();
        assert_eq!(end.visible, "done");
        assert_eq!(end.reasoning.as_deref(), Some("three"));
    }

    #[test]
    fn escaped_tags_are_recognized() {
        let mut state = ThinkingState::new();
        let out = state
            .extract("a\\u003cthink\\u003eplan\\u003c/think\\u003eb")
            .unwrap();
        assert_eq!(out.visible, "ab");
        assert_eq!(out.reasoning.as_deref(), Some("plan"));
    }

    #[test]
    fn earliest_tag_form_wins() {
        let mut state = ThinkingState::new();
        let out = state
            .extract("\\u003cthink\\u003eone<think>two</think>")
            .unwrap();
        // The escaped opening occurs first; the literal `<think>` after it
        // is just reasoning text, and the literal close ends the block.
        assert_eq!(out.reasoning.as_deref(), Some("one<think>two"));
        assert_eq!(out.visible, "");
    }

    #[test]
    fn second_open_tag_does_not_nest() {
        let mut state = ThinkingState::new();
        state.extract("<think>outer <think>inner").unwrap();
        let out = state.extract("</think> tail").unwrap();
        // The first close ends the block regardless of the inner open.
        assert_eq!(out.visible, " tail");
        assert_eq!(out.reasoning.as_deref(), Some(""));
    }
}
