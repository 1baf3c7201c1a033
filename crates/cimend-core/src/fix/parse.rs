//! Parse semi-structured provider text into a [`ProviderReply`].
//!
//! Accepted shapes, tried in order:
//! 1. the whole text is a JSON object
//! 2. a fenced code block (```` ```json ```` or bare ```` ``` ````) holds the object
//! 3. the span from the first `{` to the last `}` is the object

use crate::provider::ProviderReply;

use super::error::FixError;

fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open + 3..];
        // Skip the info string (e.g. `json`) up to the end of the line.
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }
    blocks
}

fn try_parse(candidate: &str) -> Option<ProviderReply> {
    serde_json::from_str::<ProviderReply>(candidate.trim()).ok()
}

/// Parse a provider's free-text answer.
pub fn parse_reply_text(text: &str) -> Result<ProviderReply, FixError> {
    if let Some(reply) = try_parse(text) {
        return Ok(reply);
    }
    if let Some(reply) = fenced_blocks(text).into_iter().find_map(try_parse) {
        return Ok(reply);
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Some(reply) = try_parse(&text[start..=end]) {
                return Ok(reply);
            }
        }
    }
    Err(FixError::UnparsablePatch(format!(
        "no JSON reply object found in {} bytes of provider output",
        text.len()
    )))
}
