use super::{Explanation, Step};

const FENCE: &str = "```";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("parse llm steps: empty response from model")]
    EmptyResponse,

    #[error("parse llm steps: {source} (response length {response_len})")]
    MalformedStepData {
        #[source]
        source: serde_json::Error,
        response_len: usize,
    },
}

/// Recovers the step array from a raw model reply.
///
/// The model is asked for a bare JSON array but regularly wraps it in a
/// markdown fence or adds a sentence before/after it, so the text is
/// narrowed to the outermost `[...]` before decoding.
pub fn parse_steps_response(raw: &str) -> Result<Explanation, ParseError> {
    let text = raw.trim();
    log::debug!("llm raw output (len={}): {}", text.len(), text);
    if text.is_empty() {
        return Err(ParseError::EmptyResponse);
    }

    let text = strip_fence(text);
    let text = narrow_to_array(text);

    let steps: Vec<Step> =
        serde_json::from_str(text).map_err(|source| ParseError::MalformedStepData {
            source,
            response_len: text.len(),
        })?;
    Ok(Explanation::new(steps))
}

/// Serializes steps back into the array form `parse_steps_response` accepts.
pub fn render_steps(explanation: &Explanation) -> String {
    serde_json::to_string_pretty(&explanation.steps).unwrap_or_else(|_| "[]".to_string())
}

fn strip_fence(text: &str) -> &str {
    let Some(body) = text.strip_prefix(FENCE) else {
        return text;
    };
    // ```json, ```JSON, ```js ... language tag sits directly after the marker.
    let tag_len = body
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
        .count();
    let body = &body[tag_len..];
    body.strip_suffix(FENCE).unwrap_or(body).trim()
}

fn narrow_to_array(text: &str) -> &str {
    match (text.find('['), text.rfind(']')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text,
    }
}
