use serde::{Deserialize, Serialize};

pub const DEFAULT_BEGIN: &str = "<think>";
pub const DEFAULT_END: &str = "</think>";

/// How a model marks the part of its output that is deliberation rather than answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReasoningConfig {
    /// Reasoning sits between two marker strings. An empty `begin` means the model
    /// starts in reasoning mode.
    Tokens { begin: String, end: String },
    /// The whole output is reasoning; the answer is extracted with a pattern. The
    /// first capture group is used when the pattern has one.
    Regex {
        #[serde(alias = "regex")]
        pattern: String,
    },
    /// The whole output is reasoning; the answer is a summary of it.
    Summarize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        ReasoningConfig::Tokens {
            begin: DEFAULT_BEGIN.to_string(),
            end: DEFAULT_END.to_string(),
        }
    }
}

impl ReasoningConfig {
    /// Markers used when a backend reports reasoning on a separate channel.
    pub fn markers(&self) -> (&str, &str) {
        match self {
            ReasoningConfig::Tokens { begin, end } if !begin.is_empty() => {
                (begin.as_str(), end.as_str())
            }
            _ => (DEFAULT_BEGIN, DEFAULT_END),
        }
    }

    pub fn starts_in_reasoning(&self) -> bool {
        match self {
            ReasoningConfig::Tokens { begin, .. } => begin.is_empty(),
            ReasoningConfig::Regex { .. } | ReasoningConfig::Summarize => true,
        }
    }
}

/// Remove the reasoning span from raw output. Without an end marker after the
/// begin marker, everything from the begin marker on is dropped.
pub fn strip_token_span(text: &str, begin: &str, end: &str) -> String {
    if begin.is_empty() {
        return match text.find(end).filter(|_| !end.is_empty()) {
            Some(idx) => text[idx + end.len()..].to_string(),
            None => text.to_string(),
        };
    }

    let Some(start) = text.find(begin) else {
        return text.to_string();
    };
    let after_begin = start + begin.len();
    let stop = if end.is_empty() {
        None
    } else {
        text[after_begin..].find(end).map(|i| after_begin + i + end.len())
    };

    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..start]);
    if let Some(stop) = stop {
        out.push_str(&text[stop..]);
    }
    out
}

/// Extract the answer from `reasoning`, or `None` when the pattern is invalid or
/// does not match.
pub fn extract_with_pattern(pattern: &str, reasoning: &str) -> Option<String> {
    let re = match regex::Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            tracing::warn!(%pattern, "invalid reasoning pattern: {}", e);
            return None;
        }
    };
    let captures = re.captures(reasoning)?;
    captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().trim().to_string())
}
