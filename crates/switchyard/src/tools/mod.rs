pub mod engine;
pub mod hydrate;
pub mod names;
pub mod registry;

use rmcp::model::{CallToolResult, Content};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agents::types::WebSource;

pub use engine::{ErrorPolicy, ToolEngine, ToolRound, ToolRoundItem};
pub use registry::{build_catalog, ToolCatalog, ToolListCache, ToolMapping};

/// Joins the text blocks of a tool result, one per line.
pub fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|content| content.as_text())
        .map(|text| text.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// The successful outcome of one dispatched tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub text: String,
    /// The result text when it is a JSON object. Servers mirror structured
    /// content into a text block for clients on older protocol revisions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_blocks: Vec<Content>,
}

impl ToolResult {
    pub fn from_call<S: Into<String>>(call_id: S, result: CallToolResult) -> Self {
        let text = result_text(&result);
        let structured = serde_json::from_str::<Value>(text.trim())
            .ok()
            .filter(Value::is_object);
        ToolResult {
            call_id: call_id.into(),
            text,
            structured,
            content_blocks: result.content,
        }
    }

    /// Links listed under `sources` in the structured result.
    pub fn web_sources(&self) -> Vec<WebSource> {
        let Some(sources) = self
            .structured
            .as_ref()
            .and_then(|s| s.get("sources"))
            .and_then(Value::as_array)
        else {
            return Vec::new();
        };

        sources
            .iter()
            .filter_map(|source| {
                let link = source
                    .get("link")
                    .or_else(|| source.get("url"))
                    .and_then(Value::as_str)?;
                Some(WebSource {
                    link: link.to_string(),
                    title: source
                        .get("title")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
            })
            .collect()
    }
}
