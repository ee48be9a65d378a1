use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::message::Message;
use crate::model::GenerateSettings;

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// A link surfaced by a search-like tool, shown next to the final answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebSource {
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subtype", rename_all = "camelCase")]
pub enum ReasoningUpdate {
    Stream { token: String },
    Status { status: String },
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "subtype", rename_all = "camelCase")]
pub enum ToolUpdate {
    Call {
        id: String,
        name: String,
        arguments: Value,
    },
    Eta {
        id: String,
        eta_secs: u64,
    },
    Result {
        id: String,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        structured: Option<Value>,
    },
    Error {
        id: String,
        message: String,
    },
}

/// What a turn reports to its caller, in order of occurrence.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TurnEvent {
    RouterMetadata {
        route: String,
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
    },
    Stream {
        token: String,
    },
    Reasoning(ReasoningUpdate),
    Status {
        message: String,
    },
    Tool(ToolUpdate),
    FinalAnswer {
        text: String,
        interrupted: bool,
        web_sources: Vec<WebSource>,
    },
}

impl TurnEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, TurnEvent::FinalAnswer { .. })
    }

    pub fn final_answer<S: Into<String>>(text: S) -> Self {
        TurnEvent::FinalAnswer {
            text: text.into(),
            interrupted: false,
            web_sources: Vec::new(),
        }
    }
}

/// One conversational turn as submitted by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default)]
    pub conversation_id: String,
    pub messages: Vec<Message>,
    /// A configured model id. Unset, or the router's own id, means route the turn.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub preprompt: Option<String>,
    #[serde(default)]
    pub settings: GenerateSettings,
    #[serde(default = "default_tools_enabled")]
    pub tools_enabled: bool,
}

fn default_tools_enabled() -> bool {
    true
}

impl TurnRequest {
    /// A routed turn with tools enabled and a fresh conversation id.
    pub fn new(messages: Vec<Message>) -> Self {
        TurnRequest {
            conversation_id: Uuid::new_v4().to_string(),
            messages,
            tools_enabled: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_turn_event_wire_shape() {
        let event = TurnEvent::Tool(ToolUpdate::Eta {
            id: "call_1".into(),
            eta_secs: 10,
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "tool", "subtype": "eta", "id": "call_1", "eta_secs": 10})
        );
        assert_eq!(
            serde_json::to_value(TurnEvent::Reasoning(ReasoningUpdate::Done)).unwrap(),
            json!({"type": "reasoning", "subtype": "done"})
        );
    }

    #[test]
    fn test_turn_request_defaults() {
        let request: TurnRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert!(request.tools_enabled);
        assert!(request.model.is_none());
    }
}
