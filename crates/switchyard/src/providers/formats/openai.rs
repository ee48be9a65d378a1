//! Request and response shapes of OpenAI-compatible chat-completion APIs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::message::{Message, Role};
use crate::model::ModelConfig;
use crate::providers::base::{Completion, EndpointParams, PartialToolCall, ProviderMetadata};
use crate::providers::errors::ProviderError;
use crate::providers::tool_calls::ToolCallDelta;

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct OAIToolCallFunction {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_to_empty_string")]
    pub arguments: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct OAIToolCall {
    #[serde(default)]
    pub function: OAIToolCallFunction,
    pub id: Option<String>,
    #[serde(default)]
    pub index: usize,
    #[serde(rename = "type")]
    pub type_: Option<String>,
}

impl OAIToolCall {
    pub fn to_delta(&self) -> ToolCallDelta {
        ToolCallDelta {
            index: self.index,
            id: self.id.clone(),
            name: self.function.name.clone(),
            arguments: Some(self.function.arguments.clone()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct OAIStreamDelta {
    pub role: Option<String>,
    pub content: Option<String>,
    /// Some servers name this `reasoning`, others `reasoning_content`
    #[serde(alias = "reasoning")]
    pub reasoning_content: Option<String>,
    #[serde(default, deserialize_with = "null_to_empty_vec")]
    pub tool_calls: Vec<OAIToolCall>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAIStreamChoice {
    #[serde(default)]
    pub delta: OAIStreamDelta,
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAIStreamChunk {
    pub id: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<OAIStreamChoice>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAIChatMessage {
    pub role: Option<String>,
    pub content: Option<String>,
    #[serde(alias = "reasoning")]
    pub reasoning_content: Option<String>,
    #[serde(default, deserialize_with = "null_to_empty_vec")]
    pub tool_calls: Vec<OAIToolCall>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAIChatChoice {
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: usize,
    pub message: OAIChatMessage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OAIChatResponse {
    pub id: Option<String>,
    pub model: Option<String>,
    pub choices: Vec<OAIChatChoice>,
}

fn null_to_empty_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_to_empty_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

fn format_message(message: &Message, multimodal: bool) -> Value {
    match message.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
            "content": message.content,
        }),
        Role::Assistant if !message.tool_calls.is_empty() => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.raw_arguments},
                    })
                })
                .collect();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            json!({"role": "assistant", "content": content, "tool_calls": calls})
        }
        Role::User if multimodal && message.has_images() => {
            let mut parts = vec![json!({"type": "text", "text": message.content})];
            parts.extend(message.files.iter().filter(|f| f.is_image()).map(|f| {
                json!({"type": "image_url", "image_url": {"url": f.data_url()}})
            }));
            json!({"role": "user", "content": parts})
        }
        role => json!({
            "role": role,
            "content": message.content,
        }),
    }
}

/// Build a `/chat/completions` payload for one round.
pub fn create_request(model: &ModelConfig, params: &EndpointParams, stream: bool) -> Value {
    let mut messages = Vec::with_capacity(params.messages.len() + 1);
    if let Some(preprompt) = params
        .preprompt
        .as_ref()
        .or(model.preprompt.as_ref())
        .filter(|p| !p.trim().is_empty())
    {
        messages.push(json!({"role": "system", "content": preprompt}));
    }
    messages.extend(
        params
            .messages
            .iter()
            .map(|m| format_message(m, model.multimodal)),
    );

    let mut payload = json!({
        "model": model.backend_name(),
        "messages": messages,
        "stream": stream,
    });

    if !params.tools.is_empty() {
        let tools: Vec<Value> = params
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        payload["tools"] = json!(tools);
        payload["tool_choice"] = json!("auto");
    }

    let settings = model.settings(&params.settings);
    if let Some(temperature) = settings.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(top_p) = settings.top_p {
        payload["top_p"] = json!(top_p);
    }
    if let Some(max_tokens) = settings.max_new_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(penalty) = settings.frequency_penalty {
        payload["frequency_penalty"] = json!(penalty);
    }
    if !settings.stop_sequences().is_empty() {
        payload["stop"] = json!(settings.stop_sequences());
    }

    payload
}

/// Convert a non-streaming response into a `Completion`.
pub fn response_to_completion(response: Value) -> Result<Completion, ProviderError> {
    let response: OAIChatResponse = serde_json::from_value(response)
        .map_err(|e| ProviderError::ResponseParseError(e.to_string()))?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::ResponseParseError("response has no choices".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .iter()
        .enumerate()
        .map(|(position, call)| PartialToolCall {
            // Non-streamed responses often omit the index
            index: if call.index == 0 { position } else { call.index },
            id: call.id.clone().filter(|id| !id.is_empty()),
            name: call.function.name.clone(),
            arguments: call.function.arguments.clone(),
        })
        .collect();

    Ok(Completion {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        metadata: ProviderMetadata {
            model: response.model,
            provider: None,
        },
    })
}
