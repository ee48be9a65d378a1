//! The Endpoint Protocol: the one contract every backend adapter implements.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::errors::ProviderError;
use super::tool_calls::{ToolCallAccumulator, ToolCallDelta};
use crate::message::{Message, ToolCall};
use crate::model::{GenerateSettings, ModelConfig};
use crate::tools::ToolResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: u32,
    pub text: String,
    pub special: bool,
    pub logprob: f32,
}

impl Token {
    pub fn text<S: Into<String>>(id: u32, text: S) -> Self {
        Token {
            id,
            text: text.into(),
            special: false,
            logprob: 0.0,
        }
    }

    pub fn special<S: Into<String>>(id: u32, text: S) -> Self {
        Token {
            special: true,
            ..Token::text(id, text)
        }
    }
}

/// Backend identity observed while a round is being generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub model: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Token(Token),
    ToolCallDelta(ToolCallDelta),
    Metadata(ProviderMetadata),
    /// Terminates the stream. `token` is the terminating token, when the backend reports one.
    Final {
        token: Option<Token>,
        generated_text: String,
    },
}

impl GenerationEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, GenerationEvent::Final { .. })
    }
}

/// A function definition exposed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointParams {
    pub messages: Vec<Message>,
    pub preprompt: Option<String>,
    pub tools: Vec<ToolDefinition>,
    /// Results of the previous tool round, for adapters that cannot read tool-role messages.
    pub tool_results: Vec<ToolResult>,
    /// Overrides applied on top of the model's defaults.
    pub settings: GenerateSettings,
    pub cancel: CancellationToken,
}

pub type EventStream = BoxStream<'static, Result<GenerationEvent, ProviderError>>;

/// The outcome of a non-streaming completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<PartialToolCall>,
    pub metadata: ProviderMetadata,
}

/// A tool call as assembled from a backend response; the id may be missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialToolCall {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

impl PartialToolCall {
    /// The dispatchable call, once both id and name are known.
    pub fn complete(&self) -> Option<ToolCall> {
        match (&self.id, &self.name) {
            (Some(id), Some(name)) if !id.is_empty() && !name.is_empty() => {
                Some(ToolCall::new(id, name, self.arguments.clone()))
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait Endpoint: Send + Sync {
    fn model(&self) -> &ModelConfig;

    /// Open a round. The returned stream ends after exactly one `Final`, or early
    /// without one when `params.cancel` fires.
    async fn stream(&self, params: EndpointParams) -> Result<EventStream, ProviderError>;

    /// Run a round to completion without streaming.
    async fn complete(&self, params: EndpointParams) -> Result<Completion, ProviderError> {
        let mut stream = terminate_at_final(self.stream(params).await?);
        let mut completion = Completion::default();
        let mut calls = ToolCallAccumulator::default();
        while let Some(event) = stream.next().await {
            match event? {
                GenerationEvent::Token(token) => completion.text.push_str(&token.text),
                GenerationEvent::ToolCallDelta(delta) => calls.add(&delta),
                GenerationEvent::Metadata(metadata) => completion.metadata = metadata,
                GenerationEvent::Final { generated_text, .. } => completion.text = generated_text,
            }
        }
        completion.tool_calls = calls.finish();
        Ok(completion)
    }
}

/// Enforce the stream contract: nothing after the first `Final`, and an error when
/// the backend ends the stream without one.
pub fn terminate_at_final(stream: EventStream) -> EventStream {
    let stream = async_stream::stream! {
        let mut stream = stream;
        let mut finished = false;
        while let Some(event) = stream.next().await {
            let is_final = matches!(&event, Ok(e) if e.is_final());
            let is_err = event.is_err();
            yield event;
            if is_final {
                finished = true;
                break;
            }
            if is_err {
                return;
            }
        }
        if !finished {
            yield Err(ProviderError::ResponseParseError(
                "stream ended without a final event".to_string(),
            ));
        }
    };
    stream.boxed()
}
