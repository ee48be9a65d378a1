//! Conversation messages as they flow through a turn.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A file uploaded into the conversation. `data` is the base64 payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub mime: String,
    pub data: String,
}

impl FileRef {
    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.data)
    }
}

/// A tool call requested by the model, with arguments exactly as streamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(rename = "arguments")]
    pub raw_arguments: String,
}

impl ToolCall {
    pub fn new<I, N, A>(id: I, name: N, raw_arguments: A) -> Self
    where
        I: Into<String>,
        N: Into<String>,
        A: Into<String>,
    {
        ToolCall {
            id: id.into(),
            name: name.into(),
            raw_arguments: raw_arguments.into(),
        }
    }

    /// Parsed arguments. Malformed or non-object arguments become `{}`.
    pub fn arguments(&self) -> serde_json::Value {
        match serde_json::from_str::<serde_json::Value>(&self.raw_arguments) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            _ => {
                if !self.raw_arguments.trim().is_empty() {
                    tracing::debug!(tool = %self.name, "malformed tool arguments, using {{}}");
                }
                serde_json::json!({})
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    fn new<S: Into<String>>(role: Role, content: S) -> Self {
        Message {
            role,
            content: content.into(),
            files: Vec::new(),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn system<S: Into<String>>(content: S) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user<S: Into<String>>(content: S) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// The result of one tool call, answering `call_id`.
    pub fn tool<I: Into<String>, S: Into<String>>(call_id: I, content: S) -> Self {
        let mut message = Self::new(Role::Tool, content);
        message.tool_call_id = Some(call_id.into());
        message
    }

    pub fn with_files(mut self, files: Vec<FileRef>) -> Self {
        self.files = files;
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn has_images(&self) -> bool {
        self.files.iter().any(FileRef::is_image)
    }
}

/// Every file in the conversation, oldest first.
pub fn conversation_files(messages: &[Message]) -> Vec<&FileRef> {
    messages.iter().flat_map(|m| m.files.iter()).collect()
}
