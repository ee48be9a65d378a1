pub mod base;
pub mod errors;
pub mod factory;
pub mod formats;
pub mod openai;
pub mod openai_stream;
pub mod tool_calls;
pub mod utils;

pub use base::{
    Completion, Endpoint, EndpointParams, EventStream, GenerationEvent, PartialToolCall,
    ProviderMetadata, Token, ToolDefinition,
};
pub use errors::ProviderError;
pub use factory::{create, EndpointConfig, ModelRegistry, OpenAiEndpointConfig};
