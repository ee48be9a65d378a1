mod agent;
pub mod types;

pub use agent::{Gateway, ROUTER_MODEL_ID};
pub use types::{ReasoningUpdate, ToolUpdate, TurnEvent, TurnRequest, WebSource};
