use serde::{Deserialize, Serialize};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Execution failed: {0}")]
    ExecutionError(String),
    #[error("Tool not found: {0}")]
    NotFound(String),
    #[error("Tool call timed out after {0}s")]
    Timeout(u64),
}

impl ToolError {
    /// Resolution failures are never retried and end the turn with an explanation.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(self, ToolError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_display() {
        assert_eq!(
            ToolError::NotFound("weather".into()).to_string(),
            "Tool not found: weather"
        );
        assert_eq!(
            ToolError::Timeout(30).to_string(),
            "Tool call timed out after 30s"
        );
        assert!(ToolError::NotFound("x".into()).is_resolution_failure());
        assert!(!ToolError::ExecutionError("x".into()).is_resolution_failure());
    }
}
