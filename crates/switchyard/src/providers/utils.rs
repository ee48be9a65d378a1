use reqwest::{Response, StatusCode};
use serde_json::{from_value, Value};

use super::errors::{OpenAIError, ProviderError};

#[derive(serde::Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

/// Map a non-success status of an OpenAI-compatible endpoint to a `ProviderError`,
/// passing successful responses through untouched so they can be streamed.
pub async fn handle_status_openai_compat(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let payload = response.json::<Value>().await.unwrap_or(Value::Null);
    Err(error_for_status(status, payload))
}

/// Parse a non-streaming response body, mapping failures like
/// [`handle_status_openai_compat`].
pub async fn handle_response_openai_compat(response: Response) -> Result<Value, ProviderError> {
    let status = response.status();
    let payload = match response.json::<Value>().await {
        Ok(json) => json,
        Err(e) => return Err(ProviderError::ResponseParseError(e.to_string())),
    };

    if status == StatusCode::OK {
        Ok(payload)
    } else {
        Err(error_for_status(status, payload))
    }
}

fn error_for_status(status: StatusCode, payload: Value) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Authentication(format!(
            "Authentication failed. Status: {}. Response: {}",
            status, payload
        )),
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => {
            tracing::debug!(
                "Provider request failed with status: {}. Payload: {}",
                status,
                payload
            );
            if let Ok(err_resp) = from_value::<OpenAIErrorResponse>(payload) {
                let err = err_resp.error;
                if err.is_context_length_exceeded() {
                    return ProviderError::ContextLengthExceeded(
                        err.message.unwrap_or_else(|| "Unknown error".to_string()),
                    );
                }
                return ProviderError::RequestFailed(format!("{} (status {})", err, status.as_u16()));
            }
            ProviderError::RequestFailed(format!("Unknown error (status {})", status))
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimitExceeded(payload.to_string()),
        s if s.is_server_error() => ProviderError::ServerError(format!("{}: {}", s, payload)),
        _ => {
            tracing::debug!(
                "Provider request failed with status: {}. Payload: {}",
                status,
                payload
            );
            ProviderError::RequestFailed(format!("Request failed with status: {}", status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_for_status() {
        let err = error_for_status(
            StatusCode::BAD_REQUEST,
            json!({"error": {"message": "too long", "code": "context_length_exceeded"}}),
        );
        assert!(matches!(err, ProviderError::ContextLengthExceeded(m) if m == "too long"));

        assert!(matches!(
            error_for_status(StatusCode::BAD_GATEWAY, Value::Null),
            ProviderError::ServerError(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::UNAUTHORIZED, Value::Null),
            ProviderError::Authentication(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::TOO_MANY_REQUESTS, Value::Null),
            ProviderError::RateLimitExceeded(_)
        ));
    }
}
