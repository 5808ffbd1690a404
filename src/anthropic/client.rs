use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::error::AnthropicError;
use super::types::{MessagesRequest, MessagesResponse};

const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anything that can answer a Messages API request. Lets agents run against
/// the real client or a test double.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(&self, req: &MessagesRequest)
    -> Result<MessagesResponse, AnthropicError>;
}

pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, request_timeout: Duration) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, API_URL.to_string(), request_timeout)
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(
        api_key: String,
        base_url: String,
        request_timeout: Duration,
    ) -> Result<Self, AnthropicError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url,
        })
    }
}

#[async_trait]
impl MessageSender for AnthropicClient {
    async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        debug!(model = %req.model, "sending messages request");
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(AnthropicError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AnthropicError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<MessagesResponse>().await?;
        if body.text().trim().is_empty() {
            return Err(AnthropicError::EmptyResponse);
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::MessagesRequest;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> MessagesRequest {
        MessagesRequest::single("claude-test", 64, "system", "hello".into())
    }

    async fn client_for(server: &MockServer) -> AnthropicClient {
        AnthropicClient::with_base_url("sk-test".into(), server.uri(), Duration::from_secs(5))
            .unwrap()
    }

    #[tokio::test]
    async fn successful_response_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-api-key", "sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_1",
                "content": [{"type": "text", "text": "done"}],
                "model": "claude-test",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 1}
            })))
            .mount(&server)
            .await;

        let resp = client_for(&server).await.send_message(&request()).await.unwrap();
        assert_eq!(resp.text(), "done");
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.send_message(&request()).await.unwrap_err();
        assert!(matches!(err, AnthropicError::RateLimited { retry_after_ms: 7000 }));
    }

    #[tokio::test]
    async fn server_error_carries_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server).await.send_message(&request()).await.unwrap_err();
        match err {
            AnthropicError::ApiError { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("expected ApiError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_text_is_an_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "msg_2",
                "content": [],
                "model": "claude-test",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 1, "output_tokens": 0}
            })))
            .mount(&server)
            .await;

        let err = client_for(&server).await.send_message(&request()).await.unwrap_err();
        assert!(matches!(err, AnthropicError::EmptyResponse));
    }
}
