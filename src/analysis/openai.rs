//! OpenAI-compatible chat completions client.

use super::analyzer::{Analyzer, AnalyzerError, Completion, CompletionRequest};
use crate::config::AnalyzerConfig;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

pub struct OpenAiAnalyzer {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Self {
        let api_key = config.api_key.clone().filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            warn!("No analyzer API key configured; analysis calls will fail");
        }
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        }
    }

    fn classify_send_error(e: &reqwest::Error) -> AnalyzerError {
        if e.is_timeout() {
            AnalyzerError::Recoverable(format!("request timed out: {e}"))
        } else if e.is_connect() {
            AnalyzerError::Fatal(format!("connection failed: {e}"))
        } else {
            AnalyzerError::Recoverable(e.to_string())
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> AnalyzerError {
        let detail = format!("HTTP {status}: {}", truncate(body, 300));
        match status {
            StatusCode::TOO_MANY_REQUESTS => AnalyzerError::RateLimited(detail),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AnalyzerError::Fatal(detail),
            _ => AnalyzerError::Recoverable(detail),
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}

#[async_trait]
impl Analyzer for OpenAiAnalyzer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, AnalyzerError> {
        let Some(api_key) = &self.api_key else {
            return Err(AnalyzerError::Fatal("analyzer API key is not configured".into()));
        };
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!(model = %self.model, max_tokens = request.max_tokens, "Sending analyzer request");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!("Analyzer request failed: {e}");
                Self::classify_send_error(&e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, "Analyzer returned an error status");
            return Err(Self::classify_status(status, &text));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnalyzerError::Recoverable(format!("unreadable response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AnalyzerError::Recoverable("response has no message content".into()))?;

        Ok(Completion {
            content,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            total_tokens: parsed.usage.map(|u| u.total_tokens),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn analyzer(base_url: String) -> OpenAiAnalyzer {
        OpenAiAnalyzer::new(&AnalyzerConfig {
            base_url,
            api_key: Some("sk-test".into()),
            ..AnalyzerConfig::default()
        })
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "sys".into(),
            user: "code".into(),
            max_tokens: 100,
            temperature: 0.1,
            timeout: Duration::from_secs(5),
            json_mode: true,
        }
    }

    #[tokio::test]
    async fn parses_message_content_and_usage() {
        let router = Router::new().route(
            "/chat/completions",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["response_format"]["type"], "json_object");
                Json(json!({
                    "model": "gpt-4o-mini",
                    "choices": [{"message": {"content": "{\"issues\": []}"}}],
                    "usage": {"total_tokens": 42}
                }))
            }),
        );
        let done = analyzer(serve(router).await).complete(request()).await.unwrap();
        assert_eq!(done.content, r#"{"issues": []}"#);
        assert_eq!(done.total_tokens, Some(42));
    }

    #[tokio::test]
    async fn status_codes_are_classified() {
        let router = Router::new()
            .route("/a/chat/completions", post(|| async { (AxumStatus::TOO_MANY_REQUESTS, "slow down") }))
            .route("/b/chat/completions", post(|| async { (AxumStatus::UNAUTHORIZED, "bad key") }))
            .route("/c/chat/completions", post(|| async { (AxumStatus::BAD_GATEWAY, "upstream") }));
        let base = serve(router).await;
        let err = analyzer(format!("{base}/a")).complete(request()).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::RateLimited(_)));
        let err = analyzer(format!("{base}/b")).complete(request()).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::Fatal(_)));
        let err = analyzer(format!("{base}/c")).complete(request()).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::Recoverable(_)));
    }

    #[tokio::test]
    async fn missing_key_is_fatal() {
        let analyzer = OpenAiAnalyzer::new(&AnalyzerConfig::default());
        let err = analyzer.complete(request()).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
