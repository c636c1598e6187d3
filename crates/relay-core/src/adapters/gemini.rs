//! Gemini adapter - `generateContent` over HTTPS.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{truncate, Generation, GenerationRequest, TextGenerator, TransportError};

/// Characters of an error body kept in diagnostics.
const ERROR_BODY_CHARS: usize = 200;

/// HTTP client for a Gemini-compatible endpoint.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    total_token_count: u64,
}

impl GeminiClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn body(request: &GenerationRequest) -> Value {
        let mut generation_config = json!({
            "temperature": request.temperature,
            "maxOutputTokens": request.max_output_tokens,
        });
        if request.json_response {
            generation_config["responseMimeType"] = json!("application/json");
        }

        let mut body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": request.prompt }] }],
            "generationConfig": generation_config,
        });
        if let Some(system) = &request.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    fn map_send_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, TransportError> {
        if self.api_key.is_empty() {
            return Err(TransportError::MissingCredentials);
        }

        let started = Instant::now();
        tracing::debug!(model = %self.model, json = request.json_response, "Calling generateContent");

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&Self::body(&request))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        let raw = response.text().await.map_err(|e| self.map_send_error(e))?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited(truncate(&raw, ERROR_BODY_CHARS)));
        }
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: truncate(&raw, ERROR_BODY_CHARS),
            });
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&raw).map_err(|e| TransportError::Decode(e.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: truncate(&error.to_string(), ERROR_BODY_CHARS),
            });
        }

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text)
            .unwrap_or_default();
        let tokens_used = parsed
            .usage_metadata
            .map(|u| u.total_token_count)
            .unwrap_or(0);

        Ok(Generation {
            text,
            tokens_used,
            latency_ms,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> GeminiClient {
        GeminiClient::new(server.uri(), "test-model", "k", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn parses_text_and_token_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/test-model:generateContent"))
            .and(query_param("key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{ "content": { "parts": [{ "text": "done" }] } }],
                "usageMetadata": { "totalTokenCount": 42 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let generation = client(&server)
            .generate(GenerationRequest::new("hello"))
            .await
            .unwrap();
        assert_eq!(generation.text, "done");
        assert_eq!(generation.tokens_used, 42);
    }

    #[tokio::test]
    async fn maps_429_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client(&server)
            .generate(GenerationRequest::new("hello"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::RateLimited("slow down".to_string()));
    }

    #[tokio::test]
    async fn maps_server_error_to_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server)
            .generate(GenerationRequest::new("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn missing_key_fails_before_sending() {
        let client = GeminiClient::new("http://127.0.0.1:9", "m", "", Duration::from_secs(1));
        let err = client
            .generate(GenerationRequest::new("hello"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::MissingCredentials);
    }

    #[test]
    fn body_carries_system_instruction_and_json_mode() {
        let request = GenerationRequest::new("p").with_system("s").json();
        let body = GeminiClient::body(&request);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "s");
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }
}
