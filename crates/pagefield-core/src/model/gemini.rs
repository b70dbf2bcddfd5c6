use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use super::FieldExtractor;
use crate::raster::PageImage;
use crate::rate_limit::{ExtractError, check_rate_limit_response};

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash-002";

#[derive(Clone)]
pub struct ModelConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    /// Per-request HTTP timeout. The page budget still applies on top.
    pub request_timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field(
                "api_key",
                &if self.api_key.is_empty() {
                    "<unset>"
                } else {
                    "<redacted>"
                },
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Field extraction through the Gemini `generateContent` API.
pub struct GeminiExtractor {
    config: ModelConfig,
    client: reqwest::Client,
}

impl GeminiExtractor {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(config: ModelConfig, client: reqwest::Client) -> Self {
        Self { config, client }
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }
}

/// Request payload: the page as inline PNG followed by the instructions.
pub fn request_body(image: &PageImage, instructions: &str) -> Value {
    json!({
        "contents": [{
            "role": "user",
            "parts": [
                {
                    "inline_data": {
                        "mime_type": "image/png",
                        "data": STANDARD.encode(&image.png),
                    }
                },
                { "text": instructions }
            ]
        }],
        "generationConfig": {
            "temperature": 1,
            "topP": 0.95,
            "maxOutputTokens": 8192,
            "responseMimeType": "application/json"
        }
    })
}

/// Concatenated text parts of the first candidate. A response with no
/// candidate text is an empty string so the caller retries.
pub fn response_text(data: &Value) -> String {
    data["candidates"]
        .as_array()
        .and_then(|c| c.first())
        .and_then(|c| c["content"]["parts"].as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Map a non-success body to an error. Quota exhaustion reported in the body
/// counts as a rate limit.
pub fn classify_error(status: u16, body: &str) -> ExtractError {
    let quota = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["status"].as_str().map(str::to_owned))
        .is_some_and(|s| s == "RESOURCE_EXHAUSTED");
    if quota {
        return ExtractError::RateLimited { retry_after: None };
    }
    let snippet: String = body.chars().take(200).collect();
    ExtractError::Other(format!("HTTP {status}: {snippet}"))
}

impl FieldExtractor for GeminiExtractor {
    fn name(&self) -> &str {
        &self.config.model
    }

    fn extract<'a>(
        &'a self,
        image: &'a PageImage,
        instructions: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ExtractError>> + Send + 'a>> {
        Box::pin(async move {
            let resp = self
                .client
                .post(self.url())
                .header("x-goog-api-key", &self.config.api_key)
                .timeout(self.config.request_timeout)
                .json(&request_body(image, instructions))
                .send()
                .await?;

            check_rate_limit_response(&resp)?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(classify_error(status.as_u16(), &body));
            }

            let data: Value = resp.json().await?;
            Ok(response_text(&data))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_image_and_instructions() {
        let image = PageImage {
            number: 1,
            png: vec![0x89, b'P', b'N', b'G'],
        };
        let body = request_body(&image, "extract the totals");
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["inline_data"]["data"], "iVBORw==");
        assert_eq!(parts[0]["inline_data"]["mime_type"], "image/png");
        assert_eq!(parts[1]["text"], "extract the totals");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8192);
        assert_eq!(
            body["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn text_joins_parts_of_first_candidate() {
        let data = json!({
            "candidates": [
                {"content": {"parts": [{"text": "[{\"a\":"}, {"text": "1}]"}]}},
                {"content": {"parts": [{"text": "ignored"}]}}
            ]
        });
        assert_eq!(response_text(&data), "[{\"a\":1}]");
        assert_eq!(response_text(&json!({})), "");
    }

    #[test]
    fn resource_exhausted_is_rate_limit() {
        let body = r#"{"error":{"code":400,"status":"RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(
            classify_error(400, body),
            ExtractError::RateLimited { retry_after: None }
        );
        assert!(matches!(
            classify_error(500, "boom"),
            ExtractError::Other(msg) if msg == "HTTP 500: boom"
        ));
    }

    #[test]
    fn debug_redacts_key() {
        let config = ModelConfig {
            api_key: "secret-key".into(),
            ..ModelConfig::default()
        };
        let dbg = format!("{config:?}");
        assert!(!dbg.contains("secret-key"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn url_joins_endpoint_and_model() {
        let extractor = GeminiExtractor::new(ModelConfig {
            endpoint: "http://localhost:9000/".into(),
            ..ModelConfig::default()
        });
        assert_eq!(
            extractor.url(),
            "http://localhost:9000/v1beta/models/gemini-1.5-flash-002:generateContent"
        );
    }
}
