//! OpenAI-compatible streaming chat completions.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tracing::debug;

use voxbridge_core::config::LlmConfig;

use crate::{ChatMessage, LlmProvider, TextStream, sse};

pub struct OpenAiChatProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiChatProvider {
    pub fn new(client: reqwest::Client, cfg: &LlmConfig) -> Self {
        Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.resolve_api_key(),
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiChatProvider {
    async fn stream_chat(&self, history: &[ChatMessage]) -> anyhow::Result<TextStream> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No LLM API key configured"))?;

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, messages = history.len(), "Starting chat stream");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.model,
                "messages": history,
                "stream": true,
                "max_tokens": self.max_tokens,
                "temperature": self.temperature,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {status}: {body}");
        }

        let stream = sse::data_lines(resp)
            .take_while(|evt| {
                let done = matches!(evt, Ok(data) if data == "[DONE]");
                futures::future::ready(!done)
            })
            .filter_map(|evt| {
                futures::future::ready(match evt {
                    Ok(data) => match serde_json::from_str::<serde_json::Value>(&data) {
                        Ok(value) => value["choices"][0]["delta"]["content"]
                            .as_str()
                            .filter(|s| !s.is_empty())
                            .map(|s| Ok(s.to_string())),
                        // keep-alive and unparseable lines are skipped
                        Err(_) => None,
                    },
                    Err(e) => Some(Err(e)),
                })
            });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxbridge_core::config::LlmConfig;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let cfg = LlmConfig {
            base_url: "https://api.example.com/v1/".into(),
            ..LlmConfig::default()
        };
        let provider = OpenAiChatProvider::new(reqwest::Client::new(), &cfg);
        assert_eq!(provider.base_url, "https://api.example.com/v1");
    }

    #[tokio::test]
    async fn test_missing_key_is_an_error() {
        let provider = OpenAiChatProvider::new(reqwest::Client::new(), &LlmConfig::default());
        let err = match provider.stream_chat(&[]).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("API key"));
    }

    #[test]
    fn test_delta_extraction() {
        let data = r#"{"choices":[{"delta":{"content":"hel"}}]}"#;
        let value: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(value["choices"][0]["delta"]["content"].as_str(), Some("hel"));

        let finish = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let value: serde_json::Value = serde_json::from_str(finish).unwrap();
        assert!(value["choices"][0]["delta"]["content"].as_str().is_none());
    }
}
