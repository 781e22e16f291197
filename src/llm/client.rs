//! HTTP client for the text-generation endpoint

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{GenerateOptions, LlmConfig, LlmProvider, TextGenerator};
use crate::error::{Result, TrackError};

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

/// Body for the openai and anthropic shapes
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
}

/// Body for custom endpoints
#[derive(Debug, Serialize)]
struct PromptRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
}

pub(crate) fn request_body(config: &LlmConfig, prompt: &str, options: &GenerateOptions) -> Result<Value> {
    let body = match config.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => serde_json::to_value(ChatRequest {
            model: &config.model,
            messages: vec![Message { role: "user", content: prompt }],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        })?,
        LlmProvider::Custom => serde_json::to_value(PromptRequest {
            model: &config.model,
            prompt,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        })?,
    };
    Ok(body)
}

/// Provider-specific headers (content type is set by the JSON body)
pub(crate) fn request_headers(config: &LlmConfig) -> Vec<(&'static str, String)> {
    match config.provider {
        LlmProvider::Anthropic => vec![
            ("x-api-key", config.api_key.clone()),
            ("anthropic-version", "2023-06-01".to_string()),
        ],
        LlmProvider::OpenAi | LlmProvider::Custom => {
            vec![("Authorization", format!("Bearer {}", config.api_key))]
        }
    }
}

/// Pull the generated text out of a reply; non-JSON or unexpected JSON comes back raw
pub(crate) fn parse_reply(provider: LlmProvider, raw: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(raw) else {
        return raw.to_string();
    };

    let text = match provider {
        LlmProvider::OpenAi => json["choices"][0]["message"]["content"].as_str(),
        LlmProvider::Anthropic => json["content"][0]["text"].as_str(),
        LlmProvider::Custom => ["response", "content", "text"]
            .iter()
            .find_map(|key| json[*key].as_str()),
    };

    text.map(str::to_string).unwrap_or_else(|| raw.to_string())
}

/// Text generator backed by a configured HTTP endpoint
pub struct LlmClient {
    config: LlmConfig,
    #[cfg(feature = "llm")]
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            #[cfg(feature = "llm")]
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    #[cfg(feature = "llm")]
    async fn post(&self, body: &Value) -> Result<String> {
        let mut request = self.client.post(&self.config.endpoint).json(body);
        for (name, value) in request_headers(&self.config) {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TrackError::Generation(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TrackError::Generation(e.to_string()))?;

        if !status.is_success() {
            return Err(TrackError::Generation(format!("HTTP {}: {}", status.as_u16(), text)));
        }
        Ok(text)
    }

    #[cfg(not(feature = "llm"))]
    async fn post(&self, _body: &Value) -> Result<String> {
        Err(TrackError::Generation(
            "LLM support not compiled in. Rebuild with --features llm".to_string(),
        ))
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String> {
        if !self.config.is_configured() {
            return Err(TrackError::Generation("LLM API not configured".to_string()));
        }

        debug!(
            "Calling {} endpoint with model {}",
            self.config.provider, self.config.model
        );
        let body = request_body(&self.config, prompt, options)?;
        let raw = self.post(&body).await?;
        Ok(parse_reply(self.config.provider, &raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: LlmProvider) -> LlmConfig {
        LlmConfig {
            provider,
            endpoint: "https://llm.example.com/v1".to_string(),
            model: "test-model".to_string(),
            api_key: "secret".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_chat_request_shape() {
        let options = GenerateOptions::default();
        let body = request_body(&config(LlmProvider::OpenAi), "Hello", &options).unwrap();
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "Hello");
        assert_eq!(body["max_tokens"], 1000);
        assert!(body.get("prompt").is_none());

        let anthropic = request_body(&config(LlmProvider::Anthropic), "Hello", &options).unwrap();
        assert_eq!(anthropic, body);
    }

    #[test]
    fn test_custom_request_shape() {
        let options = GenerateOptions {
            max_tokens: 50,
            temperature: 0.5,
        };
        let body = request_body(&config(LlmProvider::Custom), "Hello", &options).unwrap();
        assert_eq!(body["prompt"], "Hello");
        assert_eq!(body["max_tokens"], 50);
        assert_eq!(body["temperature"], 0.5);
        assert!(body.get("messages").is_none());
    }

    #[test]
    fn test_headers() {
        let openai = request_headers(&config(LlmProvider::OpenAi));
        assert_eq!(openai, vec![("Authorization", "Bearer secret".to_string())]);

        let anthropic = request_headers(&config(LlmProvider::Anthropic));
        assert!(anthropic.contains(&("x-api-key", "secret".to_string())));
        assert!(anthropic.contains(&("anthropic-version", "2023-06-01".to_string())));
    }

    #[test]
    fn test_parse_replies() {
        let openai = r#"{"choices":[{"message":{"role":"assistant","content":"hi there"}}]}"#;
        assert_eq!(parse_reply(LlmProvider::OpenAi, openai), "hi there");

        let anthropic = r#"{"content":[{"type":"text","text":"bonjour"}]}"#;
        assert_eq!(parse_reply(LlmProvider::Anthropic, anthropic), "bonjour");

        assert_eq!(parse_reply(LlmProvider::Custom, r#"{"text":"plain"}"#), "plain");
        assert_eq!(
            parse_reply(LlmProvider::Custom, r#"{"response":"first","text":"second"}"#),
            "first"
        );
    }

    #[test]
    fn test_parse_falls_back_to_raw() {
        assert_eq!(parse_reply(LlmProvider::OpenAi, "not json"), "not json");
        let unexpected = r#"{"id":"abc"}"#;
        assert_eq!(parse_reply(LlmProvider::Anthropic, unexpected), unexpected);
    }

    #[tokio::test]
    async fn test_unconfigured_client_fails_without_request() {
        let client = LlmClient::new(LlmConfig::default());
        let err = client
            .generate("Hello", &GenerateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrackError::Generation(ref msg) if msg == "LLM API not configured"));
    }
}
