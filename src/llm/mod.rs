//! Text generation
//!
//! The configuration is an injected [`LlmConfig`] value; nothing here reads
//! process state. [`LlmClient`] speaks three request shapes (openai,
//! anthropic, custom). The prompts for course tagging, path suggestion and
//! email content live in [`tasks`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

mod client;
pub mod tasks;

pub use client::LlmClient;
pub use tasks::{
    CourseTagSuggestion, EmailContent, PathSuggestion, generate_email_content, suggest_paths,
    tag_course,
};

/// Request/response shape spoken by the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Custom,
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Configuration for the text-generation service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    /// Full URL requests are POSTed to
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::OpenAi,
            endpoint: String::new(),
            model: "gpt-4".to_string(),
            api_key: String::new(),
            max_tokens: 1000,
            temperature: 0.7,
        }
    }
}

impl LlmConfig {
    /// Both an endpoint and a key are set
    pub fn is_configured(&self) -> bool {
        !self.endpoint.trim().is_empty() && !self.api_key.trim().is_empty()
    }

    pub fn options(&self) -> GenerateOptions {
        GenerateOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Per-call generation settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            temperature: 0.7,
        }
    }
}

/// A service that turns a prompt into text
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String>;
}

/// Strip a surrounding Markdown code fence (```json ... ```) if present
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.strip_suffix("```").unwrap_or(body).trim()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names() {
        let config: LlmConfig = toml::from_str(r#"provider = "anthropic""#).unwrap();
        assert_eq!(config.provider, LlmProvider::Anthropic);
        let config: LlmConfig = toml::from_str(r#"provider = "openai""#).unwrap();
        assert_eq!(config.provider, LlmProvider::OpenAi);
        assert_eq!(LlmProvider::Custom.to_string(), "custom");
    }

    #[test]
    fn test_is_configured() {
        let mut config = LlmConfig::default();
        assert!(!config.is_configured());
        config.endpoint = "https://api.example.com/v1".to_string();
        assert!(!config.is_configured());
        config.api_key = "sk-test".to_string();
        assert!(config.is_configured());
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("  {\"a\": 1} "), "{\"a\": 1}");
        assert_eq!(strip_code_fence("```\n[1, 2]\n```"), "[1, 2]");
    }
}
