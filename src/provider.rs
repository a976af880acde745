//! Model provider seam.
//!
//! The bridge never talks to a model API itself. A [`Provider`] receives the
//! resolved [`ApiConfiguration`] and returns a stream of [`Chunk`]s, which the
//! controller forwards to the requesting UI instance.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::state::keys::{Mode, SecretKey};
use crate::state::manager::ApiConfiguration;

/// Known model providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
    OpenRouter,
    Gemini,
    Ollama,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "openrouter" => Some(Self::OpenRouter),
            "gemini" => Some(Self::Gemini),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    /// Secret holding this provider's credential. Local providers have none.
    #[must_use]
    pub fn secret_key(self) -> Option<SecretKey> {
        match self {
            Self::Anthropic => Some(SecretKey::AnthropicApiKey),
            Self::OpenAi => Some(SecretKey::OpenAiApiKey),
            Self::OpenRouter => Some(SecretKey::OpenRouterApiKey),
            Self::Gemini => Some(SecretKey::GeminiApiKey),
            Self::Ollama => None,
        }
    }
}

/// One unit of provider output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    Text { text: String },
    Usage { input_tokens: u64, output_tokens: u64 },
}

/// Boxed stream of provider output.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk>> + Send>>;

/// A model backend the bridge can stream from.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Start a completion. Errors before the first chunk are returned here;
    /// errors mid-stream arrive as stream items.
    async fn stream(&self, config: &ApiConfiguration, mode: Mode, prompt: &str) -> Result<ChunkStream>;
}

/// Echoes the prompt back word by word. Used when no real backend is wired.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn stream(&self, config: &ApiConfiguration, mode: Mode, prompt: &str) -> Result<ChunkStream> {
        if prompt.trim().is_empty() {
            return Err(BridgeError::Provider("prompt is empty".to_owned()));
        }
        let words: Vec<String> = prompt.split_whitespace().map(str::to_owned).collect();
        let model = config.model_id.clone().unwrap_or_else(|| "echo".to_owned());
        let input_tokens = words.len() as u64;
        tracing::debug!(model = %model, mode = mode.as_str(), words = words.len(), "echo stream started");

        Ok(Box::pin(async_stream::stream! {
            let mut output_tokens = 0u64;
            for (index, word) in words.into_iter().enumerate() {
                let text = if index == 0 { word } else { format!(" {word}") };
                output_tokens += 1;
                yield Ok::<Chunk, BridgeError>(Chunk::Text { text });
                tokio::task::yield_now().await;
            }
            yield Ok::<Chunk, BridgeError>(Chunk::Usage { input_tokens, output_tokens });
        }))
    }
}
