//! # Meridian SDK
//!
//! Vendor adapters for the AI/LLM providers fronted by the Meridian Gateway.
//! Each provider implements a single `Provider` trait over OpenAI-shaped
//! request/response types, so the gateway's upstream proxy engine can
//! dispatch to any of them through one uniform interface regardless of the
//! vendor's own wire format.
//!
//! ## Overview
//!
//! This crate provides:
//! - **Unified Provider Interface**: a single `Provider` trait implemented
//!   by every vendor adapter
//! - **Provider Factory**: `create_provider(config)` resolves a vendor by
//!   name without the caller needing to know the concrete type
//! - **Error Handling**: structured `ProviderError`/`ClientError` types
//! - **Health Monitoring**: a `health_check()` probe per provider
//!
//! ## Supported Providers
//!
//! - **OpenAI**: GPT-4, GPT-3.5, and other OpenAI models
//! - **Anthropic**: Claude-3, Claude-2, and Claude Instant
//! - **Google**: Gemini Pro, Gemini Pro Vision, and PaLM
//! - **Azure OpenAI**: Azure-hosted OpenAI models
//! - **Ollama**: Local and remote Ollama instances
//! - **Mistral AI**: Mistral 7B, Mixtral, and other models
//! - **Cohere**: Command, Command R, and other Cohere models
//! - **Groq, OpenRouter, Perplexity**: OpenAI-compatible hosted endpoints
//! - **Custom Providers**: Extensible provider system
//!
//! ## Quick Start
//!
//! ```rust
//! use meridian_sdk::providers::{create_provider, ProviderConfig};
//! use meridian_sdk::{ChatRequest, Message};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProviderConfig::new("openai", "your-openai-key");
//! let provider = create_provider(config)?;
//!
//! let request = ChatRequest {
//!     model: "gpt-4".to_string(),
//!     messages: vec![Message::user("Hello, world!")],
//!     temperature: Some(0.7),
//!     max_tokens: Some(100),
//!     stream: Some(false),
//!     ..Default::default()
//! };
//!
//! let response = provider.chat_completion(request).await?;
//! println!("Response: {}", response.choices[0].message.content);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! ```rust
//! use meridian_sdk::ProviderError;
//!
//! fn describe(err: &ProviderError) -> &'static str {
//!     match err {
//!         ProviderError::InvalidApiKey => "invalid API key",
//!         ProviderError::RateLimit => "rate limited, retry later",
//!         ProviderError::ServiceUnavailable => "provider unavailable",
//!         _ => "other error",
//!     }
//! }
//! ```
//!
//! ## License
//!
//! This project is licensed under the MIT License - see the [LICENSE](LICENSE) file for details.

pub mod common;
pub mod error;
pub mod models;
pub mod providers;

pub use error::{ClientError, ProviderError};
pub use models::{
    AudioRequest, AudioResponse, ChatRequest, ChatResponse, Choice, EmbeddingRequest,
    EmbeddingResponse, ImageRequest, ImageResponse, Message, Role, SpeechRequest, SpeechResponse,
    Usage,
};
pub use providers::{create_provider, Provider, ProviderConfig, ProviderMetrics};

/// Result type for SDK operations.
///
/// This is a convenience type alias for SDK operations that can fail.
/// It uses `ClientError` as the error type.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatRequest, Message, Role};

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello, world!");
        assert_eq!(user_msg.role, Role::User);
        assert_eq!(user_msg.content, "Hello, world!");

        let assistant_msg = Message::assistant("Hi there!");
        assert_eq!(assistant_msg.role, Role::Assistant);
        assert_eq!(assistant_msg.content, "Hi there!");

        let system_msg = Message::system("You are a helpful assistant.");
        assert_eq!(system_msg.role, Role::System);
        assert_eq!(system_msg.content, "You are a helpful assistant.");
    }

    #[test]
    fn test_chat_request_default() {
        let request = ChatRequest::default();
        assert_eq!(request.model, "");
        assert_eq!(request.messages.len(), 0);
        assert_eq!(request.temperature, None);
        assert_eq!(request.max_tokens, None);
        assert_eq!(request.stream, None);
    }

    #[test]
    fn test_provider_config_creation() {
        let config = ProviderConfig::new("test-provider", "test-key");
        assert_eq!(config.name, "test-provider");
        assert_eq!(config.api_key, "test-key");
        assert_eq!(config.timeout.as_secs(), 30);
        assert_eq!(config.max_retries, 3);
        assert!(config.enabled);
    }

    #[test]
    fn test_create_provider_unknown_name_errors() {
        let config = ProviderConfig::new("not-a-real-provider", "key");
        let result = providers::create_provider(config);
        assert!(result.is_err());
    }
}
