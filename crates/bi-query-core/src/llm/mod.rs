//! LLM client abstraction for the gateway's configured providers.
//!
//! This module provides a unified interface for completions and embeddings
//! across the three providers the gateway's configuration surface allows:
//! OpenAI, a local Ollama daemon, and Gemini.
//!
//! ## Example
//!
//! ```rust,ignore
//! use bi_query_core::llm::{
//!     OpenAIClient, ClientConfig, CompletionRequest, ChatMessage,
//! };
//!
//! let client = OpenAIClient::new(
//!     ClientConfig::new("your-api-key").with_default_model("gpt-4o")
//! );
//!
//! let request = CompletionRequest::new()
//!     .with_message(ChatMessage::user("Hello"));
//!
//! let response = client.complete(request).await?;
//! ```

mod client;
mod types;

pub use client::{
    ClientConfig, GeminiClient, LLMClient, MultiProviderClient, OllamaClient, OpenAIClient,
    TrackedClient,
};
pub use types::{
    CacheControl, ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostTracker,
    EmbeddingRequest, EmbeddingResponse, ModelCosts, ModelSpec, ModelTier, Provider, StopReason,
    TierBreakdown, TierCosts, TokenUsage,
};
