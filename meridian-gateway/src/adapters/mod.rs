//! Protocol Adapters (C7).
//!
//! Three wire dialects (openai, claude, responses) participate; translation
//! is expressed as a small matrix of adapter pairs over `serde_json::Value`
//! rather than polymorphism — at most nine concrete functions plus
//! passthrough.

pub mod sse;
pub mod unary;

pub use sse::SseTranslator;
pub use unary::{translate_request, translate_unary_response};
