//! Chat-completion client and synthetic pair generation.
//!
//! The generation worker talks to an OpenAI-compatible endpoint. The
//! [`LlmProvider`] trait is the seam between the pipeline and the wire so
//! generation logic can be tested against scripted providers.

mod client;
mod extract;
mod generator;

pub use client::{
    ChatClient, Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage,
};
pub use extract::extract_json_object;
pub use generator::SyntheticGenerator;

use thiserror::Error;

/// Errors from chat-completion calls and output parsing.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}
