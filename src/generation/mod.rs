//! Synthetic dataset generation jobs.
//!
//! A generation job walks document chunks, filters the ones worth learning
//! from, asks the LLM for chat pairs and persists them to the record store,
//! publishing a live metadata document the whole way. Abort is cooperative:
//! the pipeline polls a flag at its checkpoints and winds down cleanly,
//! reporting [`GenerationOutcome::Aborted`] rather than an error.

mod pipeline;
mod source;

pub use pipeline::{GenerationOutcome, GenerationPipeline, GenerationStats};
pub use source::{ChunkSource, DocumentChunk, HttpChunkSource, MemoryChunkSource};

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

/// Errors that fail a generation job outright.
///
/// Per-unit trouble (an unparseable reply, one failed persist) is counted
/// in [`GenerationStats`] instead; only conditions that make the whole job
/// pointless surface here.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The chunk source could not be read.
    #[error("Failed to read document chunks: {0}")]
    Source(#[from] StoreError),

    /// The generation model could not be reached during warm-up.
    #[error("Generation model unavailable: {0}")]
    ModelUnavailable(#[from] LlmError),
}
