//! Synthetic chat-pair generation over an [`LlmProvider`].
//!
//! Two calls per source unit: a YES/NO gate that filters out boilerplate
//! (tables of contents, page furniture, fragments), then the pair
//! generation itself. Both prompts pin the output format hard because the
//! results are persisted verbatim as training data.

use std::sync::Arc;
use tracing::warn;

use super::{extract_json_object, GenerationRequest, LlmError, LlmProvider, Message};
use crate::config::AppConfig;
use crate::task::GeneratedPair;

/// Prompt for generating one question/answer pair from a context.
const PAIR_GENERATION_PROMPT: &str = r#"You are a helpful and truthful assistant who is specialized in creating dataset for conversation between human and chat agent.
Task: Generate 1 comprehensive ["user_message", "assistant_message"] pairs in JSON format based solely on the important information.
Guidelines in output:
* The output must adhere to the json format, do not provide any additional information.
* If it is a response or answer, it should be comprehensive and human like.
* The values for each JSON key should be encoded in UTF-8.
Here is an example:
{
  "user_message": "How is the weather today?",
  "assistant_message": "The weather today is sunny."
}
"#;

/// Prompt asking whether a context is worth generating from.
const MEANINGFUL_GATE_PROMPT: &str = r#"You are a reliable and informative assistant. You are provided with a context and your task is to analyze if the context is meaningful.
Is the following context meaningful? (YES or NO)

### Context
{context}
"#;

/// Generates synthetic chat pairs from document text.
pub struct SyntheticGenerator {
    provider: Arc<dyn LlmProvider>,
    temperature: f64,
    max_tokens: u32,
}

impl SyntheticGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>, temperature: f64, max_tokens: u32) -> Self {
        Self {
            provider,
            temperature,
            max_tokens,
        }
    }

    pub fn from_config(provider: Arc<dyn LlmProvider>, config: &AppConfig) -> Self {
        Self::new(provider, config.llm_temperature, config.llm_max_tokens)
    }

    /// Verifies the generation endpoint is up and the model answers.
    ///
    /// Stands in for local model loading: jobs call this once before the
    /// generating phase so an unreachable backend fails the job up front
    /// instead of on the first unit.
    pub async fn warm_up(&self) -> Result<(), LlmError> {
        let request =
            GenerationRequest::new("", vec![Message::user("Reply with the single word READY.")])
                .with_temperature(0.0)
                .with_max_tokens(4);
        self.provider.generate(request).await?;
        Ok(())
    }

    /// Asks the model whether `context` carries enough substance to
    /// generate from.
    ///
    /// An answer other than YES or NO reads as not meaningful; the unit is
    /// skipped rather than the job failed.
    pub async fn is_unit_meaningful(&self, context: &str) -> Result<bool, LlmError> {
        let prompt = MEANINGFUL_GATE_PROMPT.replace("{context}", context);
        let request = GenerationRequest::new("", vec![Message::user(prompt)])
            .with_temperature(0.0)
            .with_max_tokens(8);

        let response = self.provider.generate(request).await?;
        let verdict = response
            .first_content()
            .ok_or_else(|| LlmError::ParseError("No content in LLM response".to_string()))?;

        Ok(parse_verdict(verdict))
    }

    /// Generates one chat pair from `context`.
    pub async fn generate_pair(&self, context: &str) -> Result<GeneratedPair, LlmError> {
        let prompt = format!(
            "{PAIR_GENERATION_PROMPT}\nContext: {}",
            context.trim_end()
        );
        let request = GenerationRequest::new("", vec![Message::user(prompt)])
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);

        let response = self.provider.generate(request).await?;
        let content = response
            .first_content()
            .ok_or_else(|| LlmError::ParseError("No content in LLM response".to_string()))?;

        parse_pair(content)
    }
}

/// Maps the gate reply onto a boolean; anything unrecognized is a skip.
fn parse_verdict(reply: &str) -> bool {
    let normalized = reply.trim().to_uppercase();
    if normalized.starts_with("YES") {
        true
    } else if normalized.starts_with("NO") {
        false
    } else {
        warn!(reply, "unrecognized meaningfulness verdict, skipping unit");
        false
    }
}

/// Parses a generated pair out of raw model output.
fn parse_pair(content: &str) -> Result<GeneratedPair, LlmError> {
    let json = extract_json_object(content).ok_or_else(|| {
        LlmError::ParseError(format!(
            "No JSON object in generation output: '{}'",
            preview(content)
        ))
    })?;

    let pair: GeneratedPair = serde_json::from_str(&json).map_err(|e| {
        LlmError::ParseError(format!("Generated object is not a chat pair: {}", e))
    })?;

    if pair.user_message.trim().is_empty() || pair.assistant_message.trim().is_empty() {
        return Err(LlmError::ParseError(
            "Generated pair has an empty message".to_string(),
        ));
    }

    Ok(pair)
}

fn preview(content: &str) -> &str {
    let end = content
        .char_indices()
        .nth(80)
        .map(|(i, _)| i)
        .unwrap_or(content.len());
    &content[..end]
}
