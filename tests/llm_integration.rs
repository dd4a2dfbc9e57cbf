//! Integration tests for the chat-completion client.
//!
//! These tests make real API calls to the configured generation endpoint.
//! Run with:
//!   TUNEFORGE_LLM_BASE_URL=http://localhost:4000 TUNEFORGE_LLM_MODEL=mistral-7b-instruct \
//!     cargo test --test llm_integration -- --ignored

use std::sync::Arc;

use tuneforge::config::AppConfig;
use tuneforge::llm::{ChatClient, GenerationRequest, LlmProvider, Message, SyntheticGenerator};

/// Endpoint settings from the environment, on top of the defaults.
fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    if let Ok(url) = std::env::var("TUNEFORGE_LLM_BASE_URL") {
        config = config.with_llm_base_url(url);
    }
    if let Ok(key) = std::env::var("TUNEFORGE_LLM_API_KEY") {
        config = config.with_llm_api_key(key);
    }
    if let Ok(model) = std::env::var("TUNEFORGE_LLM_MODEL") {
        config = config.with_llm_model(model);
    }
    config
}

fn create_test_client() -> ChatClient {
    ChatClient::from_config(&test_config())
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_generation() {
    let client = create_test_client();

    let request = GenerationRequest::new(
        "",
        vec![
            Message::system("You are a helpful assistant. Reply concisely."),
            Message::user("What is 2 + 2? Reply with just the number."),
        ],
    )
    .with_max_tokens(10)
    .with_temperature(0.0);

    let response = client.generate(request).await;
    assert!(response.is_ok(), "Generation failed: {:?}", response.err());

    let response = response.expect("Should have response");
    assert!(
        !response.choices.is_empty(),
        "Should have at least one choice"
    );

    let content = response.first_content().expect("Should have content");
    assert!(
        content.contains('4'),
        "Response should contain '4', got: {}",
        content
    );

    assert!(response.usage.total_tokens > 0, "Should have token usage");
}

#[tokio::test]
#[ignore]
async fn test_generator_warm_up() {
    let config = test_config();
    let client = Arc::new(ChatClient::from_config(&config));
    let generator = SyntheticGenerator::from_config(client, &config);

    let result = generator.warm_up().await;
    assert!(result.is_ok(), "Warm-up failed: {:?}", result.err());
}

#[tokio::test]
#[ignore]
async fn test_generate_pair_from_context() {
    let config = test_config();
    let client = Arc::new(ChatClient::from_config(&config));
    let generator = SyntheticGenerator::from_config(client, &config);

    let context = "The Transformer architecture replaced recurrence with \
        self-attention. Each layer computes attention weights between every \
        pair of positions in the input sequence, which allows training to be \
        parallelized across the sequence dimension and captures long-range \
        dependencies more directly than an RNN.";

    let pair = generator.generate_pair(context).await;
    assert!(pair.is_ok(), "Pair generation failed: {:?}", pair.err());

    let pair = pair.expect("Should have pair");
    assert!(!pair.user_message.is_empty(), "Question should not be empty");
    assert!(
        !pair.assistant_message.is_empty(),
        "Answer should not be empty"
    );
}

#[tokio::test]
#[ignore]
async fn test_meaningfulness_gate_rejects_boilerplate() {
    let config = test_config();
    let client = Arc::new(ChatClient::from_config(&config));
    let generator = SyntheticGenerator::from_config(client, &config);

    let boilerplate = "Page 4 of 12. Copyright 2019. All rights reserved. \
        This page intentionally left blank. Confidential. Do not distribute. \
        Printed in triplicate for archival purposes only.";

    let verdict = generator.is_unit_meaningful(boilerplate).await;
    assert!(verdict.is_ok(), "Gate call failed: {:?}", verdict.err());
    assert!(
        !verdict.expect("Should have verdict"),
        "Boilerplate should not pass the meaningfulness gate"
    );
}
