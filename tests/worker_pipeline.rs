//! End-to-end worker pool test over a live Redis broker.
//!
//! The broker is real; the record store and chunk source are in-memory and
//! the LLM is scripted, so Redis is the only infrastructure needed.
//! Run with:
//!   TUNEFORGE_REDIS_URL=redis://127.0.0.1:6379 \
//!     cargo test --test worker_pipeline -- --ignored

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use tuneforge::broker::{BrokerInspect, JobBroker, JobHandle, JobPayload, QueueName};
use tuneforge::config::AppConfig;
use tuneforge::generation::{DocumentChunk, MemoryChunkSource};
use tuneforge::llm::{
    Choice, GenerationRequest, GenerationResponse, LlmError, LlmProvider, Message, Usage,
};
use tuneforge::store::MemoryRecordStore;
use tuneforge::task::TaskStatus;
use tuneforge::worker::{WorkerContext, WorkerPool};

/// Scripted provider: passes every meaningfulness gate and answers pair
/// generation with one fixed pair.
struct ScriptedProvider;

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let content = if prompt.contains("(YES or NO)") {
            "YES".to_string()
        } else if prompt.contains("READY") {
            "READY".to_string()
        } else {
            r#"{"user_message": "What does the manual describe?", "assistant_message": "It describes the pump maintenance procedure."}"#
                .to_string()
        };
        Ok(GenerationResponse {
            id: "scripted".to_string(),
            model: request.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: "stop".to_string(),
            }],
            usage: Usage {
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            },
        })
    }
}

fn redis_url() -> String {
    std::env::var("TUNEFORGE_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn chunk(text: &str, source: &str, page: u32) -> DocumentChunk {
    DocumentChunk {
        text: text.to_string(),
        source: source.to_string(),
        page,
    }
}

async fn wait_for_success(broker: &JobBroker, handle: &JobHandle, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let state = broker.job_state(handle).await.expect("state read failed");
        if state == Some(TaskStatus::Success) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{what} did not reach SUCCESS in time, last state: {state:?}"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test worker_pipeline -- --ignored
async fn test_pool_runs_generation_and_telemetry_jobs() {
    let broker = JobBroker::connect(&redis_url())
        .await
        .expect("Redis must be reachable for integration tests");
    broker
        .purge(QueueName::Document)
        .await
        .expect("purge failed");
    broker
        .purge(QueueName::Telemetry)
        .await
        .expect("purge failed");

    let store = Arc::new(MemoryRecordStore::new());
    let chunks = MemoryChunkSource::new();
    // Both chunks clear the minimum-length bar for generation units.
    let paragraph_one = "The centrifugal pump must be primed before the first \
        start of a shift. Open the suction valve fully, crack the discharge \
        valve a quarter turn and run the priming pump until a steady stream \
        with no air bubbles leaves the vent port. Never run the pump dry for \
        more than ten seconds.";
    let paragraph_two = "Bearing temperature is the earliest indicator of \
        misalignment. Record the temperature of both bearings thirty minutes \
        after start and compare against the commissioning baseline. A rise of \
        more than fifteen degrees over baseline requires an immediate \
        shutdown and a laser alignment check before restart.";
    chunks.insert(
        42,
        vec![
            chunk(paragraph_one, "manual.pdf", 0),
            chunk(paragraph_two, "manual.pdf", 1),
        ],
    );

    let config = AppConfig::default()
        .with_redis_url(redis_url())
        .with_dequeue_timeout(Duration::from_secs(1));
    let context = WorkerContext::new(
        broker.clone(),
        store.clone(),
        Arc::new(chunks),
        Arc::new(ScriptedProvider),
        config,
    );
    let pool = WorkerPool::start(context).await;

    let generation_handle = broker
        .publish(JobPayload::DocumentDataGeneration {
            dataset_id: 42,
            project_id: 7,
            source_filename: "manual.pdf".to_string(),
            num_generations: 2,
        })
        .await
        .expect("publish failed");
    let telemetry_handle = broker
        .publish(JobPayload::UpdateHardwareInfo)
        .await
        .expect("publish failed");

    wait_for_success(&broker, &generation_handle, "generation job").await;
    wait_for_success(&broker, &telemetry_handle, "telemetry job").await;

    pool.shutdown().await;

    // Identical generations collapse per unit, so two chunks yield two pairs.
    let pairs = store.pairs_for(42);
    assert_eq!(pairs.len(), 2, "one deduplicated pair per chunk");
    assert!(pairs.iter().all(|p| !p.user_message.is_empty()));
    assert!(pairs.iter().all(|p| !p.assistant_message.is_empty()));

    assert!(
        store.metadata_for(42).is_none(),
        "progress metadata should be cleared after the run"
    );
    assert!(
        store.hardware_info().is_some(),
        "hardware inventory should have been pushed"
    );
}
