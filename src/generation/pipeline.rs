//! The generation pipeline: chunks in, persisted chat pairs out.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::source::{fetch_all, ChunkSource, DocumentChunk};
use super::GenerationError;
use crate::abort::AbortSignal;
use crate::broker::JobHandle;
use crate::callback::CallbackClient;
use crate::llm::SyntheticGenerator;
use crate::task::{DatasetId, GeneratedPair, GenerationMetadata};

/// Units at or below this length carry too little text to generate from.
const MIN_UNIT_CHARS: usize = 150;

/// Counters for one generation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    /// Units examined, including skipped and failed ones.
    pub units_total: u32,
    /// Units skipped for being too short.
    pub units_skipped: u32,
    /// Units that failed the gate, the generation call or persistence.
    pub units_failed: u32,
    /// Pairs written to the record store.
    pub pairs_persisted: u32,
    /// Wall time of the run.
    pub elapsed: Duration,
}

/// How a generation run ended. Abort is a successful outcome, not an
/// error; partial results persisted before the abort stay in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Completed(GenerationStats),
    Aborted(GenerationStats),
}

impl GenerationOutcome {
    pub fn stats(&self) -> &GenerationStats {
        match self {
            GenerationOutcome::Completed(stats) | GenerationOutcome::Aborted(stats) => stats,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, GenerationOutcome::Aborted(_))
    }
}

/// Drives generation jobs end to end: metadata upkeep, abort checkpoints,
/// unit accounting and pair persistence.
pub struct GenerationPipeline {
    callbacks: CallbackClient,
    source: Arc<dyn ChunkSource>,
    generator: SyntheticGenerator,
}

impl GenerationPipeline {
    pub fn new(
        callbacks: CallbackClient,
        source: Arc<dyn ChunkSource>,
        generator: SyntheticGenerator,
    ) -> Self {
        Self {
            callbacks,
            source,
            generator,
        }
    }

    /// Generates pairs from every named document in a dataset.
    pub async fn run_for_documents(
        &self,
        handle: &JobHandle,
        dataset_id: DatasetId,
        document_names: &[String],
        num_generations: u32,
        abort: &dyn AbortSignal,
    ) -> Result<GenerationOutcome, GenerationError> {
        let started = Instant::now();
        let mut stats = GenerationStats::default();
        let mut metadata = GenerationMetadata::new(handle.as_str(), document_names.len() as u32);

        if !self.enter_generating_phase(dataset_id, &mut metadata, abort).await? {
            return Ok(self.finish(dataset_id, stats, started, true).await);
        }

        for (index, name) in document_names.iter().enumerate() {
            metadata.processed_files = index as u32 + 1;
            info!(dataset_id, document = %name, "generating from document");

            let chunks = match fetch_all(self.source.as_ref(), dataset_id, Some(name.as_str())).await
            {
                Ok(chunks) => chunks,
                Err(error) => {
                    self.callbacks.generation_metadata(dataset_id, None).await;
                    return Err(error.into());
                }
            };

            metadata.total_pages = chunks.len() as u32;
            metadata.current_page = 0;

            let aborted = self
                .process_units(dataset_id, num_generations, &chunks, &mut metadata, &mut stats, abort)
                .await;
            if aborted {
                return Ok(self.finish(dataset_id, stats, started, true).await);
            }
        }

        Ok(self.finish(dataset_id, stats, started, false).await)
    }

    /// Generates pairs from the chunks of one embedded source document.
    pub async fn run_for_source(
        &self,
        handle: &JobHandle,
        dataset_id: DatasetId,
        source_filename: &str,
        num_generations: u32,
        abort: &dyn AbortSignal,
    ) -> Result<GenerationOutcome, GenerationError> {
        let started = Instant::now();
        let mut stats = GenerationStats::default();
        let mut metadata = GenerationMetadata::new(handle.as_str(), 1);
        metadata.processed_files = 1;

        if !self.enter_generating_phase(dataset_id, &mut metadata, abort).await? {
            return Ok(self.finish(dataset_id, stats, started, true).await);
        }

        let chunks = match fetch_all(self.source.as_ref(), dataset_id, Some(source_filename)).await
        {
            Ok(chunks) => chunks,
            Err(error) => {
                self.callbacks.generation_metadata(dataset_id, None).await;
                return Err(error.into());
            }
        };

        metadata.total_pages = chunks.len() as u32;

        let aborted = self
            .process_units(dataset_id, num_generations, &chunks, &mut metadata, &mut stats, abort)
            .await;
        Ok(self.finish(dataset_id, stats, started, aborted).await)
    }

    /// Warm-up leg shared by both flows: publishes the loading phase, pokes
    /// the model and flips to the generating phase.
    ///
    /// Returns `Ok(false)` when an abort was observed at either checkpoint.
    /// A warm-up failure fails the job; the metadata is cleared first.
    async fn enter_generating_phase(
        &self,
        dataset_id: DatasetId,
        metadata: &mut GenerationMetadata,
        abort: &dyn AbortSignal,
    ) -> Result<bool, GenerationError> {
        if abort.is_aborted().await {
            return Ok(false);
        }

        metadata.status = GenerationMetadata::PHASE_LOADING_MODEL.to_string();
        self.callbacks
            .generation_metadata(dataset_id, Some(metadata))
            .await;

        if let Err(error) = self.generator.warm_up().await {
            warn!(dataset_id, %error, "generation model warm-up failed");
            self.callbacks.generation_metadata(dataset_id, None).await;
            return Err(error.into());
        }

        if abort.is_aborted().await {
            self.mark_cancelled(dataset_id, metadata).await;
            return Ok(false);
        }

        metadata.status = GenerationMetadata::PHASE_GENERATING_DATA.to_string();
        self.callbacks
            .generation_metadata(dataset_id, Some(metadata))
            .await;
        Ok(true)
    }

    /// Acknowledges an observed abort in the progress document before the
    /// wind-down clears it.
    async fn mark_cancelled(&self, dataset_id: DatasetId, metadata: &mut GenerationMetadata) {
        metadata.is_cancel = true;
        self.callbacks
            .generation_metadata(dataset_id, Some(metadata))
            .await;
    }

    /// Walks the units of one document. Returns whether an abort was
    /// observed; pairs produced but not yet persisted at that point are
    /// discarded.
    async fn process_units(
        &self,
        dataset_id: DatasetId,
        num_generations: u32,
        chunks: &[DocumentChunk],
        metadata: &mut GenerationMetadata,
        stats: &mut GenerationStats,
        abort: &dyn AbortSignal,
    ) -> bool {
        for (index, chunk) in chunks.iter().enumerate() {
            metadata.current_page = index as u32 + 1;
            stats.units_total += 1;
            info!(
                unit = metadata.current_page,
                total = metadata.total_pages,
                "processing unit"
            );

            if chunk.text.len() <= MIN_UNIT_CHARS {
                stats.units_skipped += 1;
                warn!(
                    length = chunk.text.len(),
                    "unit shorter than {} chars, skipped", MIN_UNIT_CHARS
                );
                continue;
            }

            self.callbacks
                .generation_metadata(dataset_id, Some(metadata))
                .await;

            if abort.is_aborted().await {
                self.mark_cancelled(dataset_id, metadata).await;
                return true;
            }

            match self.generator.is_unit_meaningful(&chunk.text).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(page = chunk.page, "unit not meaningful, skipped");
                    stats.units_failed += 1;
                    continue;
                }
                Err(error) => {
                    warn!(page = chunk.page, %error, "meaningfulness check failed");
                    stats.units_failed += 1;
                    continue;
                }
            }

            let mut pairs: Vec<GeneratedPair> = Vec::new();
            let mut unit_failed = false;
            for _ in 0..num_generations {
                if abort.is_aborted().await {
                    self.mark_cancelled(dataset_id, metadata).await;
                    return true;
                }
                match self.generator.generate_pair(&chunk.text).await {
                    Ok(pair) => {
                        if !pairs.contains(&pair) {
                            pairs.push(pair);
                        }
                    }
                    Err(error) => {
                        warn!(page = chunk.page, %error, "pair generation failed");
                        stats.units_failed += 1;
                        unit_failed = true;
                        break;
                    }
                }
            }
            if unit_failed {
                continue;
            }

            if abort.is_aborted().await {
                self.mark_cancelled(dataset_id, metadata).await;
                return true;
            }

            for pair in &pairs {
                match self
                    .callbacks
                    .store()
                    .append_generated_pair(dataset_id, pair)
                    .await
                {
                    Ok(()) => stats.pairs_persisted += 1,
                    Err(error) => {
                        warn!(%error, "failed to persist generated pair");
                        stats.units_failed += 1;
                    }
                }
            }
        }

        false
    }

    /// Shared wind-down: clears the metadata document and logs the run
    /// counters. Runs on completion and on abort alike.
    async fn finish(
        &self,
        dataset_id: DatasetId,
        mut stats: GenerationStats,
        started: Instant,
        aborted: bool,
    ) -> GenerationOutcome {
        stats.elapsed = started.elapsed();
        self.callbacks.generation_metadata(dataset_id, None).await;

        if aborted {
            info!(
                dataset_id,
                elapsed_secs = stats.elapsed.as_secs_f64(),
                pairs_persisted = stats.pairs_persisted,
                "generation aborted"
            );
            GenerationOutcome::Aborted(stats)
        } else {
            info!(
                dataset_id,
                elapsed_secs = stats.elapsed.as_secs_f64(),
                units_skipped = stats.units_skipped,
                units_failed = stats.units_failed,
                pairs_persisted = stats.pairs_persisted,
                "generation run finished"
            );
            GenerationOutcome::Completed(stats)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::ManualAbort;
    use crate::generation::MemoryChunkSource;
    use crate::llm::{
        Choice, GenerationRequest, GenerationResponse, LlmError, LlmProvider, Message, Usage,
    };
    use crate::store::MemoryRecordStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    struct ScriptedProvider {
        replies: Mutex<Vec<String>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            let content = self
                .replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| "YES".to_string());
            Ok(GenerationResponse {
                id: "scripted".to_string(),
                model: "scripted".to_string(),
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

    struct UnreachableProvider;

    #[async_trait]
    impl LlmProvider for UnreachableProvider {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            Err(LlmError::RequestFailed("connection refused".to_string()))
        }
    }

    /// Signal that reads aborted from the nth poll onward.
    struct CountdownAbort {
        remaining: AtomicI32,
    }

    impl CountdownAbort {
        fn after(polls: i32) -> Self {
            Self {
                remaining: AtomicI32::new(polls),
            }
        }
    }

    #[async_trait]
    impl AbortSignal for CountdownAbort {
        async fn is_aborted(&self) -> bool {
            self.remaining.fetch_sub(1, Ordering::SeqCst) <= 1
        }
    }

    fn pipeline(
        store: &Arc<MemoryRecordStore>,
        source: MemoryChunkSource,
        replies: Vec<&str>,
    ) -> GenerationPipeline {
        GenerationPipeline::new(
            CallbackClient::new(store.clone()),
            Arc::new(source),
            SyntheticGenerator::new(Arc::new(ScriptedProvider::new(replies)), 0.7, 2048),
        )
    }

    fn long_text(seed: &str) -> String {
        seed.repeat(40)
    }

    fn chunk(text: String, page: u32) -> DocumentChunk {
        DocumentChunk {
            text,
            source: "doc.pdf".to_string(),
            page,
        }
    }

    #[tokio::test]
    async fn test_run_counts_and_persists() {
        let store = Arc::new(MemoryRecordStore::new());
        let source = MemoryChunkSource::new();
        source.insert(
            1,
            vec![
                chunk("too short".to_string(), 0),
                chunk(long_text("boilerplate "), 1),
                chunk(long_text("substantial content "), 2),
            ],
        );

        // warm-up, gate NO for unit 2, gate YES for unit 3, then the same
        // pair twice so deduplication collapses it to one persisted row
        let pair = r#"{"user_message": "q", "assistant_message": "a"}"#;
        let pipeline = pipeline(&store, source, vec!["READY", "NO", "YES", pair, pair]);

        let outcome = pipeline
            .run_for_source(&JobHandle::from("job-1"), 1, "doc.pdf", 2, &ManualAbort::new())
            .await
            .unwrap();

        let stats = outcome.stats();
        assert!(!outcome.is_aborted());
        assert_eq!(stats.units_total, 3);
        assert_eq!(stats.units_skipped, 1);
        assert_eq!(stats.units_failed, 1);
        assert_eq!(stats.pairs_persisted, 1);
        assert_eq!(store.pairs_for(1).len(), 1);
        assert!(store.metadata_for(1).is_none(), "metadata must be cleared");
    }

    #[tokio::test]
    async fn test_abort_before_warm_up() {
        let store = Arc::new(MemoryRecordStore::new());
        let source = MemoryChunkSource::new();
        source.insert(1, vec![chunk(long_text("content "), 0)]);
        let pipeline = pipeline(&store, source, vec![]);

        let abort = ManualAbort::new();
        abort.trigger();
        let outcome = pipeline
            .run_for_source(&JobHandle::from("job-2"), 1, "doc.pdf", 2, &abort)
            .await
            .unwrap();

        assert!(outcome.is_aborted());
        assert_eq!(outcome.stats().pairs_persisted, 0);
        assert!(store.pairs_for(1).is_empty());
        assert!(store.metadata_for(1).is_none());
    }

    #[tokio::test]
    async fn test_abort_mid_generation_discards_pairs() {
        let store = Arc::new(MemoryRecordStore::new());
        let source = MemoryChunkSource::new();
        source.insert(1, vec![chunk(long_text("content "), 0)]);

        let pair = r#"{"user_message": "q", "assistant_message": "a"}"#;
        let pipeline = pipeline(&store, source, vec!["READY", "YES", pair, pair, pair]);

        // polls: pre-warm-up, post-warm-up, between-units, then the first
        // generation iteration observes the abort
        let abort = CountdownAbort::after(4);
        let outcome = pipeline
            .run_for_source(&JobHandle::from("job-3"), 1, "doc.pdf", 3, &abort)
            .await
            .unwrap();

        assert!(outcome.is_aborted());
        assert!(store.pairs_for(1).is_empty(), "nothing may be persisted");
        assert!(store.metadata_for(1).is_none());
    }

    #[tokio::test]
    async fn test_pairs_persisted_before_abort_remain() {
        let store = Arc::new(MemoryRecordStore::new());
        let source = MemoryChunkSource::new();
        source.insert(
            1,
            vec![
                chunk(long_text("first unit "), 0),
                chunk(long_text("second unit "), 1),
            ],
        );

        let pair = r#"{"user_message": "q", "assistant_message": "a"}"#;
        let pipeline = pipeline(&store, source, vec!["READY", "YES", pair]);

        // polls: two warm-up checkpoints, three checkpoints while unit one
        // runs to persistence, then unit two's first checkpoint aborts
        let abort = CountdownAbort::after(6);
        let outcome = pipeline
            .run_for_source(&JobHandle::from("job-7"), 1, "doc.pdf", 1, &abort)
            .await
            .unwrap();

        assert!(outcome.is_aborted());
        assert_eq!(outcome.stats().pairs_persisted, 1);
        assert_eq!(store.pairs_for(1).len(), 1, "the persisted pair stays");
        assert!(store.metadata_for(1).is_none());
    }

    #[tokio::test]
    async fn test_warm_up_failure_fails_job_and_clears_metadata() {
        let store = Arc::new(MemoryRecordStore::new());
        let source = MemoryChunkSource::new();
        source.insert(1, vec![chunk(long_text("content "), 0)]);
        let pipeline = GenerationPipeline::new(
            CallbackClient::new(store.clone()),
            Arc::new(source),
            SyntheticGenerator::new(Arc::new(UnreachableProvider), 0.7, 2048),
        );

        let result = pipeline
            .run_for_source(&JobHandle::from("job-4"), 1, "doc.pdf", 2, &ManualAbort::new())
            .await;

        assert!(matches!(result, Err(GenerationError::ModelUnavailable(_))));
        assert!(store.metadata_for(1).is_none());
    }

    #[tokio::test]
    async fn test_run_for_documents_walks_each_file() {
        let store = Arc::new(MemoryRecordStore::new());
        let source = MemoryChunkSource::new();
        source.insert(
            1,
            vec![
                DocumentChunk {
                    text: long_text("first doc "),
                    source: "a.pdf".to_string(),
                    page: 0,
                },
                DocumentChunk {
                    text: long_text("second doc "),
                    source: "b.pdf".to_string(),
                    page: 0,
                },
            ],
        );

        let p1 = r#"{"user_message": "qa", "assistant_message": "aa"}"#;
        let p2 = r#"{"user_message": "qb", "assistant_message": "ab"}"#;
        let pipeline = pipeline(&store, source, vec!["READY", "YES", p1, "YES", p2]);

        let names = vec!["a.pdf".to_string(), "b.pdf".to_string()];
        let outcome = pipeline
            .run_for_documents(&JobHandle::from("job-5"), 1, &names, 1, &ManualAbort::new())
            .await
            .unwrap();

        assert_eq!(outcome.stats().units_total, 2);
        assert_eq!(outcome.stats().pairs_persisted, 2);
        assert_eq!(store.pairs_for(1).len(), 2);
    }

    #[tokio::test]
    async fn test_empty_dataset_completes_cleanly() {
        let store = Arc::new(MemoryRecordStore::new());
        let pipeline = pipeline(&store, MemoryChunkSource::new(), vec!["READY"]);

        let outcome = pipeline
            .run_for_source(&JobHandle::from("job-6"), 9, "doc.pdf", 2, &ManualAbort::new())
            .await
            .unwrap();

        assert!(!outcome.is_aborted());
        assert_eq!(outcome.stats().units_total, 0);
        assert!(store.metadata_for(9).is_none());
    }
}
