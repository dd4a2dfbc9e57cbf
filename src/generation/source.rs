//! Document chunk retrieval for generation jobs.
//!
//! Chunks live in the per-project embedding store and are served by the
//! record store API, paginated and sorted by page. The [`ChunkSource`]
//! trait hides the transport so the pipeline can run against an in-memory
//! fixture in tests.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::store::StoreError;
use crate::task::DatasetId;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One embedded document chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChunk {
    /// Chunk text as stored in the embedding collection.
    pub text: String,
    /// Source document filename.
    pub source: String,
    /// Zero-based page the chunk was extracted from.
    pub page: u32,
}

/// Read access to a dataset's document chunks.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Number of chunks embedded for the dataset.
    async fn count(&self, dataset_id: DatasetId) -> Result<usize, StoreError>;

    /// One page of chunks, sorted by page number, optionally restricted to
    /// a single source document. Pages are one-based.
    async fn fetch(
        &self,
        dataset_id: DatasetId,
        page: usize,
        page_size: usize,
        source: Option<&str>,
    ) -> Result<Vec<DocumentChunk>, StoreError>;
}

/// Convenience: all chunks for a dataset or one source document.
pub async fn fetch_all(
    source: &dyn ChunkSource,
    dataset_id: DatasetId,
    source_filename: Option<&str>,
) -> Result<Vec<DocumentChunk>, StoreError> {
    let total = source.count(dataset_id).await?;
    if total == 0 {
        return Ok(Vec::new());
    }
    source.fetch(dataset_id, 1, total, source_filename).await
}

/// HTTP chunk source backed by the record store API.
pub struct HttpChunkSource {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChunkEnvelope {
    status: bool,
    #[serde(default)]
    data: Option<ChunkPayload>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    num_embeddings: usize,
    #[serde(default)]
    doc_chunks: Vec<WireChunk>,
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    chunk: String,
    source: String,
    page: u32,
}

impl HttpChunkSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_data(
        &self,
        dataset_id: DatasetId,
        page: usize,
        page_size: usize,
        source: Option<&str>,
    ) -> Result<ChunkPayload, StoreError> {
        let url = format!("{}/v1/datasets/{}/data", self.base_url, dataset_id);
        let mut query: Vec<(&str, String)> = vec![
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
        ];
        if let Some(source) = source {
            query.push(("source", source.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| StoreError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let envelope: ChunkEnvelope = response
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;

        if !envelope.status {
            return Err(StoreError::Api {
                code: status.as_u16(),
                message: envelope.message,
            });
        }

        Ok(envelope.data.unwrap_or(ChunkPayload {
            num_embeddings: 0,
            doc_chunks: Vec::new(),
        }))
    }
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn count(&self, dataset_id: DatasetId) -> Result<usize, StoreError> {
        // page_size 1 keeps the count probe cheap
        let payload = self.get_data(dataset_id, 1, 1, None).await?;
        Ok(payload.num_embeddings)
    }

    async fn fetch(
        &self,
        dataset_id: DatasetId,
        page: usize,
        page_size: usize,
        source: Option<&str>,
    ) -> Result<Vec<DocumentChunk>, StoreError> {
        let payload = self.get_data(dataset_id, page, page_size, source).await?;
        Ok(payload
            .doc_chunks
            .into_iter()
            .map(|c| DocumentChunk {
                text: c.chunk,
                source: c.source,
                page: c.page,
            })
            .collect())
    }
}

/// In-memory chunk source for tests.
#[derive(Default)]
pub struct MemoryChunkSource {
    chunks: Mutex<HashMap<DatasetId, Vec<DocumentChunk>>>,
}

impl MemoryChunkSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dataset_id: DatasetId, chunks: Vec<DocumentChunk>) {
        self.lock().insert(dataset_id, chunks);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DatasetId, Vec<DocumentChunk>>> {
        match self.chunks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ChunkSource for MemoryChunkSource {
    async fn count(&self, dataset_id: DatasetId) -> Result<usize, StoreError> {
        Ok(self.lock().get(&dataset_id).map_or(0, Vec::len))
    }

    async fn fetch(
        &self,
        dataset_id: DatasetId,
        page: usize,
        page_size: usize,
        source: Option<&str>,
    ) -> Result<Vec<DocumentChunk>, StoreError> {
        let mut chunks: Vec<DocumentChunk> = self
            .lock()
            .get(&dataset_id)
            .map(|all| {
                all.iter()
                    .filter(|c| source.map_or(true, |s| c.source == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.page);

        let start = (page.saturating_sub(1)) * page_size;
        Ok(chunks.into_iter().skip(start).take(page_size).collect())
    }
}
