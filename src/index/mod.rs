use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::collector::FileMeta;
use crate::protocol::TranscriptResult;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("index writer must be initialized first")]
    NotInitialized,

    #[error("could not connect to the search index: {0}")]
    Connect(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("unexpected response from the search index ({status}): {body}")]
    Response { status: u16, body: String },
}

/// Writes completed transcripts to a search index and answers whether a
/// file has already been indexed.
#[async_trait]
pub trait FileIndexer: Send + Sync {
    /// Prepare the index for writing. Must be called before any other
    /// operation.
    async fn init(&self) -> Result<(), IndexerError>;

    /// Whether the file still needs indexing (i.e. no document with its
    /// key exists yet).
    async fn should_index(&self, file: &FileMeta) -> Result<bool, IndexerError>;

    /// Write the final document for a transcribed file.
    async fn index_file(
        &self,
        file: &FileMeta,
        result: &TranscriptResult,
    ) -> Result<(), IndexerError>;
}

/// Deterministic per-file identifier used for existence checks.
///
/// Re-indexing writes a new document under a fresh id, so lookups go
/// through this key rather than the document id.
pub fn document_key(file: &FileMeta) -> String {
    file.relative_path.clone()
}

fn prepare_document(file: &FileMeta, result: &TranscriptResult) -> Value {
    json!({
        "path_key": document_key(file),
        "filepath": file.relative_path,
        "filesize": file.size,
        "filemtime": file.mtime.timestamp(),
        "transcript": result.segments,
        "text": result.plain_text(),
        "worker_id": result.worker_id,
        "transcribed_at": result.datetime.to_rfc3339(),
    })
}

/// Elasticsearch-backed index writer.
pub struct ElasticsearchIndexer {
    client: reqwest::Client,
    base_url: String,
    index: String,
    skip_mapping_update: bool,
    initialized: AtomicBool,
}

impl ElasticsearchIndexer {
    pub fn new(base_url: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            index: index.into(),
            skip_mapping_update: false,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_skip_mapping_update(mut self, skip: bool) -> Self {
        self.skip_mapping_update = skip;
        self
    }

    fn assert_init(&self) -> Result<(), IndexerError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(IndexerError::NotInitialized)
        }
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.base_url, self.index)
    }

    async fn init_index(&self) -> Result<(), IndexerError> {
        let response = self
            .client
            .head(self.index_url())
            .send()
            .await
            .map_err(|e| IndexerError::Connect(e.to_string()))?;

        if response.status().is_success() {
            info!(
                "Connection successful. Found index {} in Elasticsearch.",
                self.index
            );
            return Ok(());
        }
        if response.status().as_u16() != 404 {
            return Err(response_error(response).await);
        }

        info!(
            "Connection successful. Creating index {} in Elasticsearch.",
            self.index
        );
        let response = self.client.put(self.index_url()).send().await?;
        if !response.status().is_success() {
            return Err(response_error(response).await);
        }
        Ok(())
    }

    async fn init_mapping(&self) -> Result<(), IndexerError> {
        let mapping = json!({
            "properties": {
                "path_key": { "type": "keyword" },
                "filepath": { "type": "text" },
                "filesize": { "type": "long" },
                "filemtime": {
                    "type": "date",
                    "format": "strict_date_optional_time||epoch_second"
                },
                "transcript": {
                    "type": "nested",
                    "properties": {
                        "text": { "type": "text" },
                        "result": {
                            "type": "nested",
                            "properties": {
                                "conf": { "type": "float" },
                                "start": { "type": "float" },
                                "end": { "type": "float" },
                                "word": { "type": "text" },
                            }
                        }
                    }
                },
                "text": { "type": "text" },
                "worker_id": { "type": "keyword" },
                "transcribed_at": { "type": "date" },
            }
        });

        let response = self
            .client
            .put(format!("{}/_mapping", self.index_url()))
            .json(&mapping)
            .send()
            .await?;
        if !response.status().is_success() {
            error!("Could not set/update mapping in Elasticsearch!");
            return Err(response_error(response).await);
        }
        Ok(())
    }
}

async fn response_error(response: reqwest::Response) -> IndexerError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    IndexerError::Response { status, body }
}

#[async_trait]
impl FileIndexer for ElasticsearchIndexer {
    async fn init(&self) -> Result<(), IndexerError> {
        self.init_index().await?;
        if !self.skip_mapping_update {
            self.init_mapping().await?;
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn should_index(&self, file: &FileMeta) -> Result<bool, IndexerError> {
        self.assert_init()?;

        let query = json!({
            "query": { "term": { "path_key": document_key(file) } }
        });
        let response = self
            .client
            .post(format!("{}/_count", self.index_url()))
            .json(&query)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(response_error(response).await);
        }
        let body: Value = response.json().await?;
        Ok(body["count"].as_u64().unwrap_or(0) == 0)
    }

    async fn index_file(
        &self,
        file: &FileMeta,
        result: &TranscriptResult,
    ) -> Result<(), IndexerError> {
        self.assert_init()?;

        let document = prepare_document(file, result);
        info!(
            "Indexing file {} to {} ({} segment(s))",
            file.relative_path,
            self.index,
            result.segments.len()
        );

        // A fresh document id per write; re-indexing the same file
        // produces a new document rather than overwriting
        let doc_id = Uuid::new_v4();
        let response = self
            .client
            .put(format!("{}/_doc/{}", self.index_url(), doc_id))
            .json(&document)
            .send()
            .await?;
        if !response.status().is_success() {
            error!("Failed indexing file {}", file.relative_path);
            return Err(response_error(response).await);
        }
        debug!("File {} indexed successfully.", file.relative_path);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryIndexState {
    existing: HashSet<String>,
    documents: Vec<Value>,
}

/// In-memory index writer used by tests and local dry runs.
#[derive(Default)]
pub struct MemoryIndexer {
    state: Mutex<MemoryIndexState>,
}

impl MemoryIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// An indexer that already contains documents for the given keys.
    pub fn with_existing<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(MemoryIndexState {
                existing: keys.into_iter().map(Into::into).collect(),
                documents: Vec::new(),
            }),
        }
    }

    pub async fn document_count(&self) -> usize {
        self.state.lock().await.documents.len()
    }

    pub async fn documents(&self) -> Vec<Value> {
        self.state.lock().await.documents.clone()
    }
}

#[async_trait]
impl FileIndexer for MemoryIndexer {
    async fn init(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    async fn should_index(&self, file: &FileMeta) -> Result<bool, IndexerError> {
        let state = self.state.lock().await;
        Ok(!state.existing.contains(&document_key(file)))
    }

    async fn index_file(
        &self,
        file: &FileMeta,
        result: &TranscriptResult,
    ) -> Result<(), IndexerError> {
        let mut state = self.state.lock().await;
        state.existing.insert(document_key(file));
        state.documents.push(prepare_document(file, result));
        Ok(())
    }
}
