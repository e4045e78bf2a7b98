/// Embedding provider trait, FastEmbed implementation and concurrency limiter
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Embedding generation failed: {0}")]
    GenerationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Text-to-vector collaborator
///
/// Implementations may call a local model or a remote inference service.
/// Batch output must preserve input order.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embedding for a single text
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Generate embeddings for multiple texts, one vector per input in input order
    async fn generate_batch_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// FastEmbed provider for local embedding generation
///
/// Uses all-MiniLM-L6-v2 model (384 dimensions) by default.
pub struct FastEmbedProvider {
    model: Arc<TextEmbedding>,
    model_name: String,
    dimension: usize,
}

impl FastEmbedProvider {
    /// Create a new FastEmbed provider with the specified model
    ///
    /// Models are downloaded on-demand to `~/.cache/huggingface/` on first use.
    pub fn new(model_name: &str) -> Result<Self, EmbeddingError> {
        let (embedding_model, dimension) = match model_name {
            "all-MiniLM-L6-v2" | "all-minilm-l6-v2" => (EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
            _ => {
                return Err(EmbeddingError::InitializationError(format!(
                    "Unsupported model: {}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5",
                    model_name
                )));
            }
        };

        tracing::info!("Initializing embedding model: {} ({}D)", model_name, dimension);

        let init_options = InitOptions::new(embedding_model).with_show_download_progress(true);
        let model = TextEmbedding::try_new(init_options)
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: model_name.to_string(),
            dimension,
        })
    }

    fn embed_blocking(
        model: &TextEmbedding,
        texts: Vec<String>,
        dimension: usize,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let embeddings = model
            .embed(texts, None)
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;

        for embedding in &embeddings {
            if embedding.len() != dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: dimension,
                    actual: embedding.len(),
                });
            }
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
        }

        let mut embeddings = self.generate_batch_embeddings(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::GenerationError("No embeddings generated".to_string()))
    }

    async fn generate_batch_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        // Dropping empty inputs would shift the output order
        if texts.iter().any(|t| t.is_empty()) {
            return Err(EmbeddingError::InvalidInput(
                "Batch contains empty text".to_string(),
            ));
        }

        let model = self.model.clone();
        let texts = texts.to_vec();
        let dimension = self.dimension;
        tokio::task::spawn_blocking(move || Self::embed_blocking(&model, texts, dimension))
            .await
            .map_err(|e| EmbeddingError::GenerationError(format!("Embedding task failed: {}", e)))?
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Bounds in-flight calls to an inner provider and checks output dimensions
pub struct RateLimitedProvider {
    inner: Arc<dyn EmbeddingProvider>,
    permits: Arc<Semaphore>,
    expected_dimension: usize,
}

impl RateLimitedProvider {
    pub fn new(
        inner: Arc<dyn EmbeddingProvider>,
        max_concurrency: usize,
        expected_dimension: usize,
    ) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            expected_dimension,
        }
    }

    fn check(&self, vector: &[f32]) -> Result<(), EmbeddingError> {
        if vector.len() != self.expected_dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.expected_dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>, EmbeddingError> {
        self.permits
            .acquire()
            .await
            .map_err(|e| EmbeddingError::GenerationError(e.to_string()))
    }
}

#[async_trait]
impl EmbeddingProvider for RateLimitedProvider {
    async fn generate_embedding(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let _permit = self.acquire().await?;
        let vector = self.inner.generate_embedding(text).await?;
        self.check(&vector)?;
        Ok(vector)
    }

    async fn generate_batch_embeddings(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let _permit = self.acquire().await?;
        let vectors = self.inner.generate_batch_embeddings(texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::GenerationError(format!(
                "Embedding count mismatch: expected {}, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        for vector in &vectors {
            self.check(vector)?;
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.expected_dimension
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}
