//! Wires configuration into a running search engine
//!
//! Startup order: schema, index, persistent store (documents restored from
//! it), configured documents file, strategy registration with one probe each,
//! then initial strategy selection.

use crate::config::{Config, AUTO_STRATEGY};
use crate::embedding::{
    BackfillReport, Backfiller, CacheStats, EmbeddingCache, EmbeddingError, EmbeddingProvider,
    EmbeddingSchema,
};
use crate::error::{FretError, Result};
use crate::index::{load_documents, VectorIndex, VoicingDocument};
use crate::retrieval::{
    ContextMatch, EnhancedSearchService, PresetRegistry, VoicingContextRetriever,
    WeightedRetrievalService,
};
use crate::storage::SqliteVectorStore;
use crate::strategy::{
    GpuStrategy, InMemoryStrategy, PersistentStoreStrategy, StrategyDescriptor, StrategyManager,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Snapshot of engine state for status output
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub documents: usize,
    pub embedded: usize,
    pub current_strategy: StrategyDescriptor,
    pub presets: Vec<String>,
    pub cache: CacheStats,
    pub embedding_model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub added: usize,
    /// Documents dropped because their embedding had the wrong length
    pub rejected: usize,
    pub backfill: Option<BackfillReport>,
}

pub struct SearchEngine {
    config: Config,
    index: Arc<VectorIndex>,
    cache: Arc<EmbeddingCache>,
    store: Option<Arc<SqliteVectorStore>>,
    manager: Arc<StrategyManager>,
    search: Arc<EnhancedSearchService>,
    weighted: Arc<WeightedRetrievalService>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
}

impl SearchEngine {
    /// Build every component described by `config`
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let schema = Arc::new(config.build_schema()?);
        let index = Arc::new(VectorIndex::new(schema.clone()));
        let presets = Arc::new(PresetRegistry::with_builtins(&schema, config.presets.clone())?);

        let store = if config.search.enable_persistent_store {
            let store = SqliteVectorStore::open(&config.database_path())?;
            let restored = store.load_all()?;
            info!("Restored {} documents from {:?}", restored.len(), store.path());
            add_checked(&index, &schema, restored)?;
            Some(Arc::new(store))
        } else {
            None
        };

        if let Some(path) = config.documents_path() {
            let documents = load_documents(&path)?;
            info!("Loaded {} documents from {:?}", documents.len(), path);
            add_checked(&index, &schema, documents)?;
            if let Some(store) = &store {
                let mirrored = mirror_index(store, &index)?;
                debug!("Mirrored {} documents to {:?}", mirrored, store.path());
            }
        }

        let in_memory = Arc::new(InMemoryStrategy::new(index.clone()));
        let manager = Arc::new(StrategyManager::new(schema.clone(), in_memory));

        if config.search.enable_gpu {
            let gpu = Arc::new(GpuStrategy::new(index.clone(), config.search.gpu_device));
            let _ = manager.register(gpu).await;
        }
        if let Some(store) = &store {
            let strategy = Arc::new(PersistentStoreStrategy::new(store.clone(), schema.clone()));
            let _ = manager.register(strategy).await;
        }

        select_initial(&manager, &config.search.default_strategy);

        let search = Arc::new(EnhancedSearchService::new(manager.clone()));
        let weighted = Arc::new(WeightedRetrievalService::new(index.clone(), presets));

        info!(
            "Search engine ready: {} documents ({} embedded), strategy {}",
            index.len(),
            index.embedded_count(),
            manager.current_strategy_info().name
        );

        Ok(Self {
            config,
            index,
            cache: Arc::new(EmbeddingCache::new()),
            store,
            manager,
            search,
            weighted,
            provider: None,
        })
    }

    /// Attach the text embedding collaborator used by ingestion and lookup
    pub fn with_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Add documents, mirror them to the store and backfill embeddings
    pub async fn ingest(&self, documents: Vec<VoicingDocument>) -> Result<IngestReport> {
        let total = documents.len();
        let added = add_checked(&self.index, self.index.schema(), documents)?;
        let mut report = IngestReport {
            added,
            rejected: total - added,
            backfill: None,
        };

        report.backfill = self.backfill().await?;
        if report.backfill.is_none() {
            if let Some(store) = &self.store {
                mirror_index(store, &self.index)?;
            }
        }
        Ok(report)
    }

    /// Embed documents that lack a current embedding and mirror the index to
    /// the store; `None` when no provider is attached
    pub async fn backfill(&self) -> Result<Option<BackfillReport>> {
        match self.backfiller() {
            Some(backfiller) => Ok(Some(
                backfiller.backfill(&self.index, self.store.clone()).await?,
            )),
            None => Ok(None),
        }
    }

    /// Load a JSON documents file and ingest it
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport> {
        self.ingest(load_documents(path)?).await
    }

    /// Remove a document together with its cache entry and stored copy
    pub fn purge(&self, id: &str) -> Result<bool> {
        let removed = self.index.remove(id).is_some();
        self.cache.invalidate(id);
        let stored = match &self.store {
            Some(store) => store.remove(id)?,
            None => false,
        };
        Ok(removed || stored)
    }

    /// Resolve a text query to voicings
    pub async fn retrieve_context(
        &self,
        text: &str,
        preset: Option<&str>,
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<ContextMatch> {
        let provider = self.provider.clone().ok_or_else(|| {
            FretError::Embedding(EmbeddingError::InitializationError(
                "no embedding provider configured".to_string(),
            ))
        })?;
        VoicingContextRetriever::new(
            self.index.clone(),
            provider,
            self.search.clone(),
            self.weighted.clone(),
        )
        .retrieve(text, preset, top_k, cancel)
        .await
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            documents: self.index.len(),
            embedded: self.index.embedded_count(),
            current_strategy: self.manager.current_strategy_info(),
            presets: self.weighted.presets(),
            cache: self.cache.stats(),
            embedding_model: self.provider.as_ref().map(|p| p.model_name().to_string()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn schema(&self) -> &Arc<EmbeddingSchema> {
        self.index.schema()
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn manager(&self) -> &Arc<StrategyManager> {
        &self.manager
    }

    pub fn search(&self) -> &Arc<EnhancedSearchService> {
        &self.search
    }

    pub fn weighted(&self) -> &Arc<WeightedRetrievalService> {
        &self.weighted
    }

    pub fn store(&self) -> Option<&Arc<SqliteVectorStore>> {
        self.store.as_ref()
    }

    fn backfiller(&self) -> Option<Backfiller> {
        self.provider.as_ref().map(|provider| {
            Backfiller::new(
                provider.clone(),
                self.cache.clone(),
                self.config.embedding.batch_size,
                self.config.embedding.max_concurrency,
            )
        })
    }
}

/// Add documents, dropping any whose embedding does not fit the schema
fn add_checked(
    index: &VectorIndex,
    schema: &EmbeddingSchema,
    documents: Vec<VoicingDocument>,
) -> Result<usize> {
    let (valid, invalid): (Vec<_>, Vec<_>) = documents.into_iter().partition(|d| {
        d.embedding
            .as_deref()
            .map_or(true, |e| schema.validate_vector(e).is_ok())
    });
    for document in &invalid {
        warn!(
            "Skipping document {}: embedding length does not match dimension {}",
            document.id,
            schema.total_dimension()
        );
    }
    let added = valid.len();
    index.add_range(valid)?;
    Ok(added)
}

/// Write the full index contents to the store
fn mirror_index(store: &SqliteVectorStore, index: &VectorIndex) -> Result<usize> {
    let documents: Vec<VoicingDocument> =
        index.snapshot().iter().map(|d| d.as_ref().clone()).collect();
    Ok(store.upsert_many(&documents)?)
}

/// Apply `search.default_strategy`; an unusable choice falls back to auto-selection
fn select_initial(manager: &StrategyManager, default_strategy: &str) {
    if default_strategy != AUTO_STRATEGY {
        match manager.switch_strategy(default_strategy) {
            Ok(_) => return,
            Err(e) => warn!(
                "Configured strategy {} is not usable ({}); auto-selecting",
                default_strategy, e
            ),
        }
    }
    manager.auto_select_best_strategy();
}
