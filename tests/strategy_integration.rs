use candle_core::Device;
use fretsearch::embedding::{EmbeddingSchema, Segment};
use fretsearch::index::{VectorIndex, VoicingDocument};
use fretsearch::storage::SqliteVectorStore;
use fretsearch::strategy::{
    GpuStrategy, InMemoryStrategy, PersistentStoreStrategy, SearchError, SearchStrategy,
    StrategyManager, GPU, IN_MEMORY, PERSISTENT_STORE,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const DIM: usize = 8;

fn schema() -> Arc<EmbeddingSchema> {
    Arc::new(
        EmbeddingSchema::new(
            DIM,
            vec![
                Segment::unused("identity", 0, 2),
                Segment::new("structure", 2, 3),
                Segment::new("context", 5, 3),
            ],
        )
        .unwrap(),
    )
}

/// Deterministic pseudo-random vector for document `seed`
fn vector(seed: usize) -> Vec<f32> {
    (0..DIM)
        .map(|i| (((seed * 31 + i * 17) % 23) as f32 - 11.0) / 7.0)
        .collect()
}

fn corpus() -> Vec<VoicingDocument> {
    (0..40)
        .map(|i| {
            VoicingDocument::new(format!("v{:03}", i), format!("Chord{}", i), (i % 12) as u8)
                .with_embedding(vector(i))
        })
        .collect()
}

fn host_gpu(index: Arc<VectorIndex>) -> GpuStrategy {
    GpuStrategy::with_probe(index, Arc::new(|| -> candle_core::Result<Device> { Ok(Device::Cpu) }))
}

struct Fixture {
    _dir: TempDir,
    schema: Arc<EmbeddingSchema>,
    index: Arc<VectorIndex>,
    store: Arc<SqliteVectorStore>,
}

fn fixture(documents: Vec<VoicingDocument>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let schema = schema();
    let index = Arc::new(VectorIndex::new(schema.clone()));
    index.add_range(documents.clone()).unwrap();

    let store = Arc::new(SqliteVectorStore::open(&dir.path().join("voicings.sqlite")).unwrap());
    store.upsert_many(&documents).unwrap();

    Fixture {
        _dir: dir,
        schema,
        index,
        store,
    }
}

#[tokio::test]
async fn test_strategies_agree_on_ranking() {
    let fx = fixture(corpus());
    let cancel = CancellationToken::new();

    let strategies: Vec<Arc<dyn SearchStrategy>> = vec![
        Arc::new(InMemoryStrategy::new(fx.index.clone())),
        Arc::new(host_gpu(fx.index.clone())),
        Arc::new(PersistentStoreStrategy::new(fx.store.clone(), fx.schema.clone())),
    ];
    for strategy in &strategies {
        strategy.probe().await.unwrap();
    }

    for seed in [3usize, 17, 101] {
        let query = vector(seed);
        let mut rankings = Vec::new();
        for strategy in &strategies {
            let results = strategy.search(&query, 5, &cancel).await.unwrap();
            assert_eq!(results.len(), 5, "{}", strategy.name());
            assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
            rankings.push(results);
        }

        let reference = &rankings[0];
        for other in &rankings[1..] {
            assert_eq!(other[0].id(), reference[0].id());
            assert!((other[0].score - reference[0].score).abs() < 1e-6);
        }
    }
}

#[tokio::test]
async fn test_nearest_voicing_scenario() {
    let e1 = vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
    let e2 = vec![0.0, 0.0, 1.0, 0.2, 0.0, 0.8, 0.1, 0.0];
    let e3 = vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
    let fx = fixture(vec![
        VoicingDocument::new("cmaj7", "Cmaj7", 0).with_embedding(e1.clone()),
        VoicingDocument::new("cmin7", "Cmin7", 0).with_embedding(e2),
        VoicingDocument::new("g7", "G7", 7).with_embedding(e3),
    ]);

    let manager = StrategyManager::new(
        fx.schema.clone(),
        Arc::new(InMemoryStrategy::new(fx.index.clone())),
    );
    manager
        .register(Arc::new(PersistentStoreStrategy::new(
            fx.store.clone(),
            fx.schema.clone(),
        )))
        .await
        .unwrap();

    for name in [IN_MEMORY, PERSISTENT_STORE] {
        manager.switch_strategy(name).unwrap();
        let results = manager
            .current_handle()
            .search(&e1, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].document.chord_name, "Cmaj7");
        assert!((results[0].score - 1.0).abs() < 1e-4);
        assert_eq!(results[1].document.chord_name, "Cmin7");
    }
}

#[tokio::test]
async fn test_manager_over_real_strategies() {
    let fx = fixture(corpus());
    let manager = StrategyManager::new(
        fx.schema.clone(),
        Arc::new(InMemoryStrategy::new(fx.index.clone())),
    );

    // CUDA ordinal that cannot exist on a test host
    manager
        .register(Arc::new(GpuStrategy::with_probe(
            fx.index.clone(),
            Arc::new(|| Device::new_cuda(usize::MAX)),
        )))
        .await
        .unwrap_err();
    manager
        .register(Arc::new(PersistentStoreStrategy::new(
            fx.store.clone(),
            fx.schema.clone(),
        )))
        .await
        .unwrap();

    assert!(matches!(
        manager.switch_strategy(GPU),
        Err(SearchError::Unavailable(_))
    ));
    assert_eq!(manager.current_strategy_info().name, IN_MEMORY);

    let selection = manager.auto_select_best_strategy();
    assert_eq!(selection.strategy.name, IN_MEMORY);

    let report = manager
        .benchmark_strategies(10, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.results.len(), 2);
    assert!(report.results.contains_key(PERSISTENT_STORE));
    assert!(report.results.values().all(|entry| entry.average_ms >= 0.0));
    assert_eq!(manager.current_strategy_info().name, IN_MEMORY);
}
