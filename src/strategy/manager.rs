//! Strategy registry, current-strategy selection and benchmarking
//!
//! The current strategy is an `Arc` handle behind a lock that is held only
//! long enough to clone or replace the handle. A search reads the handle once
//! and keeps using it even if another task switches strategies mid-flight.

use super::{Capability, ProbeError, SearchError, SearchStrategy};
use crate::embedding::EmbeddingSchema;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const IN_MEMORY: &str = "InMemory";
pub const GPU: &str = "GPU";
pub const PERSISTENT_STORE: &str = "PersistentStore";

/// Auto-selection preference, best first
const PREFERENCE: &[(&str, &str)] = &[
    (
        GPU,
        "GPU acceleration available; batched kernels give the lowest query latency",
    ),
    (
        IN_MEMORY,
        "No accelerator available; exact in-memory scan is the dependable default",
    ),
    (
        PERSISTENT_STORE,
        "Only the persistent store is available; similarity is delegated to the database",
    ),
];

/// Results returned per benchmark query
const BENCHMARK_TOP_K: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDescriptor {
    pub name: String,
    pub is_available: bool,
    pub performance_characteristics: String,
}

impl StrategyDescriptor {
    fn of(strategy: &dyn SearchStrategy) -> Self {
        Self {
            name: strategy.name().to_string(),
            is_available: strategy.is_available(),
            performance_characteristics: strategy.performance_characteristics().to_string(),
        }
    }
}

/// Historical counters for one strategy
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyStats {
    pub searches: u64,
    pub failures: u64,
    /// Searches on this strategy that were retried on the fallback
    pub fallbacks: u64,
    pub total_latency_ms: f64,
    pub last_latency_ms: Option<f64>,
    pub last_used: Option<DateTime<Utc>>,
}

impl StrategyStats {
    pub fn average_latency_ms(&self) -> f64 {
        if self.searches == 0 {
            0.0
        } else {
            self.total_latency_ms / self.searches as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkEntry {
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Iterations that returned an error
    pub failures: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub iterations: usize,
    pub results: BTreeMap<String, BenchmarkEntry>,
    pub fastest: Option<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoSelection {
    pub strategy: StrategyDescriptor,
    pub reason: String,
}

/// Human guidance for an average latency
pub fn recommendation(average_ms: f64) -> &'static str {
    if average_ms < 5.0 {
        "excellent, real-time"
    } else if average_ms < 20.0 {
        "good, interactive"
    } else if average_ms < 50.0 {
        "acceptable"
    } else {
        "consider optimization/hardware upgrade"
    }
}

/// Releases the benchmark flag when dropped
struct BenchmarkGuard<'a>(&'a AtomicBool);

impl<'a> BenchmarkGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SearchError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SearchError::Busy)?;
        Ok(Self(flag))
    }
}

impl Drop for BenchmarkGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct StrategyManager {
    schema: Arc<EmbeddingSchema>,
    strategies: RwLock<BTreeMap<String, Arc<dyn SearchStrategy>>>,
    in_memory: Arc<dyn SearchStrategy>,
    current: RwLock<Arc<dyn SearchStrategy>>,
    stats: Mutex<AHashMap<String, StrategyStats>>,
    benchmarking: AtomicBool,
}

impl StrategyManager {
    /// Create a manager whose initial current strategy is `in_memory`
    pub fn new(schema: Arc<EmbeddingSchema>, in_memory: Arc<dyn SearchStrategy>) -> Self {
        let mut strategies: BTreeMap<String, Arc<dyn SearchStrategy>> = BTreeMap::new();
        strategies.insert(in_memory.name().to_string(), in_memory.clone());

        Self {
            schema,
            strategies: RwLock::new(strategies),
            current: RwLock::new(in_memory.clone()),
            in_memory,
            stats: Mutex::new(AHashMap::new()),
            benchmarking: AtomicBool::new(false),
        }
    }

    /// Probe `strategy` once and add it to the registry
    ///
    /// A strategy whose probe fails is still registered and reported as
    /// unavailable; switching to it is refused.
    pub async fn register(
        &self,
        strategy: Arc<dyn SearchStrategy>,
    ) -> Result<Capability, ProbeError> {
        let probed = strategy.probe().await;
        match &probed {
            Ok(capability) => info!(
                "Registered strategy {} ({}: {})",
                strategy.name(),
                capability.backend,
                capability.detail
            ),
            Err(e) => warn!("Registered strategy {} as unavailable: {}", strategy.name(), e),
        }

        self.strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(strategy.name().to_string(), strategy);
        probed
    }

    /// Handle to the current strategy; stable for the caller even across switches
    pub fn current_handle(&self) -> Arc<dyn SearchStrategy> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The always-available in-memory strategy
    pub fn fallback(&self) -> Arc<dyn SearchStrategy> {
        self.in_memory.clone()
    }

    pub fn schema(&self) -> &Arc<EmbeddingSchema> {
        &self.schema
    }

    pub fn current_strategy_info(&self) -> StrategyDescriptor {
        StrategyDescriptor::of(self.current_handle().as_ref())
    }

    pub fn available_strategies(&self) -> BTreeMap<String, StrategyDescriptor> {
        self.registered()
            .into_iter()
            .map(|(name, strategy)| (name, StrategyDescriptor::of(strategy.as_ref())))
            .collect()
    }

    pub fn switch_strategy(&self, name: &str) -> Result<StrategyDescriptor, SearchError> {
        let strategy = self
            .strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| SearchError::NotFound(format!("strategy {}", name)))?;

        if !strategy.is_available() {
            return Err(SearchError::Unavailable(name.to_string()));
        }

        let descriptor = StrategyDescriptor::of(strategy.as_ref());
        let previous = std::mem::replace(
            &mut *self.current.write().unwrap_or_else(PoisonError::into_inner),
            strategy,
        );
        info!("Switched search strategy: {} -> {}", previous.name(), name);
        Ok(descriptor)
    }

    /// Pick the best available strategy by fixed preference and make it current
    pub fn auto_select_best_strategy(&self) -> AutoSelection {
        let strategies = self.registered();
        let chosen = PREFERENCE.iter().find_map(|(name, reason)| {
            strategies
                .get(*name)
                .filter(|s| s.is_available())
                .map(|s| (s.clone(), *reason))
        });

        let (strategy, reason) = chosen.unwrap_or_else(|| {
            (
                self.in_memory.clone(),
                "No preferred strategy available; using the in-memory scan",
            )
        });

        let descriptor = StrategyDescriptor::of(strategy.as_ref());
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = strategy;
        info!("Auto-selected strategy {}: {}", descriptor.name, reason);

        AutoSelection {
            strategy: descriptor,
            reason: reason.to_string(),
        }
    }

    /// Time `iterations` runs of a fixed synthetic query on every available strategy
    ///
    /// Never changes the current strategy and never touches search stats. A
    /// second call while one is running fails with `Busy`.
    pub async fn benchmark_strategies(
        &self,
        iterations: usize,
        cancel: &CancellationToken,
    ) -> Result<BenchmarkReport, SearchError> {
        let _guard = BenchmarkGuard::acquire(&self.benchmarking)?;
        let iterations = iterations.max(1);
        let query = synthetic_query(self.schema.total_dimension());
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();

        info!("Benchmark {} started ({} iterations)", run_id, iterations);

        let mut results = BTreeMap::new();
        for (name, strategy) in self.registered() {
            if !strategy.is_available() {
                debug!("Skipping unavailable strategy {} in benchmark", name);
                continue;
            }

            let mut total = Duration::ZERO;
            let mut min = Duration::MAX;
            let mut max = Duration::ZERO;
            let mut failures = 0;

            for _ in 0..iterations {
                let start = Instant::now();
                let outcome = strategy.search(&query, BENCHMARK_TOP_K, cancel).await;
                let elapsed = start.elapsed();
                match outcome {
                    Ok(_) => {}
                    Err(SearchError::Cancelled) => return Err(SearchError::Cancelled),
                    Err(e) => {
                        debug!("Benchmark iteration on {} failed: {}", name, e);
                        failures += 1;
                    }
                }
                total += elapsed;
                min = min.min(elapsed);
                max = max.max(elapsed);
            }

            results.insert(
                name,
                BenchmarkEntry {
                    average_ms: as_ms(total) / iterations as f64,
                    min_ms: as_ms(min),
                    max_ms: as_ms(max),
                    failures,
                },
            );
        }

        let fastest = results
            .iter()
            .filter(|(_, entry)| entry.failures < iterations)
            .min_by(|a, b| a.1.average_ms.total_cmp(&b.1.average_ms))
            .map(|(name, entry)| (name.clone(), entry.average_ms));

        let recommendation = match &fastest {
            Some((_, average_ms)) => recommendation(*average_ms).to_string(),
            None => "No strategy completed the benchmark".to_string(),
        };

        info!(
            "Benchmark {} finished: fastest {:?}",
            run_id,
            fastest.as_ref().map(|(name, _)| name)
        );

        Ok(BenchmarkReport {
            run_id,
            started_at,
            iterations,
            results,
            fastest: fastest.map(|(name, _)| name),
            recommendation,
        })
    }

    /// Stats for every registered strategy
    pub fn stats(&self) -> BTreeMap<String, StrategyStats> {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        self.registered()
            .into_keys()
            .map(|name| {
                let entry = stats.get(&name).cloned().unwrap_or_default();
                (name, entry)
            })
            .collect()
    }

    pub fn record_success(&self, name: &str, elapsed: Duration) {
        self.update_stats(name, |stats| {
            let ms = as_ms(elapsed);
            stats.searches += 1;
            stats.total_latency_ms += ms;
            stats.last_latency_ms = Some(ms);
        });
    }

    pub fn record_failure(&self, name: &str) {
        self.update_stats(name, |stats| stats.failures += 1);
    }

    pub fn record_fallback(&self, name: &str) {
        self.update_stats(name, |stats| stats.fallbacks += 1);
    }

    fn update_stats<F: FnOnce(&mut StrategyStats)>(&self, name: &str, apply: F) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(name.to_string()).or_default();
        apply(entry);
        entry.last_used = Some(Utc::now());
    }

    fn registered(&self) -> BTreeMap<String, Arc<dyn SearchStrategy>> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Deterministic non-zero query used for every benchmark run
fn synthetic_query(dimension: usize) -> Vec<f32> {
    (0..dimension)
        .map(|i| ((i as f32 + 1.0) * 0.618).sin())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::Segment;
    use crate::strategy::SearchResult;
    use async_trait::async_trait;

    struct FakeStrategy {
        name: &'static str,
        available: bool,
        delay: Duration,
    }

    impl FakeStrategy {
        fn new(name: &'static str, available: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                available,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl SearchStrategy for FakeStrategy {
        fn name(&self) -> &str {
            self.name
        }

        fn performance_characteristics(&self) -> &str {
            "fake"
        }

        async fn probe(&self) -> Result<Capability, ProbeError> {
            if self.available {
                Ok(Capability::new("fake", self.name))
            } else {
                Err(ProbeError::DeviceNotFound("no device".to_string()))
            }
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn search(
            &self,
            _query: &[f32],
            _top_k: usize,
            cancel: &CancellationToken,
        ) -> Result<Vec<SearchResult>, SearchError> {
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(Vec::new())
        }
    }

    fn manager() -> StrategyManager {
        let schema = Arc::new(EmbeddingSchema::new(4, vec![Segment::new("all", 0, 4)]).unwrap());
        StrategyManager::new(schema, FakeStrategy::new(IN_MEMORY, true))
    }

    #[tokio::test]
    async fn test_switch_to_unknown_is_not_found() {
        let manager = manager();
        assert!(matches!(
            manager.switch_strategy("Quantum"),
            Err(SearchError::NotFound(_))
        ));
        assert_eq!(manager.current_strategy_info().name, IN_MEMORY);
    }

    #[tokio::test]
    async fn test_switch_to_unavailable_keeps_current() {
        let manager = manager();
        assert!(manager.register(FakeStrategy::new(GPU, false)).await.is_err());

        assert_eq!(
            manager.switch_strategy(GPU),
            Err(SearchError::Unavailable(GPU.to_string()))
        );
        assert_eq!(manager.current_strategy_info().name, IN_MEMORY);
        assert!(!manager.available_strategies()[GPU].is_available);
    }

    #[tokio::test]
    async fn test_switch_replaces_handle_for_new_calls_only() {
        let manager = manager();
        manager
            .register(FakeStrategy::new(PERSISTENT_STORE, true))
            .await
            .unwrap();

        let held = manager.current_handle();
        let descriptor = manager.switch_strategy(PERSISTENT_STORE).unwrap();
        assert_eq!(descriptor.name, PERSISTENT_STORE);
        assert_eq!(held.name(), IN_MEMORY);
        assert_eq!(manager.current_handle().name(), PERSISTENT_STORE);
    }

    #[tokio::test]
    async fn test_auto_select_prefers_gpu() {
        let manager = manager();
        manager
            .register(FakeStrategy::new(PERSISTENT_STORE, true))
            .await
            .unwrap();
        manager.register(FakeStrategy::new(GPU, true)).await.unwrap();

        let selection = manager.auto_select_best_strategy();
        assert_eq!(selection.strategy.name, GPU);
        assert_eq!(manager.current_strategy_info().name, GPU);
    }

    #[tokio::test]
    async fn test_auto_select_without_gpu_uses_in_memory() {
        let manager = manager();
        let _ = manager.register(FakeStrategy::new(GPU, false)).await;
        manager
            .register(FakeStrategy::new(PERSISTENT_STORE, true))
            .await
            .unwrap();

        let selection = manager.auto_select_best_strategy();
        assert_eq!(selection.strategy.name, IN_MEMORY);
        assert!(!selection.reason.is_empty());
    }

    #[tokio::test]
    async fn test_benchmark_covers_available_strategies_only() {
        let manager = manager();
        let _ = manager.register(FakeStrategy::new(GPU, false)).await;
        manager
            .register(FakeStrategy::new(PERSISTENT_STORE, true))
            .await
            .unwrap();

        let report = manager
            .benchmark_strategies(3, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.iterations, 3);
        assert_eq!(report.results.len(), 2);
        assert!(!report.results.contains_key(GPU));
        assert!(report.results.values().all(|e| e.average_ms >= 0.0));
        assert!(report.fastest.is_some());
        assert_eq!(manager.current_strategy_info().name, IN_MEMORY);
        assert!(manager.stats().values().all(|s| s.searches == 0));
    }

    #[tokio::test]
    async fn test_concurrent_benchmark_is_busy() {
        let manager = manager();
        let _held = BenchmarkGuard::acquire(&manager.benchmarking).unwrap();
        let err = manager
            .benchmark_strategies(1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, SearchError::Busy);
    }

    #[tokio::test]
    async fn test_benchmark_guard_released_after_run() {
        let manager = Arc::new(manager());
        manager
            .register(Arc::new(FakeStrategy {
                name: PERSISTENT_STORE,
                available: true,
                delay: Duration::from_millis(20),
            }))
            .await
            .unwrap();

        let background = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .benchmark_strategies(5, &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            manager
                .benchmark_strategies(1, &CancellationToken::new())
                .await
                .unwrap_err(),
            SearchError::Busy
        );

        background.await.unwrap().unwrap();
        assert!(manager
            .benchmark_strategies(1, &CancellationToken::new())
            .await
            .is_ok());
    }

    #[test]
    fn test_recommendation_thresholds() {
        assert_eq!(recommendation(1.0), "excellent, real-time");
        assert_eq!(recommendation(4.99), "excellent, real-time");
        assert_eq!(recommendation(5.0), "good, interactive");
        assert_eq!(recommendation(19.9), "good, interactive");
        assert_eq!(recommendation(20.0), "acceptable");
        assert_eq!(recommendation(50.0), "consider optimization/hardware upgrade");
    }

    #[tokio::test]
    async fn test_stats_track_outcomes() {
        let manager = manager();
        manager.record_success(IN_MEMORY, Duration::from_millis(4));
        manager.record_success(IN_MEMORY, Duration::from_millis(2));
        manager.record_failure(IN_MEMORY);

        let all = manager.stats();
        let stats = &all[IN_MEMORY];
        assert_eq!(stats.searches, 2);
        assert_eq!(stats.failures, 1);
        assert!((stats.average_latency_ms() - 3.0).abs() < 1e-6);
        assert!(stats.last_used.is_some());
    }
}
