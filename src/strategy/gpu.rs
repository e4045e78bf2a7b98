//! GPU strategy: batched matrix-vector cosine over a device-resident buffer
//!
//! All embedded document vectors are packed into one `(N, D)` tensor on the
//! device. The buffer is tagged with the index generation it was built from;
//! when the index changes a new buffer is uploaded and swapped in whole, so a
//! query always scores against one consistent buffer.
//!
//! The device is opened once by `probe()`. Build with `--features cuda` to
//! compile the CUDA backend; without it the probe reports the device as not
//! found and the strategy stays unavailable.

use super::{
    cosine_from_parts, norm, rank, Capability, ProbeError, SearchError, SearchResult,
    SearchStrategy, GPU,
};
use crate::index::{VectorIndex, VoicingDocument};
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Opens the compute device; injected so deployments can pick an ordinal
pub type DeviceProbe = Arc<dyn Fn() -> candle_core::Result<Device> + Send + Sync>;

type BufferSlot = Arc<RwLock<Option<Arc<DeviceBuffer>>>>;

struct DeviceBuffer {
    generation: u64,
    documents: Vec<Arc<VoicingDocument>>,
    /// `(N, D)` on the device; `None` when no document has an embedding
    vectors: Option<Tensor>,
    norms: Vec<f32>,
}

impl DeviceBuffer {
    fn upload(index: &VectorIndex, device: &Device) -> candle_core::Result<Self> {
        // Generation first: the snapshot taken after it is never older
        let generation = index.generation();
        let snapshot = index.snapshot();
        let dimension = index.schema().total_dimension();

        let documents: Vec<Arc<VoicingDocument>> = snapshot
            .iter()
            .filter(|d| d.has_embedding())
            .cloned()
            .collect();

        let mut packed = Vec::with_capacity(documents.len() * dimension);
        let mut norms = Vec::with_capacity(documents.len());
        for document in &documents {
            if let Some(embedding) = document.embedding.as_deref() {
                packed.extend_from_slice(embedding);
                norms.push(norm(embedding));
            }
        }

        let vectors = if documents.is_empty() {
            None
        } else {
            Some(Tensor::from_vec(packed, (documents.len(), dimension), device)?)
        };

        Ok(Self {
            generation,
            documents,
            vectors,
            norms,
        })
    }

    fn score(
        &self,
        query: &[f32],
        device: &Device,
    ) -> candle_core::Result<Vec<SearchResult>> {
        let Some(vectors) = &self.vectors else {
            return Ok(Vec::new());
        };

        let query_tensor = Tensor::from_slice(query, (query.len(), 1), device)?;
        let dots: Vec<f32> = vectors.matmul(&query_tensor)?.squeeze(1)?.to_vec1()?;
        let query_norm = norm(query);

        Ok(self
            .documents
            .iter()
            .zip(dots)
            .zip(&self.norms)
            .map(|((document, dot), doc_norm)| {
                SearchResult::new(document.clone(), cosine_from_parts(dot, query_norm, *doc_norm))
            })
            .collect())
    }
}

pub struct GpuStrategy {
    index: Arc<VectorIndex>,
    probe_fn: DeviceProbe,
    device: OnceLock<Result<(Device, Capability), ProbeError>>,
    buffer: BufferSlot,
}

impl GpuStrategy {
    /// CUDA device `ordinal`
    pub fn new(index: Arc<VectorIndex>, ordinal: usize) -> Self {
        Self::with_probe(index, Arc::new(move || Device::new_cuda(ordinal)))
    }

    pub fn with_probe(index: Arc<VectorIndex>, probe_fn: DeviceProbe) -> Self {
        Self {
            index,
            probe_fn,
            device: OnceLock::new(),
            buffer: Arc::new(RwLock::new(None)),
        }
    }

    /// Upload a fresh buffer from the current index contents
    pub fn rebuild(&self) -> Result<(), SearchError> {
        let device = self.device()?;
        install_buffer(&self.index, &self.buffer, &device).map(|_| ())
    }

    fn device(&self) -> Result<Device, SearchError> {
        match self.device.get() {
            Some(Ok((device, _))) => Ok(device.clone()),
            Some(Err(e)) => Err(SearchError::Unavailable(format!("{}: {}", GPU, e))),
            None => Err(SearchError::Unavailable(format!("{}: not probed", GPU))),
        }
    }
}

/// Open the device and run a trivial allocation; panics become errors
fn run_probe(probe_fn: &DeviceProbe) -> Result<(Device, Capability), ProbeError> {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let device = probe_fn()?;
        Tensor::zeros((1, 1), DType::F32, &device)?;
        Ok::<_, candle_core::Error>(device)
    }));

    match outcome {
        Ok(Ok(device)) => {
            let capability = Capability::new("candle", format!("{:?}", device.location()));
            Ok((device, capability))
        }
        Ok(Err(e)) => Err(ProbeError::DeviceNotFound(e.to_string())),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ProbeError::Panicked(message))
        }
    }
}

fn install_buffer(
    index: &VectorIndex,
    slot: &BufferSlot,
    device: &Device,
) -> Result<Arc<DeviceBuffer>, SearchError> {
    let generation = index.generation();
    if let Some(buffer) = slot.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
        if buffer.generation == generation {
            return Ok(buffer.clone());
        }
    }

    let buffer = Arc::new(
        DeviceBuffer::upload(index, device)
            .map_err(|e| SearchError::transient(GPU, format!("buffer upload failed: {}", e)))?,
    );
    debug!(
        "Uploaded device buffer: {} vectors (generation {})",
        buffer.documents.len(),
        buffer.generation
    );
    // A slower upload of an older generation never replaces a newer buffer
    let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
    if current.as_ref().map_or(true, |c| c.generation < buffer.generation) {
        *current = Some(buffer.clone());
    }
    Ok(buffer)
}

#[async_trait]
impl SearchStrategy for GpuStrategy {
    fn name(&self) -> &str {
        GPU
    }

    fn performance_characteristics(&self) -> &str {
        "Batched matrix-vector cosine on the accelerator; lowest latency for large indexes, buffer re-upload on index change"
    }

    async fn probe(&self) -> Result<Capability, ProbeError> {
        let outcome = self.device.get_or_init(|| run_probe(&self.probe_fn));
        match outcome {
            Ok((_, capability)) => {
                info!("GPU probe succeeded: {}", capability.detail);
                Ok(capability.clone())
            }
            Err(e) => {
                warn!("GPU probe failed: {}", e);
                Err(e.clone())
            }
        }
    }

    fn is_available(&self) -> bool {
        matches!(self.device.get(), Some(Ok(_)))
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, SearchError> {
        self.index.schema().validate_vector(query)?;
        let device = self.device()?;
        if cancel.is_cancelled() {
            return Err(SearchError::Cancelled);
        }

        let index = self.index.clone();
        let slot = self.buffer.clone();
        let query = query.to_vec();
        let cancel = cancel.clone();

        tokio::task::spawn_blocking(move || {
            let buffer = install_buffer(&index, &slot, &device)?;
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            let scored = buffer
                .score(&query, &device)
                .map_err(|e| SearchError::transient(GPU, format!("kernel failed: {}", e)))?;
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            Ok(rank(scored, top_k))
        })
        .await
        .map_err(|e| SearchError::transient(GPU, format!("kernel task failed: {}", e)))?
    }
}
