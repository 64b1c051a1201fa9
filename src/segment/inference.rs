//! Network execution.
//!
//! [`InferenceBackend`] is the seam between the pipeline and the engine:
//! implementors only run a prepared `(1, 1, X, Y, Z)` tensor, while the
//! provided [`InferenceBackend::infer`] handles intensity normalisation and
//! output shaping. [`OrtRunner`] is the ONNX Runtime implementation.

use crate::error::{Error, Result};
use ndarray::{Array3, Array4, Array5, ArrayD, ArrayView3, ArrayViewD, Axis, Ix4, IxDyn};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::logging::LogLevel;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{TensorRef, ValueType};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Execution device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA GPU; falls back to [`Device::Cpu`] when unavailable.
    Cuda,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        })
    }
}

/// Whether CUDA execution can be used in this process.
#[cfg(feature = "cuda")]
pub fn cuda_available() -> bool {
    use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
    CUDAExecutionProvider::default()
        .is_available()
        .unwrap_or(false)
}

/// Whether CUDA execution can be used in this process.
#[cfg(not(feature = "cuda"))]
pub fn cuda_available() -> bool {
    false
}

#[cfg(feature = "cuda")]
fn accelerated_providers(device: Device) -> Vec<ExecutionProviderDispatch> {
    match device {
        Device::Cuda => vec![ort::execution_providers::CUDAExecutionProvider::default().build()],
        Device::Cpu => Vec::new(),
    }
}

#[cfg(not(feature = "cuda"))]
fn accelerated_providers(_device: Device) -> Vec<ExecutionProviderDispatch> {
    Vec::new()
}

/// Map a requested device to one that can actually run.
///
/// A CUDA request without a usable GPU silently degrades to CPU: results are
/// identical, only latency changes.
pub fn resolve_device(requested: Device) -> Device {
    match requested {
        Device::Cuda if cuda_available() => Device::Cuda,
        Device::Cuda => {
            info!("CUDA execution unavailable, falling back to CPU");
            Device::Cpu
        }
        Device::Cpu => Device::Cpu,
    }
}

/// ONNX Runtime session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub device: Device,
    pub intra_threads: usize,
    pub inter_threads: usize,
    /// Sessions kept per model, used round-robin by concurrent callers.
    pub pool_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            intra_threads: 4,
            inter_threads: 4,
            pool_size: 1,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads;
        self
    }

    pub fn with_inter_threads(mut self, threads: usize) -> Self {
        self.inter_threads = threads;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }
}

/// Divide a volume by its own maximum.
///
/// A maximum of zero (or a non-finite one) leaves nothing to scale by and is
/// rejected as [`Error::InvalidVolume`].
pub fn normalize_by_max(volume: ArrayView3<f32>) -> Result<Array3<f32>> {
    let max = volume.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    if max == 0.0 || !max.is_finite() {
        return Err(Error::InvalidVolume(format!(
            "cannot normalise by maximum intensity {max}"
        )));
    }
    Ok(volume.mapv(|v| v / max))
}

/// Drop leading singleton axes until the tensor is `(C, X, Y, Z)`.
pub fn squeeze_logits(output: ArrayD<f32>) -> Result<Array4<f32>> {
    let mut output = output;
    while output.ndim() > 4 && output.len_of(Axis(0)) == 1 {
        output = output.index_axis_move(Axis(0), 0);
    }
    let shape = output.shape().to_vec();
    output.into_dimensionality::<Ix4>().map_err(|_| {
        Error::Inference(format!(
            "expected a (channels, x, y, z) output, got shape {:?}",
            shape
        ))
    })
}

/// Something that can run a segmentation network.
pub trait InferenceBackend: Send + Sync {
    /// Run the network on a normalised `(1, 1, X, Y, Z)` tensor and return
    /// its first output unchanged.
    fn run(&self, input: Array5<f32>) -> Result<ArrayD<f32>>;

    /// Execution device actually in use.
    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Prepare the backend so that later calls cannot fail on setup.
    fn warm_up(&self) -> Result<()> {
        Ok(())
    }

    /// Normalise `volume` by its maximum, run it and return `(C, X, Y, Z)` logits.
    fn infer(&self, volume: ArrayView3<f32>) -> Result<Array4<f32>> {
        let normalized = normalize_by_max(volume)?;
        let (x, y, z) = normalized.dim();
        // Row-major copy, the layout engines expect.
        let input = Array5::from_shape_vec((1, 1, x, y, z), normalized.iter().copied().collect())
            .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
        squeeze_logits(self.run(input)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Precision {
    F32,
    F64,
}

impl Precision {
    fn from_value_type(ty: &ValueType) -> Option<Self> {
        match ty {
            ValueType::Tensor {
                ty: TensorElementType::Float32,
                ..
            } => Some(Self::F32),
            ValueType::Tensor {
                ty: TensorElementType::Float64,
                ..
            } => Some(Self::F64),
            _ => None,
        }
    }
}

struct LoadedSession {
    session: Session,
    input_name: String,
    input_precision: Precision,
    output_name: String,
    output_precision: Precision,
}

/// ONNX Runtime backend bound to one model file.
///
/// Sessions are built on first use and then reused; with a pool larger than
/// one, concurrent callers are spread round-robin.
pub struct OrtRunner {
    model_path: PathBuf,
    config: SessionConfig,
    device: Device,
    sessions: Vec<Mutex<Option<LoadedSession>>>,
    next_idx: AtomicUsize,
}

impl fmt::Debug for OrtRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrtRunner")
            .field("model_path", &self.model_path)
            .field("device", &self.device)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl OrtRunner {
    /// Create a runner; no session is built until first use.
    ///
    /// The execution device is resolved here, once.
    pub fn new(model_path: impl AsRef<Path>, config: SessionConfig) -> Self {
        let device = resolve_device(config.device);
        let pool_size = config.pool_size.max(1);
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            config,
            device,
            sessions: (0..pool_size).map(|_| Mutex::new(None)).collect(),
            next_idx: AtomicUsize::new(0),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        let mut providers = accelerated_providers(self.device);
        providers.push(CPUExecutionProvider::default().build());
        providers
    }

    fn load_session(&self) -> Result<LoadedSession> {
        let path = &self.model_path;
        let load_err = |e: ort::Error| Error::model_load(path, e);

        let session = Session::builder()
            .map_err(load_err)?
            .with_log_level(LogLevel::Error)
            .map_err(load_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_err)?
            .with_intra_threads(self.config.intra_threads)
            .map_err(load_err)?
            .with_inter_threads(self.config.inter_threads)
            .map_err(load_err)?
            .with_execution_providers(self.execution_providers())
            .map_err(load_err)?
            .commit_from_file(path)
            .map_err(load_err)?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| Error::model_load(path, "model declares no inputs"))?;
        let input_precision = Precision::from_value_type(&input.input_type).ok_or_else(|| {
            Error::model_load(
                path,
                format!("unsupported input type {:?}", input.input_type),
            )
        })?;
        let output = session
            .outputs
            .first()
            .ok_or_else(|| Error::model_load(path, "model declares no outputs"))?;
        let output_precision =
            Precision::from_value_type(&output.output_type).ok_or_else(|| {
                Error::model_load(
                    path,
                    format!("unsupported output type {:?}", output.output_type),
                )
            })?;

        info!(
            model = %path.display(),
            device = %self.device,
            input = %input.name,
            "loaded ONNX session"
        );

        Ok(LoadedSession {
            input_name: input.name.clone(),
            output_name: output.name.clone(),
            input_precision,
            output_precision,
            session,
        })
    }

    fn with_session<T>(&self, f: impl FnOnce(&mut LoadedSession) -> Result<T>) -> Result<T> {
        let idx = self.next_idx.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        let mut guard = self.sessions[idx]
            .lock()
            .map_err(|_| Error::Inference(format!("session {idx} lock poisoned")))?;
        if guard.is_none() {
            debug!(slot = idx, "building session");
            *guard = Some(self.load_session()?);
        }
        match guard.as_mut() {
            Some(loaded) => f(loaded),
            None => Err(Error::Inference("session unavailable".into())),
        }
    }
}

fn to_owned_dyn<T: Copy>(shape: &[i64], data: &[T]) -> Result<ArrayD<T>> {
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    ArrayViewD::from_shape(IxDyn(&dims), data)
        .map(|view| view.to_owned())
        .map_err(|e| Error::inference("output extraction", e))
}

impl InferenceBackend for OrtRunner {
    fn run(&self, input: Array5<f32>) -> Result<ArrayD<f32>> {
        self.with_session(|loaded| {
            let input_name = loaded.input_name.as_str();
            let outputs = match loaded.input_precision {
                Precision::F32 => {
                    let tensor = TensorRef::from_array_view(input.view())
                        .map_err(|e| Error::inference("tensor conversion", e))?;
                    loaded.session.run(ort::inputs![input_name => tensor])
                }
                Precision::F64 => {
                    let wide = input.mapv(f64::from);
                    let tensor = TensorRef::from_array_view(wide.view())
                        .map_err(|e| Error::inference("tensor conversion", e))?;
                    loaded.session.run(ort::inputs![input_name => tensor])
                }
            }
            .map_err(|e| Error::inference("forward pass", e))?;

            let output = &outputs[loaded.output_name.as_str()];
            match loaded.output_precision {
                Precision::F32 => {
                    let (shape, data) = output
                        .try_extract_tensor::<f32>()
                        .map_err(|e| Error::inference("output extraction", e))?;
                    to_owned_dyn(shape, data)
                }
                Precision::F64 => {
                    let (shape, data) = output
                        .try_extract_tensor::<f64>()
                        .map_err(|e| Error::inference("output extraction", e))?;
                    Ok(to_owned_dyn(shape, data)?.mapv(|v| v as f32))
                }
            }
        })
    }

    fn device(&self) -> Device {
        self.device
    }

    /// Build every pooled session so unreadable models fail up front.
    fn warm_up(&self) -> Result<()> {
        for _ in 0..self.sessions.len() {
            self.with_session(|_| Ok(()))?;
        }
        Ok(())
    }
}

/// Runners shared per (model file, requested device).
#[derive(Debug, Default)]
pub struct SessionCache {
    runners: Mutex<HashMap<(PathBuf, Device), Arc<OrtRunner>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached runner for `model_path`, creating it with `config`
    /// if none exists yet.
    pub fn get_or_create(
        &self,
        model_path: impl AsRef<Path>,
        config: &SessionConfig,
    ) -> Result<Arc<OrtRunner>> {
        let key = (model_path.as_ref().to_path_buf(), config.device);
        let mut runners = self
            .runners
            .lock()
            .map_err(|_| Error::Inference("session cache lock poisoned".into()))?;
        Ok(runners
            .entry(key)
            .or_insert_with(|| Arc::new(OrtRunner::new(model_path.as_ref(), config.clone())))
            .clone())
    }

    pub fn len(&self) -> usize {
        self.runners.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl InferenceBackend for Echo {
        fn run(&self, input: Array5<f32>) -> Result<ArrayD<f32>> {
            Ok(input.into_dyn())
        }
    }

    #[test]
    fn test_normalize_by_max() {
        let vol = Array3::from_shape_fn((2, 2, 2), |(i, j, k)| (i + j + k) as f32);
        let norm = normalize_by_max(vol.view()).unwrap();
        assert_eq!(norm[[1, 1, 1]], 1.0);
        assert_eq!(norm[[1, 0, 0]], 1.0 / 3.0);
    }

    #[test]
    fn test_zero_volume_rejected() {
        let vol = Array3::<f32>::zeros((4, 4, 4));
        assert!(matches!(
            normalize_by_max(vol.view()),
            Err(Error::InvalidVolume(_))
        ));
    }

    #[test]
    fn test_infer_strips_batch_axis() {
        let vol = Array3::from_elem((3, 4, 5), 2.0f32);
        let logits = Echo.infer(vol.view()).unwrap();
        assert_eq!(logits.dim(), (1, 3, 4, 5));
        assert!(logits.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_infer_keeps_fortran_volume_values() {
        use ndarray::ShapeBuilder;
        let vol = Array3::from_shape_fn((2, 3, 4).f(), |(i, j, k)| {
            (1 + i + 10 * j + 100 * k) as f32
        });
        let logits = Echo.infer(vol.view()).unwrap();
        let max = 1.0 + 1.0 + 20.0 + 300.0;
        assert_eq!(logits[[0, 1, 2, 3]], vol[[1, 2, 3]] / max);
    }

    #[test]
    fn test_squeeze_rejects_wrong_rank() {
        let out = ArrayD::<f32>::zeros(IxDyn(&[1, 2, 4, 4]));
        assert_eq!(squeeze_logits(out).unwrap().dim(), (1, 2, 4, 4));

        let out = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 4, 4, 4]));
        assert!(matches!(squeeze_logits(out), Err(Error::Inference(_))));
    }

    #[test]
    fn test_cpu_request_stays_cpu() {
        assert_eq!(resolve_device(Device::Cpu), Device::Cpu);
        let resolved = resolve_device(Device::Cuda);
        assert_eq!(resolved == Device::Cuda, cuda_available());
    }

    #[test]
    fn test_missing_model_fails_on_warm_up() {
        let runner = OrtRunner::new(
            "/nonexistent/mprage_v0004_bet_full.onnx",
            SessionConfig::new(),
        );
        assert!(matches!(runner.warm_up(), Err(Error::ModelLoad { .. })));
    }

    #[test]
    fn test_session_cache_shares_runners() {
        let cache = SessionCache::new();
        let config = SessionConfig::new().with_pool_size(2);
        let a = cache.get_or_create("a.onnx", &config).unwrap();
        let b = cache.get_or_create("a.onnx", &config).unwrap();
        let c = cache.get_or_create("b.onnx", &config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }
}
