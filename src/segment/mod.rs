//! Brain extraction and anatomical segmentation.
//!
//! A [`ModelDescriptor`] names the network and its grid, an
//! [`InferenceBackend`] runs it, [`MaskReconstructor`] turns logits into
//! labels and [`Pipeline`] ties the stages together for files on disk.

pub mod components;
pub mod inference;
pub mod labels;
pub mod model;
pub mod pipeline;
pub mod reconstruct;

pub use components::{label_components, largest_component, Connectivity};
pub use inference::{
    cuda_available, normalize_by_max, resolve_device, Device, InferenceBackend, OrtRunner,
    SessionCache, SessionConfig,
};
pub use labels::LabelTable;
pub use model::{
    locate_model, ModelDescriptor, SegMode, DEFAULT_MODEL, FAST_MODEL, MODEL_DIR_ENV,
};
pub use pipeline::{
    output_file_name, BatchReport, FileFailure, FileOutcome, Pipeline, PipelineConfig,
    Segmentation, Segmenter, Stage, StageError, EXTRACTED_POSTFIX,
};
pub use reconstruct::{Decision, MaskReconstructor, Reconstruction, CONFIDENCE_FLOOR};
