//! # tigerseg
//!
//! Brain extraction and whole-brain segmentation of T1-weighted MRI stored as
//! NIfTI, using pretrained ONNX networks.
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tigerseg::segment::{
//!     locate_model, ModelDescriptor, OrtRunner, Pipeline, PipelineConfig, Segmenter,
//!     SessionConfig, DEFAULT_MODEL,
//! };
//!
//! let path = locate_model(DEFAULT_MODEL, None)?;
//! let descriptor = ModelDescriptor::parse(DEFAULT_MODEL)?;
//! let runner = Arc::new(OrtRunner::new(&path, SessionConfig::default()));
//! let pipeline = Pipeline::new(
//!     Segmenter::new(descriptor, runner),
//!     PipelineConfig::new().with_mask(true),
//! );
//! let report = pipeline.run(&tigerseg::expand_inputs(&["scans/"])?)?;
//! println!("{} of {} done", report.succeeded(), report.total());
//! ```
//!
//! ## Modules
//!
//! - [`nifti`]: `.nii` / `.nii.gz` reading and writing
//! - [`transforms`]: affines, canonical grids and resampling
//! - [`segment`]: models, inference, mask reconstruction and the file pipeline

pub mod error;
pub mod inputs;
pub mod logging;
pub mod nifti;
pub mod segment;
pub mod transforms;

pub use error::{Error, Result};
pub use inputs::expand_inputs;
pub use logging::init_tracing;
pub use nifti::{load, save, NiftiHeader, NiftiImage};
pub use segment::{ModelDescriptor, Pipeline, PipelineConfig, SegMode, Segmenter};
