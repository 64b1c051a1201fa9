//! Error types shared by the NIfTI, resampling and segmentation layers.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while reading volumes, running models or writing outputs.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying filesystem or stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The header did not carry a recognised NIfTI magic string.
    #[error("invalid NIfTI magic bytes {0:?}")]
    InvalidMagic([u8; 4]),

    /// The header declared a datatype code this crate cannot decode.
    #[error("unsupported data type code {0}")]
    UnsupportedDataType(i16),

    /// Dimensions, spacing or offsets in the header are inconsistent.
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    /// The file is structurally broken beyond the header checks.
    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    /// Gzip payload could not be inflated.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Two arrays that must agree in shape do not.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An operation needed a contiguous buffer.
    #[error("non-contiguous array: {0}")]
    NonContiguousArray(String),

    /// Invalid user or library configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A path, directory or glob pattern resolved to no input files.
    #[error("no input files found for: {0}")]
    InputNotFound(String),

    /// The output directory could not be created or written.
    #[error("output directory {path} is not writable: {source}")]
    OutputDirUnwritable {
        /// Directory that was requested.
        path: PathBuf,
        /// Filesystem error returned while creating or writing it.
        #[source]
        source: std::io::Error,
    },

    /// The model artifact is missing or rejected by the inference engine.
    #[error("failed to load model {path}: {reason}")]
    ModelLoad {
        /// Model path or identifier.
        path: PathBuf,
        /// Reason reported by the lookup or the engine.
        reason: String,
    },

    /// The model identifier does not follow `<family>_<version>_<mode>_<variant>`.
    #[error("invalid model identifier '{0}': expected <family>_<version>_<mode>_<variant>")]
    InvalidModelIdentifier(String),

    /// Segmentation mode is unknown or disagrees with the network output.
    #[error("mode mismatch: {0}")]
    ModeMismatch(String),

    /// A resampling grid could not be constructed (e.g. singular affine).
    #[error("geometry error: {0}")]
    Geometry(String),

    /// The inference engine failed while running the model.
    #[error("inference failed: {0}")]
    Inference(String),

    /// Volume content cannot be fed to a model (e.g. all-zero intensities).
    #[error("invalid volume: {0}")]
    InvalidVolume(String),
}

impl Error {
    pub(crate) fn model_load(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn inference(context: &str, source: impl std::fmt::Display) -> Self {
        Self::Inference(format!("{context}: {source}"))
    }
}
