//! Model identifiers and artifact lookup.
//!
//! A model is named `<family>_<version>_<mode>_<variant>.onnx`, e.g.
//! `mprage_v0004_bet_full.onnx`. The mode token selects the segmentation
//! task, the variant token carries the canonical grid the network was
//! trained on (`...r128`, `...r256`, or anything else for the native grid).

use crate::error::{Error, Result};
use crate::transforms::Grid;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Full-resolution brain extraction model used when none is given.
pub const DEFAULT_MODEL: &str = "mprage_v0004_bet_full.onnx";

/// Low-resolution brain extraction model selected by `--fast`.
pub const FAST_MODEL: &str = "mprage_v0002_bet_kuor128.onnx";

/// Environment variable naming a directory of model artifacts.
pub const MODEL_DIR_ENV: &str = "TIGERSEG_MODEL_DIR";

const MODEL_EXTENSION: &str = "onnx";

/// Segmentation task a model performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegMode {
    /// Binary brain mask.
    Bet,
    /// 43-structure anatomical segmentation.
    Aseg43,
}

impl SegMode {
    /// Number of labels the task distinguishes, background included.
    pub const fn label_count(self) -> usize {
        match self {
            Self::Bet => 2,
            Self::Aseg43 => 44,
        }
    }

    /// Token used in model identifiers.
    pub const fn token(self) -> &'static str {
        match self {
            Self::Bet => "bet",
            Self::Aseg43 => "aseg43",
        }
    }

    /// Postfix of the label volume written for this task.
    pub const fn mask_postfix(self) -> &'static str {
        match self {
            Self::Bet => "tbetmask",
            Self::Aseg43 => "aseg43",
        }
    }
}

impl fmt::Display for SegMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for SegMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bet" => Ok(Self::Bet),
            "aseg43" => Ok(Self::Aseg43),
            other => Err(Error::ModeMismatch(format!(
                "unsupported segmentation mode '{other}' (expected bet or aseg43)"
            ))),
        }
    }
}

/// Typed view of a model identifier, parsed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDescriptor {
    name: String,
    family: String,
    version: String,
    mode: SegMode,
    variant: String,
    resolution: Option<usize>,
}

impl ModelDescriptor {
    /// Parse an identifier or a path to a model file.
    ///
    /// Only the file name is inspected; a trailing `.onnx` is optional.
    pub fn parse(identifier: &str) -> Result<Self> {
        let name = Path::new(identifier)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidModelIdentifier(identifier.to_string()))?;
        let stem = name.strip_suffix(".onnx").unwrap_or(name);

        let tokens: Vec<&str> = stem.split('_').collect();
        let [family, version, mode, variant] = tokens.as_slice() else {
            return Err(Error::InvalidModelIdentifier(identifier.to_string()));
        };
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(Error::InvalidModelIdentifier(identifier.to_string()));
        }

        let mode: SegMode = mode.parse()?;
        let resolution = if variant.contains("r128") {
            Some(128)
        } else if variant.contains("r256") {
            Some(256)
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            family: family.to_string(),
            version: version.to_string(),
            mode,
            variant: variant.to_string(),
            resolution,
        })
    }

    /// File name of the model as given.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn mode(&self) -> SegMode {
        self.mode
    }

    /// Canonical grid size `N` the network expects, if any.
    pub fn resolution(&self) -> Option<usize> {
        self.resolution
    }

    /// The canonical `N`³ grid, or `None` for native-grid models.
    pub fn canonical_grid(&self) -> Option<Grid> {
        self.resolution.map(Grid::canonical)
    }

    /// Number of labels expected for the model's mode.
    pub fn label_count(&self) -> usize {
        self.mode.label_count()
    }
}

impl FromStr for ModelDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn default_search_dirs(model_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    dirs.extend(model_dir.map(Path::to_path_buf));
    if let Some(env_dir) = std::env::var_os(MODEL_DIR_ENV) {
        dirs.push(PathBuf::from(env_dir));
    }
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        dirs.push(exe_dir.join("models"));
    }
    dirs.push(PathBuf::from("models"));
    dirs
}

fn find_in(identifier: &str, dirs: &[PathBuf]) -> Result<PathBuf> {
    let direct = Path::new(identifier);
    if direct.is_file() {
        return Ok(direct.to_path_buf());
    }

    let mut file_name = PathBuf::from(identifier);
    if file_name.extension().map_or(true, |e| e != MODEL_EXTENSION) {
        file_name.set_extension(MODEL_EXTENSION);
    }

    for dir in dirs {
        let candidate = dir.join(&file_name);
        debug!(candidate = %candidate.display(), "looking for model");
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    let searched: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
    Err(Error::model_load(
        identifier,
        format!("model file not found (searched: {})", searched.join(", ")),
    ))
}

/// Resolve a model identifier to an existing file.
///
/// The identifier is first taken as a path; otherwise it is looked up (with
/// `.onnx` appended if missing) in `model_dir`, `$TIGERSEG_MODEL_DIR`,
/// `<exe dir>/models` and `./models`, in that order.
pub fn locate_model(identifier: &str, model_dir: Option<&Path>) -> Result<PathBuf> {
    find_in(identifier, &default_search_dirs(model_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_default_model() {
        let desc = ModelDescriptor::parse(DEFAULT_MODEL).unwrap();
        assert_eq!(desc.family(), "mprage");
        assert_eq!(desc.version(), "v0004");
        assert_eq!(desc.mode(), SegMode::Bet);
        assert_eq!(desc.variant(), "full");
        assert_eq!(desc.resolution(), None);
        assert!(desc.canonical_grid().is_none());
        assert_eq!(desc.label_count(), 2);
    }

    #[test]
    fn test_parse_fast_model() {
        let desc: ModelDescriptor = FAST_MODEL.parse().unwrap();
        assert_eq!(desc.resolution(), Some(128));
        assert_eq!(desc.canonical_grid().unwrap().shape, [128, 128, 128]);
    }

    #[test]
    fn test_parse_aseg_from_path() {
        let desc = ModelDescriptor::parse("/opt/models/mprage_v0006_aseg43_r256.onnx").unwrap();
        assert_eq!(desc.mode(), SegMode::Aseg43);
        assert_eq!(desc.label_count(), 44);
        assert_eq!(desc.resolution(), Some(256));
        assert_eq!(desc.name(), "mprage_v0006_aseg43_r256.onnx");
    }

    #[test]
    fn test_parse_without_extension() {
        let desc = ModelDescriptor::parse("mprage_v0002_bet_kuor128").unwrap();
        assert_eq!(desc.resolution(), Some(128));
    }

    #[test]
    fn test_malformed_identifiers() {
        for bad in ["model.onnx", "a_b_bet.onnx", "a__bet_full.onnx", "a_b_bet_full_extra.onnx"] {
            assert!(
                matches!(ModelDescriptor::parse(bad), Err(Error::InvalidModelIdentifier(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_unknown_mode() {
        assert!(matches!(
            ModelDescriptor::parse("mprage_v0001_dgm12_full.onnx"),
            Err(Error::ModeMismatch(_))
        ));
    }

    #[test]
    fn test_locate_in_model_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(FAST_MODEL);
        std::fs::write(&path, b"onnx").unwrap();

        let found = find_in("mprage_v0002_bet_kuor128", &[dir.path().to_path_buf()]).unwrap();
        assert_eq!(found, path);

        let direct = find_in(path.to_str().unwrap(), &[]).unwrap();
        assert_eq!(direct, path);
    }

    #[test]
    fn test_locate_missing_model() {
        let dir = tempdir().unwrap();
        let err = find_in(DEFAULT_MODEL, &[dir.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }));
    }
}
