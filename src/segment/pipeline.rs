//! Per-file segmentation pipeline.
//!
//! [`Segmenter`] runs the in-memory stages on one image. [`Pipeline`] wraps
//! it with loading and writing, processes batches with per-file isolation
//! and never leaves partial outputs behind.

use super::components::Connectivity;
use super::inference::InferenceBackend;
use super::model::ModelDescriptor;
use super::reconstruct::{MaskReconstructor, Reconstruction};
use crate::error::{Error, Result};
use crate::nifti::{self, ArrayData, NiftiImage};
use crate::transforms::{
    resample_channels_linear, resample_linear, resample_nearest, resize_linear, Affine, Grid,
};
use ndarray::{Array3, Array4, ArrayView3, Zip};
use rayon::prelude::*;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tracing::{debug, error, info, warn};

/// Postfix of the skull-stripped intensity volume.
pub const EXTRACTED_POSTFIX: &str = "tbet";

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Load,
    ResampleIn,
    Infer,
    Reconstruct,
    ResampleOut,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "load",
            Self::ResampleIn => "resample-in",
            Self::Infer => "infer",
            Self::Reconstruct => "reconstruct",
            Self::ResampleOut => "resample-out",
            Self::Write => "write",
        })
    }
}

/// An error tagged with the stage that raised it.
#[derive(Debug)]
pub struct StageError {
    pub stage: Stage,
    pub error: Error,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for StageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

trait AtStage<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageError>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Stage) -> std::result::Result<T, StageError> {
        self.map_err(|error| StageError { stage, error })
    }
}

/// Output and behaviour switches for a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Where outputs go; `None` writes next to each input.
    pub output_dir: Option<PathBuf>,
    /// Write only the label volume.
    pub mask_only: bool,
    /// Also write the label volume next to the extracted volume.
    pub write_mask: bool,
    /// Neighbourhood for the largest-component step.
    pub connectivity: Connectivity,
    /// Resample channel probabilities back to the native grid.
    pub keep_probabilities: bool,
    /// Files processed concurrently.
    pub jobs: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            mask_only: false,
            write_mask: false,
            connectivity: Connectivity::Face,
            keep_probabilities: false,
            jobs: 1,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_mask_only(mut self, mask_only: bool) -> Self {
        self.mask_only = mask_only;
        self
    }

    pub fn with_mask(mut self, write_mask: bool) -> Self {
        self.write_mask = write_mask;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_probabilities(mut self, keep: bool) -> Self {
        self.keep_probabilities = keep;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }
}

/// Result of segmenting one image, on its native grid.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub labels: Array3<u8>,
    /// Native affine of the input.
    pub affine: Affine,
    /// Voxel sizes copied from the input header.
    pub zooms: [f64; 3],
    /// Channel probabilities `(C, X, Y, Z)`, when requested.
    pub probabilities: Option<Array4<f32>>,
}

/// Runs resampling, inference and reconstruction for one model.
pub struct Segmenter {
    descriptor: ModelDescriptor,
    backend: Arc<dyn InferenceBackend>,
    reconstructor: MaskReconstructor,
    keep_probabilities: bool,
}

impl fmt::Debug for Segmenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segmenter")
            .field("descriptor", &self.descriptor)
            .field("device", &self.backend.device())
            .field("keep_probabilities", &self.keep_probabilities)
            .finish_non_exhaustive()
    }
}

impl Segmenter {
    pub fn new(descriptor: ModelDescriptor, backend: Arc<dyn InferenceBackend>) -> Self {
        let reconstructor = MaskReconstructor::new(descriptor.mode());
        Self {
            descriptor,
            backend,
            reconstructor,
            keep_probabilities: false,
        }
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.reconstructor = self.reconstructor.with_connectivity(connectivity);
        self
    }

    pub fn with_probabilities(mut self, keep: bool) -> Self {
        self.keep_probabilities = keep;
        self
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn backend(&self) -> &Arc<dyn InferenceBackend> {
        &self.backend
    }

    /// Segment a loaded image and return labels on its native grid.
    pub fn segment(&self, image: &NiftiImage) -> Result<Segmentation> {
        self.segment_staged(image).map_err(|e| e.error)
    }

    fn segment_staged(&self, image: &NiftiImage) -> std::result::Result<Segmentation, StageError> {
        let volume = image.volume_f32().at(Stage::Load)?;
        let (x, y, z) = volume.dim();
        let native = Grid::new(image.affine(), [x, y, z]);
        let canonical = self.descriptor.canonical_grid();

        let network_input = match &canonical {
            Some(grid) => {
                debug!(n = grid.shape[0], "resampling onto canonical grid");
                resample_linear(volume.view(), &native.affine, grid, 0.0).at(Stage::ResampleIn)?
            }
            None => volume,
        };
        let (nx, ny, nz) = network_input.dim();

        let logits = self.backend.infer(network_input.view()).at(Stage::Infer)?;
        let Reconstruction {
            labels,
            probabilities,
            ..
        } = self
            .reconstructor
            .reconstruct(logits, Some([nx, ny, nz]))
            .at(Stage::Reconstruct)?;

        let (labels, probabilities) = match &canonical {
            Some(grid) => {
                let labels = resample_nearest(labels.view(), &grid.affine, &native, 0u8)
                    .at(Stage::ResampleOut)?;
                let probabilities = if self.keep_probabilities {
                    Some(
                        resample_channels_linear(probabilities.view(), &grid.affine, &native, 0.0)
                            .at(Stage::ResampleOut)?,
                    )
                } else {
                    None
                };
                (labels, probabilities)
            }
            None => (labels, self.keep_probabilities.then_some(probabilities)),
        };

        Ok(Segmentation {
            labels,
            affine: native.affine,
            zooms: image.zooms(),
            probabilities,
        })
    }

    /// Segment a bare volume without geometry.
    ///
    /// Canonical-grid models get the volume stretched to `N`³ when its shape
    /// differs; the labels are then resized back to the input shape.
    pub fn segment_volume(&self, volume: ArrayView3<f32>) -> Result<Reconstruction> {
        let (x, y, z) = volume.dim();
        let shape = [x, y, z];
        let logits = match self.descriptor.resolution() {
            Some(n) if shape != [n, n, n] => {
                let resized = resize_linear(volume, [n, n, n]);
                self.backend.infer(resized.view())?
            }
            _ => self.backend.infer(volume)?,
        };
        self.reconstructor.reconstruct(logits, Some(shape))
    }
}

/// Final state of one input file.
#[derive(Debug)]
pub enum FileOutcome {
    Done {
        input: PathBuf,
        outputs: Vec<PathBuf>,
        elapsed: Duration,
    },
    Failed(FileFailure),
}

impl FileOutcome {
    pub fn input(&self) -> &Path {
        match self {
            Self::Done { input, .. } => input,
            Self::Failed(failure) => &failure.input,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// A file that could not be processed.
#[derive(Debug)]
pub struct FileFailure {
    pub input: PathBuf,
    pub stage: Stage,
    pub error: Error,
}

impl fmt::Display for FileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} stage failed: {}",
            self.input.display(),
            self.stage,
            self.error
        )
    }
}

/// Outcomes of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<FileOutcome>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_done()).count()
    }

    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileFailure> {
        self.outcomes.iter().filter_map(|o| match o {
            FileOutcome::Failed(failure) => Some(failure),
            FileOutcome::Done { .. } => None,
        })
    }

    /// True when every file was processed.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

/// `<name>` with `.nii` replaced by `_<postfix>.nii`, e.g. `sub.nii.gz` to
/// `sub_tbet.nii.gz`. Names without `.nii` get `_<postfix>.nii` appended.
pub fn output_file_name(input_name: &str, postfix: &str) -> String {
    let tagged = format!("_{postfix}.nii");
    if input_name.contains(".nii") {
        input_name.replace(".nii", &tagged)
    } else {
        format!("{input_name}{tagged}")
    }
}

fn nifti_suffix(path: &Path) -> &'static str {
    if path.extension().is_some_and(|e| e == "gz") {
        ".nii.gz"
    } else {
        ".nii"
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputKind {
    Extracted,
    Mask,
}

struct StagedFile {
    temp: TempPath,
    dest: PathBuf,
}

/// Full file-to-file segmentation with batch isolation.
#[derive(Debug)]
pub struct Pipeline {
    segmenter: Segmenter,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(segmenter: Segmenter, config: PipelineConfig) -> Self {
        let segmenter = segmenter
            .with_connectivity(config.connectivity)
            .with_probabilities(config.keep_probabilities);
        Self { segmenter, config }
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Destination directory for outputs of `input`.
    pub fn output_dir_for(&self, input: &Path) -> PathBuf {
        match &self.config.output_dir {
            Some(dir) => dir.clone(),
            None => std::path::absolute(input)
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf))
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Paths this pipeline writes for `input`, in write order.
    pub fn planned_outputs(&self, input: &Path) -> Vec<PathBuf> {
        self.plan(input).into_iter().map(|(_, path)| path).collect()
    }

    fn plan(&self, input: &Path) -> Vec<(OutputKind, PathBuf)> {
        let dir = self.output_dir_for(input);
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mask = dir.join(output_file_name(
            &name,
            self.segmenter.descriptor().mode().mask_postfix(),
        ));
        let extracted = dir.join(output_file_name(&name, EXTRACTED_POSTFIX));

        if self.config.mask_only {
            vec![(OutputKind::Mask, mask)]
        } else if self.config.write_mask {
            vec![(OutputKind::Extracted, extracted), (OutputKind::Mask, mask)]
        } else {
            vec![(OutputKind::Extracted, extracted)]
        }
    }

    /// Process one file through every stage.
    pub fn process_file(&self, input: &Path) -> FileOutcome {
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string());
        info!("Processing: {}", name);
        let started = Instant::now();

        match self.try_process(input) {
            Ok(outputs) => {
                let elapsed = started.elapsed();
                info!("Processing time: {:.1} seconds", elapsed.as_secs_f64());
                FileOutcome::Done {
                    input: input.to_path_buf(),
                    outputs,
                    elapsed,
                }
            }
            Err(StageError { stage, error }) => {
                error!(file = %input.display(), %stage, "{}", error);
                FileOutcome::Failed(FileFailure {
                    input: input.to_path_buf(),
                    stage,
                    error,
                })
            }
        }
    }

    fn try_process(&self, input: &Path) -> std::result::Result<Vec<PathBuf>, StageError> {
        let image = nifti::load(input).at(Stage::Load)?;
        let segmentation = self.segmenter.segment_staged(&image)?;

        let mut images = Vec::new();
        for (kind, dest) in self.plan(input) {
            let img = match kind {
                OutputKind::Mask => mask_image(&image, &segmentation),
                OutputKind::Extracted => extracted_image(&image, &segmentation),
            }
            .at(Stage::Write)?;
            images.push((img, dest));
        }

        write_atomically(&images, &self.output_dir_for(input)).at(Stage::Write)
    }

    /// Process every file; failures are recorded and do not stop the batch.
    pub fn run(&self, files: &[PathBuf]) -> Result<BatchReport> {
        info!("Total nii files: {}", files.len());

        let outcomes: Vec<FileOutcome> = if self.config.jobs <= 1 || files.len() <= 1 {
            files.iter().map(|f| self.process_file(f)).collect()
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.jobs)
                .build()
                .map_err(|e| Error::Configuration(format!("worker pool: {e}")))?;
            pool.install(|| files.par_iter().map(|f| self.process_file(f)).collect())
        };

        let report = BatchReport { outcomes };
        if report.is_success() {
            info!("Finished {} file(s)", report.total());
        } else {
            warn!(
                "Finished with {} of {} file(s) failed",
                report.failed(),
                report.total()
            );
        }
        Ok(report)
    }
}

/// `u8` label volume carrying the input's affine and zooms.
fn mask_image(native: &NiftiImage, segmentation: &Segmentation) -> Result<NiftiImage> {
    NiftiImage::from_template(
        native.header(),
        ArrayData::U8(segmentation.labels.clone().into_dyn()),
    )
}

/// Native intensities times the binarised labels, in the input's datatype.
fn extracted_image(native: &NiftiImage, segmentation: &Segmentation) -> Result<NiftiImage> {
    let intensities = native.volume_f64()?;
    if intensities.dim() != segmentation.labels.dim() {
        return Err(Error::ShapeMismatch(format!(
            "labels {:?} do not cover volume {:?}",
            segmentation.labels.dim(),
            intensities.dim()
        )));
    }
    let masked = Zip::from(&intensities)
        .and(&segmentation.labels)
        .map_collect(|&v, &label| if label > 0 { v } else { 0.0 });
    let data = ArrayData::from_f64(&masked.into_dyn(), native.dtype())?;
    NiftiImage::from_template(native.header(), data)
}

/// Write every image to a temporary file in `dir`, then rename them all
/// into place. Any failure removes what was already renamed.
fn write_atomically(images: &[(NiftiImage, PathBuf)], dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).map_err(|source| Error::OutputDirUnwritable {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut staged = Vec::with_capacity(images.len());
    for (image, dest) in images {
        let temp = tempfile::Builder::new()
            .prefix(".tigerseg-")
            .suffix(nifti_suffix(dest))
            .tempfile_in(dir)
            .map_err(|source| Error::OutputDirUnwritable {
                path: dir.to_path_buf(),
                source,
            })?
            .into_temp_path();
        nifti::save(image, &temp)?;
        staged.push(StagedFile {
            temp,
            dest: dest.clone(),
        });
    }

    let mut committed: Vec<PathBuf> = Vec::with_capacity(staged.len());
    for StagedFile { temp, dest } in staged {
        if let Err(e) = temp.persist(&dest) {
            for done in &committed {
                if let Err(cleanup) = std::fs::remove_file(done) {
                    warn!(file = %done.display(), "could not remove partial output: {}", cleanup);
                }
            }
            return Err(Error::Io(e.error));
        }
        info!("Writing output file: {}", dest.display());
        committed.push(dest);
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegMode;

    #[test]
    fn test_output_file_name() {
        assert_eq!(output_file_name("sub01.nii.gz", "tbet"), "sub01_tbet.nii.gz");
        assert_eq!(output_file_name("sub01.nii", "tbetmask"), "sub01_tbetmask.nii");
        assert_eq!(output_file_name("scan", "aseg43"), "scan_aseg43.nii");
    }

    #[test]
    fn test_stage_order_display() {
        let stages = [
            Stage::Load,
            Stage::ResampleIn,
            Stage::Infer,
            Stage::Reconstruct,
            Stage::ResampleOut,
            Stage::Write,
        ];
        let names: Vec<String> = stages.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            ["load", "resample-in", "infer", "reconstruct", "resample-out", "write"]
        );
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_output_dir("/tmp/out")
            .with_mask(true)
            .with_jobs(0)
            .with_connectivity(Connectivity::Full);
        assert_eq!(config.output_dir, Some(PathBuf::from("/tmp/out")));
        assert!(config.write_mask);
        assert!(!config.mask_only);
        assert_eq!(config.jobs, 1);
        assert_eq!(config.connectivity, Connectivity::Full);
    }

    #[test]
    fn test_mask_postfix_follows_mode() {
        assert_eq!(SegMode::Bet.mask_postfix(), "tbetmask");
        assert_eq!(SegMode::Aseg43.mask_postfix(), "aseg43");
    }
}
