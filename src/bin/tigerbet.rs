//! Skull stripping and brain segmentation of NIfTI volumes.
//!
//! ```text
//! tigerbet sub01.nii.gz -o out/ -m
//! tigerbet 'scans/*.nii.gz' --fast -j 4
//! tigerbet scans/ --model mprage_v0006_aseg43_r256.onnx --maskonly
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tigerseg::segment::{
    locate_model, BatchReport, Device, InferenceBackend, ModelDescriptor, Pipeline, PipelineConfig,
    Segmenter, SessionCache, SessionConfig, DEFAULT_MODEL, FAST_MODEL, MODEL_DIR_ENV,
};
use tigerseg::{expand_inputs, init_tracing};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tigerbet", version, about = "Brain extraction for T1-weighted MRI")]
struct Args {
    /// Input files, directories or glob patterns
    #[arg(required = true, value_name = "INPUT")]
    input: Vec<String>,

    /// Output directory (default: next to each input)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Use the GPU when available
    #[arg(short, long)]
    gpu: bool,

    /// Also write the brain mask
    #[arg(short, long)]
    mask: bool,

    /// Write only the brain mask
    #[arg(long = "maskonly")]
    mask_only: bool,

    /// Use the fast low-resolution model (overrides --model)
    #[arg(short, long)]
    fast: bool,

    /// Model identifier or path
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Directory holding model files
    #[arg(long, value_name = "DIR", env = MODEL_DIR_ENV)]
    model_dir: Option<PathBuf>,

    /// Threads used inside one inference operator
    #[arg(long, default_value_t = 4)]
    intra_threads: usize,

    /// Threads used across inference operators
    #[arg(long, default_value_t = 4)]
    inter_threads: usize,

    /// Files processed concurrently
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn run(args: Args) -> tigerseg::Result<BatchReport> {
    let files = expand_inputs(args.input.as_slice())?;

    let identifier = if args.fast {
        FAST_MODEL
    } else {
        args.model.as_str()
    };
    let descriptor = ModelDescriptor::parse(identifier)?;
    let model_path = locate_model(identifier, args.model_dir.as_deref())?;
    info!("Using model: {}", model_path.display());

    let session = SessionConfig::new()
        .with_device(if args.gpu { Device::Cuda } else { Device::Cpu })
        .with_intra_threads(args.intra_threads)
        .with_inter_threads(args.inter_threads)
        .with_pool_size(args.jobs);
    let cache = SessionCache::new();
    let runner = cache.get_or_create(&model_path, &session)?;
    runner.warm_up()?;
    info!("Execution device: {}", runner.device());

    let mut config = PipelineConfig::new()
        .with_mask(args.mask)
        .with_mask_only(args.mask_only)
        .with_jobs(args.jobs);
    if let Some(dir) = args.output {
        config = config.with_output_dir(dir);
    }

    let pipeline = Pipeline::new(Segmenter::new(descriptor, runner), config);
    pipeline.run(&files)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args) {
        Ok(report) if report.is_success() => ExitCode::SUCCESS,
        Ok(report) => {
            for failure in report.failures() {
                error!("{}", failure);
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
