//! `NIfTI` file format support.
//!
//! Reading and writing of `.nii` and `.nii.gz` volumes, enough to round-trip
//! a voxel grid together with its affine and voxel spacing.

pub(crate) mod header;
pub(crate) mod image;
pub mod io;

pub use header::{DataType, NiftiHeader, NiftiVersion};
pub use image::{ArrayData, NiftiElement, NiftiImage};
pub use io::{load, load_header, save};
