//! Spatial transforms: affine algebra, canonical grids and resampling.

pub mod affine;
pub mod resample;

pub use affine::{canonical_affine, compose, invert, Affine, Grid};
pub use resample::{
    resample_channels_linear, resample_linear, resample_nearest, resize_linear, resize_nearest,
};

