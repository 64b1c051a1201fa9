//! Resampling between voxel grids.
//!
//! `resample_*` map a volume from its own affine onto a target [`Grid`]
//! through world space. `resize_*` only change the array shape, stretching
//! the volume to cover the same extent.

use super::affine::{apply, compose, invert, Affine, Grid};
use crate::error::Result;
use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis, ShapeBuilder, Zip};

/// Tolerance for samples that land a rounding error outside the source.
const EDGE_EPS: f64 = 1e-6;

/// Target-voxel to source-voxel mapping: `inv(source) * target`.
fn voxel_map(source_affine: &Affine, target: &Grid) -> Result<Affine> {
    Ok(compose(&invert(source_affine)?, &target.affine))
}

#[inline]
fn trilinear(source: &ArrayView3<f32>, p: [f64; 3], fill: f32) -> f32 {
    let dims = source.dim();
    let dims = [dims.0, dims.1, dims.2];

    let mut lo = [0usize; 3];
    let mut frac = [0f64; 3];
    for axis in 0..3 {
        let upper = (dims[axis] - 1) as f64;
        if p[axis] < -EDGE_EPS || p[axis] > upper + EDGE_EPS {
            return fill;
        }
        let x = p[axis].clamp(0.0, upper);
        let base = x.floor().min((dims[axis].max(2) - 2) as f64).max(0.0);
        lo[axis] = base as usize;
        frac[axis] = x - base;
    }

    let hi: [usize; 3] = std::array::from_fn(|a| (lo[a] + 1).min(dims[a] - 1));
    let mut acc = 0.0f64;
    for (dx, wx) in [(lo[0], 1.0 - frac[0]), (hi[0], frac[0])] {
        for (dy, wy) in [(lo[1], 1.0 - frac[1]), (hi[1], frac[1])] {
            for (dz, wz) in [(lo[2], 1.0 - frac[2]), (hi[2], frac[2])] {
                let w = wx * wy * wz;
                if w != 0.0 {
                    acc += w * source[[dx, dy, dz]] as f64;
                }
            }
        }
    }
    acc as f32
}

#[inline]
fn nearest_index(p: [f64; 3], dims: [usize; 3]) -> Option<[usize; 3]> {
    let mut idx = [0usize; 3];
    for axis in 0..3 {
        let r = (p[axis] + 0.5).floor();
        if r < 0.0 || r > (dims[axis] - 1) as f64 {
            return None;
        }
        idx[axis] = r as usize;
    }
    Some(idx)
}

/// Resample an intensity volume onto `target` with trilinear interpolation.
///
/// Target voxels whose source position falls outside the source volume are
/// set to `fill`. Fails only when `source_affine` cannot be inverted.
pub fn resample_linear(
    source: ArrayView3<f32>,
    source_affine: &Affine,
    target: &Grid,
    fill: f32,
) -> Result<Array3<f32>> {
    let map = voxel_map(source_affine, target)?;
    let [x, y, z] = target.shape;
    let mut out = Array3::<f32>::zeros((x, y, z).f());
    if source.is_empty() {
        out.fill(fill);
        return Ok(out);
    }

    Zip::indexed(&mut out).par_for_each(|(i, j, k), v| {
        let p = apply(&map, [i as f64, j as f64, k as f64]);
        *v = trilinear(&source, p, fill);
    });
    Ok(out)
}

/// Resample a label volume onto `target` with nearest-neighbour lookup.
///
/// Values are copied, never blended; out-of-bounds voxels get `fill`.
pub fn resample_nearest<T>(
    source: ArrayView3<T>,
    source_affine: &Affine,
    target: &Grid,
    fill: T,
) -> Result<Array3<T>>
where
    T: Copy + Send + Sync,
{
    let map = voxel_map(source_affine, target)?;
    let (sx, sy, sz) = source.dim();
    let [x, y, z] = target.shape;
    let mut out = Array3::from_elem((x, y, z).f(), fill);
    if source.is_empty() {
        return Ok(out);
    }

    Zip::indexed(&mut out).par_for_each(|(i, j, k), v| {
        let p = apply(&map, [i as f64, j as f64, k as f64]);
        if let Some(idx) = nearest_index(p, [sx, sy, sz]) {
            *v = source[idx];
        }
    });
    Ok(out)
}

/// Resample every channel of a `(C, X, Y, Z)` tensor with trilinear interpolation.
pub fn resample_channels_linear(
    source: ArrayView4<f32>,
    source_affine: &Affine,
    target: &Grid,
    fill: f32,
) -> Result<Array4<f32>> {
    let [x, y, z] = target.shape;
    let channels = source.len_of(Axis(0));
    let mut out = Array4::<f32>::zeros((channels, x, y, z).f());
    for (src, mut dst) in source.outer_iter().zip(out.outer_iter_mut()) {
        dst.assign(&resample_linear(src, source_affine, target, fill)?);
    }
    Ok(out)
}

/// Source coordinate of output index `i` when stretching `n_in` samples to `n_out`.
#[inline]
fn stretch(i: usize, n_in: usize, n_out: usize) -> f64 {
    (i as f64 + 0.5) * (n_in as f64 / n_out as f64) - 0.5
}

/// Resize a label volume to `shape` with nearest-neighbour lookup.
///
/// Pixel centres are aligned, edges clamp.
pub fn resize_nearest<T>(source: ArrayView3<T>, shape: [usize; 3]) -> Array3<T>
where
    T: Copy + Default + Send + Sync,
{
    let (sx, sy, sz) = source.dim();
    let dims = [sx, sy, sz];
    let mut out = Array3::from_elem((shape[0], shape[1], shape[2]).f(), T::default());
    if source.is_empty() {
        return out;
    }

    Zip::indexed(&mut out).par_for_each(|(i, j, k), v| {
        let idx: [usize; 3] = std::array::from_fn(|a| {
            let p = stretch([i, j, k][a], dims[a], shape[a]);
            ((p + 0.5).floor().max(0.0) as usize).min(dims[a] - 1)
        });
        *v = source[idx];
    });
    out
}

/// Resize an intensity volume to `shape` with trilinear interpolation.
///
/// Pixel centres are aligned, edges clamp. No anti-aliasing is applied when
/// shrinking.
pub fn resize_linear(source: ArrayView3<f32>, shape: [usize; 3]) -> Array3<f32> {
    let (sx, sy, sz) = source.dim();
    let dims = [sx, sy, sz];
    let mut out = Array3::<f32>::zeros((shape[0], shape[1], shape[2]).f());
    if source.is_empty() {
        return out;
    }

    Zip::indexed(&mut out).par_for_each(|(i, j, k), v| {
        let p: [f64; 3] = std::array::from_fn(|a| {
            stretch([i, j, k][a], dims[a], shape[a]).clamp(0.0, (dims[a] - 1) as f64)
        });
        *v = trilinear(&source, p, 0.0);
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::transforms::canonical_affine;

    fn native_affine() -> Affine {
        // 2 mm voxels, 64 voxels per axis, centred like the 128 canonical grid.
        [
            [2.0, 0.0, 0.0, -64.0],
            [0.0, 2.0, 0.0, -64.0],
            [0.0, 0.0, 2.0, -64.0],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    fn smooth_volume(n: usize) -> Array3<f32> {
        Array3::from_shape_fn((n, n, n).f(), |(i, j, k)| (i + 2 * j + 3 * k) as f32)
    }

    #[test]
    fn test_identity_resample_is_exact() {
        let vol = smooth_volume(8);
        let affine = native_affine();
        let grid = Grid::new(affine, [8, 8, 8]);
        let out = resample_linear(vol.view(), &affine, &grid, 0.0).unwrap();
        assert_eq!(out, vol);
    }

    #[test]
    fn test_forward_then_inverse_roundtrip() {
        // Canonical 128 grid has 2 mm voxels; the native grid sits exactly on it.
        let vol = smooth_volume(64);
        let native = Grid::new(native_affine(), [64, 64, 64]);
        let canonical = Grid::canonical(128);

        let forward = resample_linear(vol.view(), &native.affine, &canonical, 0.0).unwrap();
        assert_eq!(forward.dim(), (128, 128, 128));

        let back = resample_linear(forward.view(), &canonical.affine, &native, 0.0).unwrap();
        for (a, b) in back.iter().zip(vol.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
        assert_eq!(native.affine, native_affine());
        assert_eq!(native.zooms(), [2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_out_of_bounds_filled() {
        let vol = Array3::<f32>::ones((4, 4, 4).f());
        let canonical = Grid::canonical(16);
        let out = resample_linear(vol.view(), &native_affine(), &canonical, -1.0).unwrap();
        // World origin maps to native voxel 32, far outside a 4-voxel volume.
        assert_eq!(out[[8, 8, 8]], -1.0);
        // World -64 mm (canonical voxel 4) is native voxel 0.
        assert_eq!(out[[4, 4, 4]], 1.0);
    }

    #[test]
    fn test_nearest_never_blends() {
        let mut labels = Array3::<u8>::zeros((4, 4, 4).f());
        labels[[1, 1, 1]] = 17;
        labels[[2, 1, 1]] = 53;
        let source = Grid::canonical(4);
        let target = Grid::canonical(16);
        let out = resample_nearest(labels.view(), &source.affine, &target, 0).unwrap();
        assert!(out.iter().all(|v| [0, 17, 53].contains(v)));
        assert!(out.iter().any(|&v| v == 17));
        assert!(out.iter().any(|&v| v == 53));
    }

    #[test]
    fn test_singular_source_affine() {
        let vol = Array3::<f32>::ones((4, 4, 4));
        let singular = [[0.0; 4], [0.0; 4], [0.0; 4], [0.0, 0.0, 0.0, 1.0]];
        let err = resample_linear(vol.view(), &singular, &Grid::canonical(8), 0.0).unwrap_err();
        assert!(matches!(err, Error::Geometry(_)));
    }

    #[test]
    fn test_resize_nearest_upsamples_blocks() {
        let mut labels = Array3::<u8>::zeros((2, 2, 2));
        labels[[1, 0, 0]] = 1;
        let out = resize_nearest(labels.view(), [4, 4, 4]);
        assert_eq!(out.dim(), (4, 4, 4));
        assert_eq!(out[[2, 0, 0]], 1);
        assert_eq!(out[[3, 1, 1]], 1);
        assert_eq!(out[[1, 0, 0]], 0);
        assert_eq!(out.iter().filter(|&&v| v == 1).count(), 8);
    }

    #[test]
    fn test_resize_nearest_to_anisotropic_shape() {
        let labels = Array3::<u8>::from_elem((128, 128, 128), 1);
        let out = resize_nearest(labels.view(), [182, 218, 182]);
        assert_eq!(out.dim(), (182, 218, 182));
        assert!(out.iter().all(|&v| v == 1));
    }

    #[test]
    fn test_resize_linear_preserves_constant() {
        let vol = Array3::<f32>::from_elem((5, 7, 9), 3.5);
        let out = resize_linear(vol.view(), [8, 8, 8]);
        assert!(out.iter().all(|&v| (v - 3.5).abs() < 1e-6));
    }

    #[test]
    fn test_resample_channels() {
        let probs = Array4::<f32>::from_elem((2, 4, 4, 4), 0.5);
        let affine = canonical_affine(4);
        let grid = Grid::new(affine, [4, 4, 4]);
        let out = resample_channels_linear(probs.view(), &affine, &grid, 0.0).unwrap();
        assert_eq!(out.dim(), (2, 4, 4, 4));
        assert!(out.iter().all(|&v| v == 0.5));
    }
}
