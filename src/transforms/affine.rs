//! 4x4 voxel-to-world affines and voxel grids.

use crate::error::{Error, Result};

/// Row-major homogeneous voxel-to-world transform.
pub type Affine = [[f64; 4]; 4];

/// Physical field of view of every canonical grid, in millimetres.
pub const CANONICAL_FOV_MM: f64 = 256.0;

const SINGULAR_EPS: f64 = 1e-12;

/// Affine of the canonical `n`³ grid.
///
/// Voxels are `256 / n` mm isotropic and voxel `(n/2, n/2, n/2)` sits at the
/// physical origin, so every canonical grid spans the same 256 mm cube.
pub fn canonical_affine(n: usize) -> Affine {
    let zoom = CANONICAL_FOV_MM / n as f64;
    let offset = -(n as f64 / 2.0) * zoom;
    [
        [zoom, 0.0, 0.0, offset],
        [0.0, zoom, 0.0, offset],
        [0.0, 0.0, zoom, offset],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

/// A voxel grid: shape plus its placement in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub affine: Affine,
    pub shape: [usize; 3],
}

impl Grid {
    pub fn new(affine: Affine, shape: [usize; 3]) -> Self {
        Self { affine, shape }
    }

    /// The canonical `n`³ grid.
    pub fn canonical(n: usize) -> Self {
        Self::new(canonical_affine(n), [n, n, n])
    }

    /// Voxel sizes implied by the affine's column norms.
    pub fn zooms(&self) -> [f64; 3] {
        std::array::from_fn(|axis| {
            (0..3)
                .map(|row| self.affine[row][axis].powi(2))
                .sum::<f64>()
                .sqrt()
        })
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `a * b`.
pub fn compose(a: &Affine, b: &Affine) -> Affine {
    std::array::from_fn(|r| std::array::from_fn(|c| (0..4).map(|k| a[r][k] * b[k][c]).sum()))
}

/// Apply `affine` to a point.
#[inline]
pub fn apply(affine: &Affine, p: [f64; 3]) -> [f64; 3] {
    std::array::from_fn(|r| {
        affine[r][0] * p[0] + affine[r][1] * p[1] + affine[r][2] * p[2] + affine[r][3]
    })
}

/// Invert a homogeneous affine.
///
/// Fails with [`Error::Geometry`] when the bottom row is not `[0, 0, 0, 1]`,
/// an entry is not finite, or the linear part is singular (for instance an
/// all-zero sform).
pub fn invert(affine: &Affine) -> Result<Affine> {
    if affine.iter().flatten().any(|v| !v.is_finite()) {
        return Err(Error::Geometry(format!("non-finite affine {:?}", affine)));
    }
    if affine[3] != [0.0, 0.0, 0.0, 1.0] {
        return Err(Error::Geometry(format!(
            "affine bottom row must be [0, 0, 0, 1], got {:?}",
            affine[3]
        )));
    }

    let m = |r: usize, c: usize| affine[r][c];
    let cof = [
        [
            m(1, 1) * m(2, 2) - m(1, 2) * m(2, 1),
            m(0, 2) * m(2, 1) - m(0, 1) * m(2, 2),
            m(0, 1) * m(1, 2) - m(0, 2) * m(1, 1),
        ],
        [
            m(1, 2) * m(2, 0) - m(1, 0) * m(2, 2),
            m(0, 0) * m(2, 2) - m(0, 2) * m(2, 0),
            m(0, 2) * m(1, 0) - m(0, 0) * m(1, 2),
        ],
        [
            m(1, 0) * m(2, 1) - m(1, 1) * m(2, 0),
            m(0, 1) * m(2, 0) - m(0, 0) * m(2, 1),
            m(0, 0) * m(1, 1) - m(0, 1) * m(1, 0),
        ],
    ];
    let det = m(0, 0) * cof[0][0] + m(0, 1) * cof[1][0] + m(0, 2) * cof[2][0];
    if det.abs() < SINGULAR_EPS {
        return Err(Error::Geometry(format!(
            "singular affine (determinant {:e})",
            det
        )));
    }

    let mut inv = [[0.0; 4]; 4];
    for r in 0..3 {
        for c in 0..3 {
            inv[r][c] = cof[r][c] / det;
        }
        inv[r][3] = -(0..3).map(|k| inv[r][k] * affine[k][3]).sum::<f64>();
    }
    inv[3][3] = 1.0;
    Ok(inv)
}
