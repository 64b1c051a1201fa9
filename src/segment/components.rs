//! 3-D connected-component labelling.

use ndarray::{Array3, ArrayView3, ShapeBuilder};

/// Neighbourhood used to connect foreground voxels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Connectivity {
    /// Voxels sharing a face (6 neighbours).
    #[default]
    Face,
    /// Voxels sharing a face, edge or corner (26 neighbours).
    Full,
}

impl Connectivity {
    fn offsets(self) -> Vec<[isize; 3]> {
        let mut offsets = Vec::with_capacity(26);
        for di in -1isize..=1 {
            for dj in -1isize..=1 {
                for dk in -1isize..=1 {
                    let manhattan = di.abs() + dj.abs() + dk.abs();
                    let keep = match self {
                        Self::Face => manhattan == 1,
                        Self::Full => manhattan > 0,
                    };
                    if keep {
                        offsets.push([di, dj, dk]);
                    }
                }
            }
        }
        offsets
    }
}

/// Label every connected foreground region.
///
/// Components are numbered from 1 in the order their first voxel is met in a
/// row-major scan; background stays 0. Returns the label volume and the size
/// of each component (`sizes[label - 1]`).
pub fn label_components(
    mask: ArrayView3<bool>,
    connectivity: Connectivity,
) -> (Array3<u32>, Vec<usize>) {
    let (nx, ny, nz) = mask.dim();
    let mut labels = Array3::<u32>::zeros((nx, ny, nz).f());
    let mut sizes = Vec::new();
    let offsets = connectivity.offsets();
    let mut stack = Vec::new();

    for ((i, j, k), &fg) in mask.indexed_iter() {
        if !fg || labels[[i, j, k]] != 0 {
            continue;
        }

        let label = sizes.len() as u32 + 1;
        let mut size = 0usize;
        labels[[i, j, k]] = label;
        stack.push([i, j, k]);

        while let Some([ci, cj, ck]) = stack.pop() {
            size += 1;
            for [di, dj, dk] in &offsets {
                let (Some(ni), Some(nj), Some(nk)) = (
                    ci.checked_add_signed(*di),
                    cj.checked_add_signed(*dj),
                    ck.checked_add_signed(*dk),
                ) else {
                    continue;
                };
                if ni >= nx || nj >= ny || nk >= nz {
                    continue;
                }
                if mask[[ni, nj, nk]] && labels[[ni, nj, nk]] == 0 {
                    labels[[ni, nj, nk]] = label;
                    stack.push([ni, nj, nk]);
                }
            }
        }
        sizes.push(size);
    }

    (labels, sizes)
}

/// Keep only the largest connected component of `mask`.
///
/// Equal sizes resolve to the component met first in the scan. A mask with
/// no foreground is returned unchanged.
pub fn largest_component(mask: ArrayView3<bool>, connectivity: Connectivity) -> Array3<bool> {
    let (labels, sizes) = label_components(mask, connectivity);

    let Some(best) = sizes
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, usize)>, (idx, &size)| match best {
            Some((_, best_size)) if best_size >= size => best,
            _ => Some((idx, size)),
        })
        .map(|(idx, _)| idx as u32 + 1)
    else {
        return mask.to_owned();
    };

    labels.mapv(|l| l == best)
}
