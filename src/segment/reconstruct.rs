//! Turning network logits into a label volume.

use super::components::{largest_component, Connectivity};
use super::labels::LabelTable;
use super::model::SegMode;
use crate::error::{Error, Result};
use crate::transforms::resize_nearest;
use ndarray::{Array3, Array4, ArrayView1, Axis, ShapeBuilder, Zip};
use tracing::debug;

/// Voxels whose best channel score is at or below this are background.
pub const CONFIDENCE_FLOOR: f32 = 0.6;

/// Decision rule chosen from the label count and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Fewer channels than labels: per-channel scores, floor, largest component.
    Sigmoid,
    /// One channel per label: argmax with softmax probabilities.
    Softmax,
}

/// Output of [`MaskReconstructor::reconstruct`].
#[derive(Debug, Clone)]
pub struct Reconstruction {
    /// Label volume on the requested output shape.
    pub labels: Array3<u8>,
    /// Channel scores `(C, X, Y, Z)` on the logits grid: sigmoid or raw
    /// scores in [`Decision::Sigmoid`], softmax in [`Decision::Softmax`].
    pub probabilities: Array4<f32>,
    pub decision: Decision,
}

/// Logits to labels for one segmentation mode.
#[derive(Debug, Clone)]
pub struct MaskReconstructor {
    mode: SegMode,
    label_count: usize,
    table: LabelTable,
    connectivity: Connectivity,
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Index and value of the first maximum.
#[inline]
fn argmax(lane: ArrayView1<f32>) -> (usize, f32) {
    lane.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
}

/// Voxels whose best channel score clears [`CONFIDENCE_FLOOR`].
fn confident_voxels(scores: &Array4<f32>) -> Array3<bool> {
    let (_, x, y, z) = scores.dim();
    let mut foreground = Array3::from_elem((x, y, z).f(), false);
    Zip::from(&mut foreground)
        .and(scores.lanes(Axis(0)))
        .par_for_each(|fg, lane| {
            let (_, best) = argmax(lane);
            *fg = best > CONFIDENCE_FLOOR;
        });
    foreground
}

fn softmax_channels(logits: &Array4<f32>) -> Array4<f32> {
    let mut probs = logits.clone();
    Zip::from(probs.lanes_mut(Axis(0))).par_for_each(|mut lane| {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane.mapv_inplace(|v| v / sum);
        }
    });
    probs
}

impl MaskReconstructor {
    /// Reconstructor for `mode` with its standard label count, the aseg43
    /// table and face connectivity.
    pub fn new(mode: SegMode) -> Self {
        Self {
            mode,
            label_count: mode.label_count(),
            table: LabelTable::aseg43(),
            connectivity: Connectivity::Face,
        }
    }

    pub fn with_label_count(mut self, label_count: usize) -> Self {
        self.label_count = label_count;
        self
    }

    pub fn with_table(mut self, table: LabelTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn mode(&self) -> SegMode {
        self.mode
    }

    /// Decision rule used for a tensor with `channels` channels.
    pub fn decision(&self, channels: usize) -> Decision {
        if self.label_count > channels {
            Decision::Sigmoid
        } else {
            Decision::Softmax
        }
    }

    /// Convert `(C, X, Y, Z)` logits into labels.
    ///
    /// When `output_shape` differs from the logits grid, the labels are
    /// resized to it with nearest-neighbour lookup.
    pub fn reconstruct(
        &self,
        logits: Array4<f32>,
        output_shape: Option<[usize; 3]>,
    ) -> Result<Reconstruction> {
        let (channels, x, y, z) = logits.dim();
        if channels == 0 {
            return Err(Error::ModeMismatch("network produced no channels".into()));
        }

        let decision = self.decision(channels);
        debug!(mode = %self.mode, channels, ?decision, "reconstructing mask");

        let (mut labels, probabilities) = match decision {
            Decision::Sigmoid => {
                let scores = if self.mode == SegMode::Bet {
                    logits.mapv(sigmoid)
                } else {
                    logits
                };
                let foreground = confident_voxels(&scores);
                let kept = largest_component(foreground.view(), self.connectivity);
                (kept.mapv(u8::from), scores)
            }
            Decision::Softmax => {
                let mut dense = Array3::<u8>::zeros((x, y, z).f());
                let mut overflow = false;
                Zip::from(&mut dense)
                    .and(logits.lanes(Axis(0)))
                    .for_each(|d, lane| {
                        let (idx, _) = argmax(lane);
                        match u8::try_from(idx) {
                            Ok(v) => *d = v,
                            Err(_) => overflow = true,
                        }
                    });
                if overflow {
                    return Err(Error::ModeMismatch(format!(
                        "{} channels exceed the 8-bit label range",
                        channels
                    )));
                }
                (dense, softmax_channels(&logits))
            }
        };

        if self.mode == SegMode::Aseg43 {
            labels = self.remap(&labels)?;
        }

        if let Some(shape) = output_shape {
            if shape != [x, y, z] {
                labels = resize_nearest(labels.view(), shape);
            }
        }

        Ok(Reconstruction {
            labels,
            probabilities,
            decision,
        })
    }

    /// Replace each dense index with its code from the label table.
    fn remap(&self, dense: &Array3<u8>) -> Result<Array3<u8>> {
        let mut out = Array3::<u8>::zeros(dense.raw_dim().f());
        for (o, &i) in out.iter_mut().zip(dense.iter()) {
            *o = self.table.code(i as usize)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::s;

    fn logits_from_scores(scores: &[Array3<f32>]) -> Array4<f32> {
        let (x, y, z) = scores[0].dim();
        let mut logits = Array4::<f32>::zeros((scores.len(), x, y, z));
        for (c, score) in scores.iter().enumerate() {
            logits.index_axis_mut(Axis(0), c).assign(score);
        }
        logits
    }

    #[test]
    fn test_confidence_floor_is_strict() {
        let above = f32::from_bits(CONFIDENCE_FLOOR.to_bits() + 1);
        let mut score = Array3::<f32>::zeros((3, 1, 1));
        score[[0, 0, 0]] = CONFIDENCE_FLOOR;
        score[[1, 0, 0]] = above;
        score[[2, 0, 0]] = 0.1;
        let scores = logits_from_scores(&[score]);

        let fg = confident_voxels(&scores);
        assert!(!fg[[0, 0, 0]]);
        assert!(fg[[1, 0, 0]]);
        assert!(!fg[[2, 0, 0]]);
    }

    #[test]
    fn test_sigmoid_branch_thresholds_probabilities() {
        // Single-channel bet model: sigmoid(0.0) = 0.5 is background, sigmoid(2.0) ~ 0.88 is brain.
        let mut score = Array3::<f32>::zeros((3, 1, 1));
        score[[1, 0, 0]] = 2.0;
        let logits = logits_from_scores(&[score]);

        let rec = MaskReconstructor::new(SegMode::Bet)
            .reconstruct(logits, None)
            .unwrap();
        assert_eq!(rec.decision, Decision::Sigmoid);
        assert_eq!(rec.labels[[0, 0, 0]], 0);
        assert_eq!(rec.labels[[1, 0, 0]], 1);
        assert_eq!(rec.labels[[2, 0, 0]], 0);
        assert!((rec.probabilities[[0, 0, 0, 0]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_only_largest_blob_survives() {
        let mut score = Array3::<f32>::from_elem((12, 12, 12), -10.0);
        score.slice_mut(s![0..2, 0..5, 0..1]).fill(10.0);
        score.slice_mut(s![5..10, 5..10, 5..9]).fill(10.0);
        let logits = logits_from_scores(&[score]);

        let rec = MaskReconstructor::new(SegMode::Bet)
            .reconstruct(logits, None)
            .unwrap();
        assert_eq!(rec.labels.iter().filter(|&&v| v == 1).count(), 100);
        assert_eq!(rec.labels[[0, 0, 0]], 0);
        assert_eq!(rec.labels[[7, 7, 7]], 1);
    }

    #[test]
    fn test_softmax_branch_for_two_channel_bet() {
        let background = Array3::<f32>::from_elem((2, 2, 2), 1.0);
        let mut brain = Array3::<f32>::from_elem((2, 2, 2), 0.0);
        brain[[1, 1, 1]] = 3.0;
        let logits = logits_from_scores(&[background, brain]);

        let rec = MaskReconstructor::new(SegMode::Bet)
            .reconstruct(logits, None)
            .unwrap();
        assert_eq!(rec.decision, Decision::Softmax);
        assert_eq!(rec.labels.iter().filter(|&&v| v == 1).count(), 1);
        assert_eq!(rec.labels[[1, 1, 1]], 1);
        for lane in rec.probabilities.lanes(Axis(0)) {
            assert!((lane.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_aseg_remap_uses_table_index() {
        let table = LabelTable::aseg43();
        let channels = 44;
        let mut logits = Array4::<f32>::zeros((channels, 3, 1, 1));
        logits[[0, 0, 0, 0]] = 5.0;
        logits[[17, 1, 0, 0]] = 5.0;
        logits[[42, 2, 0, 0]] = 5.0;

        let rec = MaskReconstructor::new(SegMode::Aseg43)
            .reconstruct(logits, None)
            .unwrap();
        assert_eq!(rec.labels[[0, 0, 0]], table.code(0).unwrap());
        assert_eq!(rec.labels[[1, 0, 0]], table.code(17).unwrap());
        assert_eq!(rec.labels[[2, 0, 0]], 255);
        assert!(rec.labels.iter().all(|c| table.codes().contains(c)));
    }

    #[test]
    fn test_aseg_index_past_table_is_mode_mismatch() {
        let mut logits = Array4::<f32>::zeros((44, 2, 1, 1));
        logits[[43, 1, 0, 0]] = 5.0;
        let err = MaskReconstructor::new(SegMode::Aseg43)
            .reconstruct(logits, None)
            .unwrap_err();
        assert!(matches!(err, Error::ModeMismatch(_)));
    }

    #[test]
    fn test_labels_resized_to_output_shape() {
        let mut score = Array3::<f32>::from_elem((4, 4, 4), -10.0);
        score.slice_mut(s![1..3, 1..3, 1..3]).fill(10.0);
        let logits = logits_from_scores(&[score]);

        let rec = MaskReconstructor::new(SegMode::Bet)
            .reconstruct(logits, Some([8, 6, 4]))
            .unwrap();
        assert_eq!(rec.labels.dim(), (8, 6, 4));
        assert!(rec.labels.iter().all(|&v| v <= 1));
        assert_eq!(rec.probabilities.dim(), (1, 4, 4, 4));
    }

    #[test]
    fn test_no_channels() {
        let logits = Array4::<f32>::zeros((0, 2, 2, 2));
        assert!(matches!(
            MaskReconstructor::new(SegMode::Bet).reconstruct(logits, None),
            Err(Error::ModeMismatch(_))
        ));
    }
}
