//! Learned readout from parcel tokens to dense voxel predictions.
//!
//! One shared linear map (hidden_dim -> num_voxels) is applied to every
//! parcel token independently; the membership mask then zeroes, for each
//! parcel's projection, every voxel the parcel does not own, and the parcel
//! axis is summed away. For a disjoint atlas this means each voxel takes its
//! value from its single owning parcel's projection; overlapping parcels sum
//! their contributions (intended but fragile, see ParcelGeometry::new).
//!
//! Training runs without an autograd framework: `forward_with_state` caches
//! the token tensor and `backward` produces exact analytic gradients for the
//! weight, the bias, and the incoming tokens.

use ndarray::{Array1, Array2, Array3, Axis};

use crate::parcels::ParcelGeometry;
use crate::prng::Prng;

pub struct ReadoutHead {
    // (hidden_dim, num_voxels)
    pub(crate) weight: Array2<f32>,
    // (num_voxels)
    pub(crate) bias: Array1<f32>,
    // (num_voxels, num_parcels), fixed at construction
    mask: Array2<f32>,
    hidden_dim: usize,
}

/// Cached activations from a forward pass, needed by `backward`.
pub struct ReadoutState {
    tokens: Array3<f32>,
}

pub struct ReadoutGradients {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
    /// Gradient with respect to the incoming parcel tokens, handed to the
    /// decoder so it can continue the backward pass.
    pub tokens: Array3<f32>,
}

impl ReadoutHead {
    pub fn new(geometry: &ParcelGeometry, hidden_dim: usize, rng: &mut Prng) -> Self {
        let num_voxels = geometry.num_hemi_voxels();
        let std = 1.0 / (hidden_dim as f32).sqrt();
        let weight =
            Array2::from_shape_fn((hidden_dim, num_voxels), |_| rng.next_gaussian_f32() * std);
        let bias = Array1::zeros(num_voxels);
        Self {
            weight,
            bias,
            mask: geometry.membership_mask(),
            hidden_dim,
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn num_voxels(&self) -> usize {
        self.bias.len()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }

    pub fn mask(&self) -> &Array2<f32> {
        &self.mask
    }

    /// tokens (batch, num_parcels, hidden_dim) -> prediction (batch, num_voxels).
    /// Pure; allocates only the output.
    pub fn forward(&self, tokens: &Array3<f32>) -> Array2<f32> {
        let batch = tokens.shape()[0];
        let num_voxels = self.num_voxels();
        let mask_t = self.mask.t();

        let mut pred = Array2::zeros((batch, num_voxels));
        for b in 0..batch {
            // (P, H) . (H, V) -> (P, V), bias broadcast over parcels.
            let proj = tokens.index_axis(Axis(0), b).dot(&self.weight) + &self.bias;
            let masked = proj * &mask_t;
            pred.row_mut(b).assign(&masked.sum_axis(Axis(0)));
        }
        pred
    }

    pub fn forward_with_state(&self, tokens: &Array3<f32>) -> (Array2<f32>, ReadoutState) {
        let pred = self.forward(tokens);
        (
            pred,
            ReadoutState {
                tokens: tokens.clone(),
            },
        )
    }

    /// Exact gradients for a sum-over-batch loss, given d loss / d prediction.
    pub fn backward(&self, state: &ReadoutState, grad_pred: &Array2<f32>) -> ReadoutGradients {
        let batch = state.tokens.shape()[0];
        let num_parcels = state.tokens.shape()[1];
        let mask_t = self.mask.t();
        // How many parcels claim each voxel; scales the bias gradient.
        let mask_row_sum = self.mask.sum_axis(Axis(1));

        let mut grad_weight = Array2::zeros(self.weight.raw_dim());
        let mut grad_bias = Array1::zeros(self.bias.raw_dim());
        let mut grad_tokens = Array3::zeros((batch, num_parcels, self.hidden_dim));

        for b in 0..batch {
            let g_row = grad_pred.index_axis(Axis(0), b);
            // Per-parcel, per-voxel upstream gradient: mask[v,p] * g[v].
            let masked_grad = &mask_t * &g_row;

            let tokens_b = state.tokens.index_axis(Axis(0), b);
            grad_weight = grad_weight + tokens_b.t().dot(&masked_grad);
            grad_bias = grad_bias + &(&g_row * &mask_row_sum);
            grad_tokens
                .index_axis_mut(Axis(0), b)
                .assign(&masked_grad.dot(&self.weight.t()));
        }

        ReadoutGradients {
            weight: grad_weight,
            bias: grad_bias,
            tokens: grad_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parcels::ParcelGeometry;

    fn geometry(parcels: Vec<Vec<usize>>, num_voxels: usize) -> ParcelGeometry {
        ParcelGeometry::new(parcels, num_voxels, vec![0; num_voxels]).unwrap()
    }

    fn deterministic_head(geom: &ParcelGeometry, hidden_dim: usize) -> ReadoutHead {
        let mut rng = Prng::new(11);
        let mut head = ReadoutHead::new(geom, hidden_dim, &mut rng);
        // Fixed, easily recomputable parameters.
        head.weight =
            Array2::from_shape_fn((hidden_dim, geom.num_hemi_voxels()), |(h, v)| {
                0.1 * (h as f32 + 1.0) + 0.01 * v as f32
            });
        head.bias = Array1::from_shape_fn(geom.num_hemi_voxels(), |v| 0.05 * v as f32);
        head
    }

    fn owner_of(geom: &ParcelGeometry, v: usize) -> usize {
        geom.parcels().iter().position(|p| p.contains(&v)).unwrap()
    }

    #[test]
    fn end_to_end_matches_hand_computation() {
        // Batch 2, parcels {2,3,1} over 6 voxels, hidden_dim 4.
        let geom = geometry(vec![vec![0, 1], vec![2, 3, 4], vec![5]], 6);
        let head = deterministic_head(&geom, 4);

        let tokens = Array3::from_shape_fn((2, 3, 4), |(b, p, h)| {
            0.2 * b as f32 - 0.3 * p as f32 + 0.1 * h as f32
        });
        let pred = head.forward(&tokens);
        assert_eq!(pred.shape(), &[2, 6]);

        // Disjoint atlas: each voxel reads its owning parcel's projection.
        for b in 0..2 {
            for v in 0..6 {
                let p = owner_of(&geom, v);
                let mut expected = head.bias[v];
                for h in 0..4 {
                    expected += tokens[[b, p, h]] * head.weight[[h, v]];
                }
                assert!(
                    (pred[[b, v]] - expected).abs() < 1e-5,
                    "b={b} v={v}: {} vs {}",
                    pred[[b, v]],
                    expected
                );
            }
        }
    }

    #[test]
    fn disjoint_partition_reads_single_owner() {
        // Randomized disjoint partitions: the masked sum must degenerate to
        // "each voxel takes its owner's projection".
        let mut rng = Prng::new(99);
        for trial in 0..10 {
            let num_voxels = 12 + trial;
            let num_parcels = 4;
            let mut voxels: Vec<usize> = (0..num_voxels).collect();
            rng.shuffle(&mut voxels);
            let mut parcels: Vec<Vec<usize>> = vec![Vec::new(); num_parcels];
            for (i, v) in voxels.into_iter().enumerate() {
                parcels[i % num_parcels].push(v);
            }
            let geom = geometry(parcels, num_voxels);
            let head = {
                let mut r = Prng::new(trial as u64 + 1);
                ReadoutHead::new(&geom, 5, &mut r)
            };
            let tokens = Array3::from_shape_fn((2, num_parcels, 5), |(b, p, h)| {
                ((b + 2 * p + 3 * h) as f32 * 0.17).sin()
            });
            let pred = head.forward(&tokens);
            for b in 0..2 {
                for v in 0..num_voxels {
                    let p = owner_of(&geom, v);
                    let mut expected = head.bias[v];
                    for h in 0..5 {
                        expected += tokens[[b, p, h]] * head.weight[[h, v]];
                    }
                    assert!((pred[[b, v]] - expected).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn overlapping_parcels_sum_contributions() {
        // Voxel 1 is claimed by both parcels; its prediction must be the sum
        // of both projections (additive semantics, documented).
        let geom = geometry(vec![vec![0, 1], vec![1, 2]], 3);
        let head = deterministic_head(&geom, 2);
        let tokens =
            Array3::from_shape_fn((1, 2, 2), |(_, p, h)| 1.0 + p as f32 + 0.5 * h as f32);
        let pred = head.forward(&tokens);

        let proj = |p: usize, v: usize| -> f32 {
            let mut acc = head.bias[v];
            for h in 0..2 {
                acc += tokens[[0, p, h]] * head.weight[[h, v]];
            }
            acc
        };
        assert!((pred[[0, 0]] - proj(0, 0)).abs() < 1e-5);
        assert!((pred[[0, 2]] - proj(1, 2)).abs() < 1e-5);
        assert!((pred[[0, 1]] - (proj(0, 1) + proj(1, 1))).abs() < 1e-5);
    }

    #[test]
    fn backward_matches_finite_differences() {
        let geom = geometry(vec![vec![0, 2], vec![1, 3, 4]], 5);
        let hidden = 3;
        let mut head = deterministic_head(&geom, hidden);

        let tokens = Array3::from_shape_fn((2, 2, hidden), |(b, p, h)| {
            0.3 * b as f32 - 0.2 * p as f32 + 0.15 * h as f32
        });
        let target = Array2::from_shape_fn((2, 5), |(b, v)| 0.1 * b as f32 + 0.05 * v as f32);

        // Loss: sum of squared errors.
        let loss = |head: &ReadoutHead, tokens: &Array3<f32>| -> f32 {
            let pred = head.forward(tokens);
            (&pred - &target).mapv(|d| d * d).sum()
        };

        let (pred, state) = head.forward_with_state(&tokens);
        let grad_pred = (&pred - &target).mapv(|d| 2.0 * d);
        let grads = head.backward(&state, &grad_pred);

        let eps = 1e-3;
        // Weight gradient.
        for &(h, v) in &[(0usize, 0usize), (1, 2), (2, 4)] {
            let orig = head.weight[[h, v]];
            head.weight[[h, v]] = orig + eps;
            let up = loss(&head, &tokens);
            head.weight[[h, v]] = orig - eps;
            let down = loss(&head, &tokens);
            head.weight[[h, v]] = orig;
            let numeric = (up - down) / (2.0 * eps);
            assert!(
                (grads.weight[[h, v]] - numeric).abs() < 1e-2,
                "dW[{h},{v}]: analytic {} numeric {}",
                grads.weight[[h, v]],
                numeric
            );
        }
        // Bias gradient.
        for v in [0usize, 3] {
            let orig = head.bias[v];
            head.bias[v] = orig + eps;
            let up = loss(&head, &tokens);
            head.bias[v] = orig - eps;
            let down = loss(&head, &tokens);
            head.bias[v] = orig;
            let numeric = (up - down) / (2.0 * eps);
            assert!((grads.bias[v] - numeric).abs() < 1e-2);
        }
        // Token gradient.
        for &(b, p, h) in &[(0usize, 0usize, 0usize), (1, 1, 2)] {
            let mut bumped = tokens.clone();
            bumped[[b, p, h]] += eps;
            let up = loss(&head, &bumped);
            bumped[[b, p, h]] -= 2.0 * eps;
            let down = loss(&head, &bumped);
            let numeric = (up - down) / (2.0 * eps);
            assert!((grads.tokens[[b, p, h]] - numeric).abs() < 1e-2);
        }
    }
}
