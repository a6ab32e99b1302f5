//! A self-contained synthetic task: random stimuli whose targets are a
//! fixed linear function of per-channel pixel means. The backbone and
//! decoder here are the simplest collaborators that satisfy the traits,
//! small enough to train in a test yet exercising every shape contract
//! (variable-size samples, padding masks, the full backward path).

use ndarray::{Array2, Array3, Array4, Axis};

use crate::encoder::{Backbone, EncoderError, FeatureLevel, PaddedBatch, ParcelDecoder};
use crate::parcels::ParcelGeometry;
use crate::prng::Prng;

#[derive(Debug, Clone, Copy)]
pub struct SyntheticConfig {
    pub num_parcels: usize,
    pub num_hemi_voxels: usize,
    pub image_channels: usize,
    pub hidden_dim: usize,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            num_parcels: 4,
            num_hemi_voxels: 24,
            image_channels: 3,
            hidden_dim: 8,
            seed: 42,
        }
    }
}

/// Random disjoint parcellation with uneven parcel sizes. The last voxel is
/// left out of every parcel so the unscored-voxel path stays exercised.
/// Labels split the voxel range into metaparcels 1 (lower half) and 2.
pub fn synthetic_geometry(cfg: &SyntheticConfig) -> ParcelGeometry {
    let mut rng = Prng::new(cfg.seed);
    let mut voxels: Vec<usize> = (0..cfg.num_hemi_voxels.saturating_sub(1)).collect();
    rng.shuffle(&mut voxels);

    let mut parcels: Vec<Vec<usize>> = vec![Vec::new(); cfg.num_parcels];
    for (i, v) in voxels.into_iter().enumerate() {
        parcels[i % cfg.num_parcels].push(v);
    }

    let labels = (0..cfg.num_hemi_voxels)
        .map(|v| if v < cfg.num_hemi_voxels / 2 { 1 } else { 2 })
        .collect();

    ParcelGeometry::new(parcels, cfg.num_hemi_voxels, labels)
        .expect("synthetic partition is in range and duplicate-free")
}

/// Fixed random projection of masked per-channel pixel means into the
/// hidden dimension. Forward-only, like any frozen feature extractor.
pub struct PooledBackbone {
    // (hidden_dim, in_channels)
    projection: Array2<f32>,
    in_channels: usize,
}

impl PooledBackbone {
    pub fn new(in_channels: usize, hidden_dim: usize, seed: u64) -> Self {
        let mut rng = Prng::new(seed ^ 0xBACB0E);
        let std = 1.0 / (in_channels as f32).sqrt();
        let projection = Array2::from_shape_fn((hidden_dim, in_channels), |_| {
            rng.next_gaussian_f32() * std
        });
        Self {
            projection,
            in_channels,
        }
    }
}

impl Backbone for PooledBackbone {
    fn forward(&self, batch: &PaddedBatch) -> Result<Vec<FeatureLevel>, EncoderError> {
        let (b, c, h, w) = batch.tensors.dim();
        if c != self.in_channels {
            return Err(EncoderError::ChannelMismatch {
                expected: self.in_channels,
                got: c,
            });
        }

        // Mean over each sample's own (non-padded) pixels, per channel.
        let mut pooled = Array2::zeros((b, c));
        for i in 0..b {
            let mut valid = 0u32;
            for y in 0..h {
                for x in 0..w {
                    if !batch.mask[[i, y, x]] {
                        valid += 1;
                        for ch in 0..c {
                            pooled[[i, ch]] += batch.tensors[[i, ch, y, x]];
                        }
                    }
                }
            }
            if valid > 0 {
                for ch in 0..c {
                    pooled[[i, ch]] /= valid as f32;
                }
            }
        }

        let hidden = self.projection.shape()[0];
        let projected = pooled.dot(&self.projection.t());
        let features = Array4::from_shape_fn((b, hidden, 1, 1), |(i, k, _, _)| projected[[i, k]]);
        let pos = Array4::zeros((b, hidden, 1, 1));
        let mask = Array3::from_elem((b, 1, 1), false);
        Ok(vec![FeatureLevel {
            features,
            pos,
            mask,
        }])
    }
}

/// Degenerate single-layer decoder: each parcel token is its query embedding
/// shifted by the sample's pooled feature. The token gradient passes through
/// to the queries unchanged, summed over the batch.
pub struct MeanFieldDecoder;

impl MeanFieldDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MeanFieldDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ParcelDecoder for MeanFieldDecoder {
    fn forward(
        &self,
        level: &FeatureLevel,
        queries: &Array2<f32>,
        _return_intermediate: bool,
    ) -> Result<Vec<Array3<f32>>, EncoderError> {
        let batch = level.features.shape()[0];
        let (num_parcels, hidden) = queries.dim();
        if level.features.shape()[1] != hidden {
            return Err(EncoderError::ChannelMismatch {
                expected: hidden,
                got: level.features.shape()[1],
            });
        }

        let tokens = Array3::from_shape_fn((batch, num_parcels, hidden), |(b, p, k)| {
            queries[[p, k]] + level.features[[b, k, 0, 0]]
        });
        Ok(vec![tokens])
    }

    fn backward(&mut self, grad_tokens: &Array3<f32>) -> Result<Array2<f32>, EncoderError> {
        Ok(grad_tokens.sum_axis(Axis(0)))
    }
}

/// Batches of variable-size stimuli with targets that are linear in the
/// per-channel pixel means (so the task is learnable by the pooled
/// backbone). Target columns for uncovered voxels are zeroed to match the
/// readout's output there.
pub fn synthetic_batches(
    geometry: &ParcelGeometry,
    cfg: &SyntheticConfig,
    num_batches: usize,
    batch_size: usize,
) -> Vec<(PaddedBatch, Array2<f32>)> {
    let mut rng = Prng::new(cfg.seed.wrapping_add(1));
    let num_voxels = geometry.num_hemi_voxels();

    // Fixed ground-truth map from channel means to voxel responses.
    let truth = Array2::from_shape_fn((cfg.image_channels, num_voxels), |_| {
        rng.next_gaussian_f32()
    });
    let mut covered = vec![false; num_voxels];
    for parcel in geometry.parcels() {
        for &v in parcel {
            covered[v] = true;
        }
    }

    let mut batches = Vec::with_capacity(num_batches);
    for bi in 0..num_batches {
        let mut samples = Vec::with_capacity(batch_size);
        let mut means = Array2::zeros((batch_size, cfg.image_channels));
        for si in 0..batch_size {
            let h = 4 + (bi + si) % 3;
            let w = 5 + (bi * si) % 2;
            let sample = Array3::from_shape_fn((cfg.image_channels, h, w), |(c, _, _)| {
                rng.next_gaussian_f32() * 0.5 + c as f32 * 0.1
            });
            for c in 0..cfg.image_channels {
                means[[si, c]] = sample.index_axis(Axis(0), c).mean().unwrap_or(0.0);
            }
            samples.push(sample);
        }

        let mut target = means.dot(&truth);
        for (v, &is_covered) in covered.iter().enumerate() {
            if !is_covered {
                target.column_mut(v).fill(0.0);
            }
        }

        let padded = PaddedBatch::from_list(&samples)
            .expect("synthetic samples share a channel count and are non-empty");
        batches.push((padded, target));
    }
    batches
}
