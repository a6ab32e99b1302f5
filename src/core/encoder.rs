//! Encoder orchestration: backbone features -> decoder tokens -> readout.
//!
//! The backbone and the transformer decoder are external collaborators
//! behind small traits; this module owns only what the core needs to own:
//! the learned parcel query embeddings, the readout head, and the shape
//! contracts between the pieces. Shape violations surface on the first
//! forward pass as errors, never as silent coercions.

use ndarray::{Array2, Array3, Array4};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::parcels::ParcelGeometry;
use crate::prng::Prng;
use crate::readout::{ReadoutHead, ReadoutState};

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("backbone returned an empty feature pyramid")]
    EmptyPyramid,
    #[error("decoder returned no layers")]
    NoDecoderLayers,
    #[error("feature channels ({got}) do not match the configured hidden dim ({expected})")]
    ChannelMismatch { expected: usize, got: usize },
    #[error("token tensor shape {got:?} does not match expected {expected:?}")]
    TokenShape {
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },
    #[error("batch has inconsistent shapes: {0}")]
    BatchShape(String),
}

/// A list-shaped stimulus batch padded to a common spatial size, with a
/// per-pixel mask marking the padding (true = padded, matching the decoder
/// attention convention).
#[derive(Debug, Clone)]
pub struct PaddedBatch {
    pub tensors: Array4<f32>,
    pub mask: Array3<bool>,
}

impl PaddedBatch {
    pub fn new(tensors: Array4<f32>, mask: Array3<bool>) -> Result<Self, EncoderError> {
        let (b, _, h, w) = tensors.dim();
        if mask.dim() != (b, h, w) {
            return Err(EncoderError::BatchShape(format!(
                "mask {:?} vs tensors {:?}",
                mask.dim(),
                tensors.dim()
            )));
        }
        Ok(Self { tensors, mask })
    }

    /// Pads variable-size (channels, height, width) samples to the batch
    /// maximum. Pixels beyond a sample's own extent are zero-filled and
    /// masked out.
    pub fn from_list(samples: &[Array3<f32>]) -> Result<Self, EncoderError> {
        let first = samples
            .first()
            .ok_or_else(|| EncoderError::BatchShape("empty sample list".into()))?;
        let channels = first.shape()[0];
        let mut max_h = 0;
        let mut max_w = 0;
        for (i, s) in samples.iter().enumerate() {
            if s.shape()[0] != channels {
                return Err(EncoderError::BatchShape(format!(
                    "sample {i} has {} channels, expected {channels}",
                    s.shape()[0]
                )));
            }
            max_h = max_h.max(s.shape()[1]);
            max_w = max_w.max(s.shape()[2]);
        }

        let batch = samples.len();
        let mut tensors = Array4::zeros((batch, channels, max_h, max_w));
        let mut mask = Array3::from_elem((batch, max_h, max_w), true);
        for (i, s) in samples.iter().enumerate() {
            let (_, h, w) = s.dim();
            for c in 0..channels {
                for y in 0..h {
                    for x in 0..w {
                        tensors[[i, c, y, x]] = s[[c, y, x]];
                    }
                }
            }
            for y in 0..h {
                for x in 0..w {
                    mask[[i, y, x]] = false;
                }
            }
        }
        Ok(Self { tensors, mask })
    }

    pub fn batch_size(&self) -> usize {
        self.tensors.shape()[0]
    }
}

/// One resolution level of the backbone's output pyramid.
#[derive(Debug, Clone)]
pub struct FeatureLevel {
    /// (batch, channels, height, width)
    pub features: Array4<f32>,
    /// Positional encoding with the same shape as `features`.
    pub pos: Array4<f32>,
    /// Per-pixel padding mask (batch, height, width), true = padded.
    pub mask: Array3<bool>,
}

/// Opaque feature extractor. Returns an ordered pyramid at decreasing
/// resolution; the core consumes the last (coarsest) level. The core never
/// propagates gradients into the backbone: a backbone that trains itself
/// does so behind this trait.
pub trait Backbone {
    fn forward(&self, batch: &PaddedBatch) -> Result<Vec<FeatureLevel>, EncoderError>;
}

/// Opaque transformer decoder over the parcel query set.
///
/// `forward` returns one (batch, num_parcels, hidden_dim) token tensor per
/// decoder layer; the core consumes the last. `backward` receives the
/// gradient with respect to the last layer's tokens, applies whatever
/// internal updates the decoder wants, and returns the gradient with
/// respect to the query embeddings so the core can update them (the core
/// owns the queries; the decoder owns everything else).
pub trait ParcelDecoder {
    fn forward(
        &self,
        level: &FeatureLevel,
        queries: &Array2<f32>,
        return_intermediate: bool,
    ) -> Result<Vec<Array3<f32>>, EncoderError>;

    fn backward(&mut self, grad_tokens: &Array3<f32>) -> Result<Array2<f32>, EncoderError>;
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EncoderConfig {
    pub hidden_dim: usize,
    /// If set, makes weight initialization reproducible.
    pub seed: Option<u64>,
}

impl EncoderConfig {
    pub fn new(hidden_dim: usize) -> Self {
        Self {
            hidden_dim,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// The model's forward output: a dense voxel-space prediction per sample.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub pred: Array2<f32>,
}

/// Parcel-query encoding model: backbone -> decoder -> readout.
pub struct BrainEncoder<B, D> {
    cfg: EncoderConfig,
    pub(crate) backbone: B,
    pub(crate) decoder: D,
    /// Learned query embeddings, (num_parcels, hidden_dim).
    pub(crate) queries: Array2<f32>,
    pub(crate) readout: ReadoutHead,
    num_parcels: usize,
}

impl<B: Backbone, D: ParcelDecoder> BrainEncoder<B, D> {
    pub fn new(cfg: EncoderConfig, geometry: &ParcelGeometry, backbone: B, decoder: D) -> Self {
        let mut rng = Prng::new(cfg.seed.unwrap_or(1));
        let num_parcels = geometry.num_parcels();
        let std = 1.0 / (cfg.hidden_dim as f32).sqrt();
        let queries = Array2::from_shape_fn((num_parcels, cfg.hidden_dim), |_| {
            rng.next_gaussian_f32() * std
        });
        let readout = ReadoutHead::new(geometry, cfg.hidden_dim, &mut rng);
        Self {
            cfg,
            backbone,
            decoder,
            queries,
            readout,
            num_parcels,
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.cfg.hidden_dim
    }

    pub fn num_parcels(&self) -> usize {
        self.num_parcels
    }

    pub fn queries(&self) -> &Array2<f32> {
        &self.queries
    }

    pub fn readout(&self) -> &ReadoutHead {
        &self.readout
    }

    /// Backbone -> coarsest level -> decoder -> last layer -> tokens.
    fn parcel_tokens(&self, batch: &PaddedBatch) -> Result<Array3<f32>, EncoderError> {
        let levels = self.backbone.forward(batch)?;
        let level = levels.last().ok_or(EncoderError::EmptyPyramid)?;

        let channels = level.features.shape()[1];
        if channels != self.cfg.hidden_dim {
            return Err(EncoderError::ChannelMismatch {
                expected: self.cfg.hidden_dim,
                got: channels,
            });
        }

        let layers = self.decoder.forward(level, &self.queries, true)?;
        let tokens = layers.into_iter().last().ok_or(EncoderError::NoDecoderLayers)?;

        let got = (tokens.shape()[0], tokens.shape()[1], tokens.shape()[2]);
        let expected = (batch.batch_size(), self.num_parcels, self.cfg.hidden_dim);
        if got != expected {
            return Err(EncoderError::TokenShape { expected, got });
        }
        Ok(tokens)
    }

    pub fn forward(&self, batch: &PaddedBatch) -> Result<EncoderOutput, EncoderError> {
        let tokens = self.parcel_tokens(batch)?;
        Ok(EncoderOutput {
            pred: self.readout.forward(&tokens),
        })
    }

    /// Forward pass that keeps the activations the backward pass needs.
    pub fn forward_with_state(
        &self,
        batch: &PaddedBatch,
    ) -> Result<(EncoderOutput, ReadoutState), EncoderError> {
        let tokens = self.parcel_tokens(batch)?;
        let (pred, state) = self.readout.forward_with_state(&tokens);
        Ok((EncoderOutput { pred }, state))
    }
}
