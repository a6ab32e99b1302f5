//! Checkpoint persistence for the learned parameters.
//!
//! Format: 8-byte magic, u32 version, then the three parameter shapes
//! (num_parcels, hidden_dim, num_voxels) as u32 LE, then one lz4 block
//! holding queries, readout weight and readout bias as f32 LE in that
//! order. The backbone and decoder persist themselves; only what the core
//! owns goes in the file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::encoder::{Backbone, BrainEncoder, ParcelDecoder};

pub const MAGIC: &[u8; 8] = b"VXENC001";
pub const VERSION_CURRENT: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a checkpoint file (bad magic)")]
    BadMagic,
    #[error("unsupported checkpoint version {0}")]
    UnsupportedVersion(u32),
    #[error("checkpoint shape ({parcels}, {hidden}, {voxels}) does not match the model")]
    ShapeMismatch {
        parcels: usize,
        hidden: usize,
        voxels: usize,
    },
    #[error("checkpoint payload is corrupt: {0}")]
    Corrupt(String),
}

/// The core-owned parameters of a [`BrainEncoder`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderWeights {
    /// (num_parcels, hidden_dim)
    pub queries: Array2<f32>,
    /// (hidden_dim, num_voxels)
    pub weight: Array2<f32>,
    /// (num_voxels)
    pub bias: Array1<f32>,
}

fn push_f32s(buf: &mut Vec<u8>, values: impl Iterator<Item = f32>) {
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn take_f32s(bytes: &[u8], offset: &mut usize, n: usize) -> Result<Vec<f32>, CheckpointError> {
    let end = offset
        .checked_add(n * 4)
        .filter(|&e| e <= bytes.len())
        .ok_or_else(|| CheckpointError::Corrupt("payload truncated".into()))?;
    let out = bytes[*offset..end]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    *offset = end;
    Ok(out)
}

pub fn write_weights<W: Write>(mut w: W, weights: &EncoderWeights) -> Result<(), CheckpointError> {
    let (parcels, hidden) = weights.queries.dim();
    let voxels = weights.bias.len();

    w.write_all(MAGIC)?;
    w.write_all(&VERSION_CURRENT.to_le_bytes())?;
    w.write_all(&(parcels as u32).to_le_bytes())?;
    w.write_all(&(hidden as u32).to_le_bytes())?;
    w.write_all(&(voxels as u32).to_le_bytes())?;

    let mut payload = Vec::with_capacity(4 * (parcels * hidden + hidden * voxels + voxels));
    push_f32s(&mut payload, weights.queries.iter().copied());
    push_f32s(&mut payload, weights.weight.iter().copied());
    push_f32s(&mut payload, weights.bias.iter().copied());

    let compressed = compress_prepend_size(&payload);
    w.write_all(&compressed)?;
    w.flush()?;
    Ok(())
}

pub fn read_weights<R: Read>(mut r: R) -> Result<EncoderWeights, CheckpointError> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(CheckpointError::BadMagic);
    }

    let mut word = [0u8; 4];
    r.read_exact(&mut word)?;
    let version = u32::from_le_bytes(word);
    if version != VERSION_CURRENT {
        return Err(CheckpointError::UnsupportedVersion(version));
    }

    r.read_exact(&mut word)?;
    let parcels = u32::from_le_bytes(word) as usize;
    r.read_exact(&mut word)?;
    let hidden = u32::from_le_bytes(word) as usize;
    r.read_exact(&mut word)?;
    let voxels = u32::from_le_bytes(word) as usize;

    let mut compressed = Vec::new();
    r.read_to_end(&mut compressed)?;
    let payload = decompress_size_prepended(&compressed)
        .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;

    let expected = 4 * (parcels * hidden + hidden * voxels + voxels);
    if payload.len() != expected {
        return Err(CheckpointError::Corrupt(format!(
            "payload is {} bytes, expected {expected}",
            payload.len()
        )));
    }

    let mut offset = 0;
    let queries = take_f32s(&payload, &mut offset, parcels * hidden)?;
    let weight = take_f32s(&payload, &mut offset, hidden * voxels)?;
    let bias = take_f32s(&payload, &mut offset, voxels)?;

    Ok(EncoderWeights {
        queries: Array2::from_shape_vec((parcels, hidden), queries)
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?,
        weight: Array2::from_shape_vec((hidden, voxels), weight)
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?,
        bias: Array1::from_vec(bias),
    })
}

impl<B: Backbone, D: ParcelDecoder> BrainEncoder<B, D> {
    pub fn weights(&self) -> EncoderWeights {
        EncoderWeights {
            queries: self.queries.clone(),
            weight: self.readout.weight.clone(),
            bias: self.readout.bias.clone(),
        }
    }

    pub fn save_weights_to<P: AsRef<Path>>(&self, path: P) -> Result<(), CheckpointError> {
        let file = BufWriter::new(File::create(path)?);
        write_weights(file, &self.weights())
    }

    /// Loads parameters from a checkpoint, rejecting any shape that does
    /// not match this model's geometry.
    pub fn load_weights_from<P: AsRef<Path>>(&mut self, path: P) -> Result<(), CheckpointError> {
        let file = BufReader::new(File::open(path)?);
        let weights = read_weights(file)?;

        let (parcels, hidden) = weights.queries.dim();
        let voxels = weights.bias.len();
        if self.queries.dim() != (parcels, hidden)
            || self.readout.weight.dim() != (hidden, voxels)
        {
            return Err(CheckpointError::ShapeMismatch {
                parcels,
                hidden,
                voxels,
            });
        }

        self.queries = weights.queries;
        self.readout.weight = weights.weight;
        self.readout.bias = weights.bias;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_weights() -> EncoderWeights {
        EncoderWeights {
            queries: Array2::from_shape_fn((3, 4), |(p, h)| p as f32 + 0.1 * h as f32),
            weight: Array2::from_shape_fn((4, 6), |(h, v)| 0.5 * h as f32 - 0.2 * v as f32),
            bias: Array1::from_shape_fn(6, |v| v as f32 * 0.01),
        }
    }

    #[test]
    fn roundtrip_preserves_every_parameter() {
        let weights = sample_weights();
        let mut buf = Vec::new();
        write_weights(&mut buf, &weights).unwrap();
        let restored = read_weights(&buf[..]).unwrap();
        assert_eq!(weights, restored);
    }

    #[test]
    fn rejects_foreign_files() {
        let err = read_weights(&b"definitely not a checkpoint"[..]).unwrap_err();
        assert!(matches!(err, CheckpointError::BadMagic));
    }

    #[test]
    fn rejects_future_versions() {
        let weights = sample_weights();
        let mut buf = Vec::new();
        write_weights(&mut buf, &weights).unwrap();
        buf[8..12].copy_from_slice(&99u32.to_le_bytes());
        let err = read_weights(&buf[..]).unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedVersion(99)));
    }

    #[test]
    fn rejects_truncated_payload() {
        let weights = sample_weights();
        let mut buf = Vec::new();
        write_weights(&mut buf, &weights).unwrap();
        buf.truncate(buf.len() - 5);
        assert!(read_weights(&buf[..]).is_err());
    }
}
