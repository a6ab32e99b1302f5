//! Parcel geometry: the static mapping between voxels and parcels.
//!
//! A parcel is an ordered list of voxel indices into one hemisphere's voxel
//! space. Parcels have variable sizes; the geometry also carries a per-voxel
//! metaparcel label used to restrict scoring to one anatomical subset.
//!
//! All structural validation happens here, at construction time, before any
//! model is built or any training step runs.

use hashbrown::HashSet;
use ndarray::Array2;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("parcel {parcel}: voxel index {index} out of range (voxel space has {num_voxels})")]
    VoxelIndexOutOfRange {
        parcel: usize,
        index: usize,
        num_voxels: usize,
    },
    #[error("parcel {parcel}: voxel index {index} appears more than once")]
    DuplicateVoxelInParcel { parcel: usize, index: usize },
    #[error("labels cover {got} voxels, expected {expected}")]
    LabelLength { got: usize, expected: usize },
}

/// Immutable voxel/parcel layout for one hemisphere.
///
/// Owns the per-parcel voxel index lists, the per-voxel metaparcel labels,
/// and the derived slot-validity mask. Everything downstream (readout mask,
/// slot packing, reconstruction) is a pure function of this.
#[derive(Debug, Clone)]
pub struct ParcelGeometry {
    parcels: Vec<Vec<usize>>,
    num_hemi_voxels: usize,
    max_parcel_size: usize,
    labels: Vec<u32>,
}

impl ParcelGeometry {
    /// Validates and freezes a parcel layout.
    ///
    /// Fails fast on any out-of-range voxel index or a duplicate index within
    /// a single parcel. A voxel claimed by more than one parcel is allowed
    /// structurally (contributions become additive in the readout) but is
    /// reported with a warning, since atlases are expected to be disjoint.
    pub fn new(
        parcels: Vec<Vec<usize>>,
        num_hemi_voxels: usize,
        labels: Vec<u32>,
    ) -> Result<Self, GeometryError> {
        if labels.len() != num_hemi_voxels {
            return Err(GeometryError::LabelLength {
                got: labels.len(),
                expected: num_hemi_voxels,
            });
        }

        let mut owners = vec![0u32; num_hemi_voxels];
        let mut seen = HashSet::new();
        for (p, parcel) in parcels.iter().enumerate() {
            seen.clear();
            for &v in parcel {
                if v >= num_hemi_voxels {
                    return Err(GeometryError::VoxelIndexOutOfRange {
                        parcel: p,
                        index: v,
                        num_voxels: num_hemi_voxels,
                    });
                }
                if !seen.insert(v) {
                    return Err(GeometryError::DuplicateVoxelInParcel { parcel: p, index: v });
                }
                owners[v] += 1;
            }
        }

        let shared = owners.iter().filter(|&&c| c > 1).count();
        if shared > 0 {
            log::warn!(
                "{shared} voxels belong to more than one parcel; their readout \
                 contributions will sum"
            );
        }

        let max_parcel_size = parcels.iter().map(Vec::len).max().unwrap_or(0);

        Ok(Self {
            parcels,
            num_hemi_voxels,
            max_parcel_size,
            labels,
        })
    }

    pub fn num_parcels(&self) -> usize {
        self.parcels.len()
    }

    pub fn num_hemi_voxels(&self) -> usize {
        self.num_hemi_voxels
    }

    pub fn max_parcel_size(&self) -> usize {
        self.max_parcel_size
    }

    pub fn parcels(&self) -> &[Vec<usize>] {
        &self.parcels
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Number of voxel slots covered by some parcel. This is the constant
    /// the training loss is divided by, so loss magnitudes stay comparable
    /// across geometries of different coverage.
    pub fn num_valid_voxels(&self) -> usize {
        self.parcels.iter().map(Vec::len).sum()
    }

    /// Slot-validity mask of shape (num_parcels, max_parcel_size).
    /// Entry (p, s) is true iff slot s of parcel p holds a real voxel,
    /// false for padding slots.
    pub fn slot_mask(&self) -> Array2<bool> {
        let mut mask = Array2::from_elem((self.parcels.len(), self.max_parcel_size), false);
        for (p, parcel) in self.parcels.iter().enumerate() {
            for s in 0..parcel.len() {
                mask[[p, s]] = true;
            }
        }
        mask
    }

    /// Membership matrix of shape (num_voxels, num_parcels): entry (v, p)
    /// is 1.0 iff voxel v belongs to parcel p. Built once; the readout head
    /// owns the result and never mutates it.
    pub fn membership_mask(&self) -> Array2<f32> {
        let mut mask = Array2::zeros((self.num_hemi_voxels, self.parcels.len()));
        for (p, parcel) in self.parcels.iter().enumerate() {
            for &v in parcel {
                mask[[v, p]] = 1.0;
            }
        }
        mask
    }

    /// Voxel indices whose metaparcel label equals `label`, in voxel order.
    pub fn metaparcel_voxels(&self, label: u32) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == label)
            .map(|(v, _)| v)
            .collect()
    }
}
