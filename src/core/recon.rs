//! Parcel-slot packing and the inverse "unwrap" reconstruction.
//!
//! Evaluation scores live in voxel space, but per-parcel predictions travel
//! in a fixed-width slot layout (batch, num_parcels, max_parcel_size), with
//! shorter parcels padded out. `pack_parcel_slots` builds that layout from a
//! dense voxel tensor; `unwrap_metaparcel` inverts it and restricts the
//! result to one metaparcel.
//!
//! Every voxel covered by some parcel receives exactly one write (direct
//! assignment, never accumulation), so padding slots cannot corrupt the
//! output. Voxels covered by no parcel keep the zero initialization:
//! unscored voxels read as zero, not as NaN or an error.

use ndarray::{Array2, Array3};

use crate::parcels::ParcelGeometry;

/// dense (batch, num_voxels) -> slots (batch, num_parcels, max_parcel_size).
/// Slot (b, p, s) holds the value of the s-th voxel of parcel p; padding
/// slots stay zero and are excluded by the geometry's slot mask.
pub fn pack_parcel_slots(dense: &Array2<f32>, geometry: &ParcelGeometry) -> Array3<f32> {
    let batch = dense.shape()[0];
    let mut slots = Array3::zeros((batch, geometry.num_parcels(), geometry.max_parcel_size()));
    for (p, parcel) in geometry.parcels().iter().enumerate() {
        for (s, &v) in parcel.iter().enumerate() {
            for b in 0..batch {
                slots[[b, p, s]] = dense[[b, v]];
            }
        }
    }
    slots
}

/// slots (batch, num_parcels, max_parcel_size) -> (batch, subset_size),
/// where the subset is every voxel whose label equals `metaparcel`, in voxel
/// order.
///
/// Scatters each parcel's valid (non-padded) slots back to their voxel
/// positions across the whole batch, then selects the metaparcel columns.
/// Iteration is parcel-major, matching the slot layout's natural order.
pub fn unwrap_metaparcel(
    slots: &Array3<f32>,
    geometry: &ParcelGeometry,
    metaparcel: u32,
) -> Array2<f32> {
    let batch = slots.shape()[0];
    let mut recon = Array2::zeros((batch, geometry.num_hemi_voxels()));
    for (p, parcel) in geometry.parcels().iter().enumerate() {
        for (s, &v) in parcel.iter().enumerate() {
            for b in 0..batch {
                recon[[b, v]] = slots[[b, p, s]];
            }
        }
    }

    let subset = geometry.metaparcel_voxels(metaparcel);
    Array2::from_shape_fn((batch, subset.len()), |(b, i)| recon[[b, subset[i]]])
}
