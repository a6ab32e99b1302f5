//! # voxenc
//!
//! A parcel-based voxel encoding model and its training loop.
//!
//! Stimuli pass through an opaque backbone and a transformer-style decoder
//! over learned parcel queries; a shared readout head projects each parcel
//! token to voxel space, masked to the parcel's own voxels. Evaluation
//! reconstructs ("unwraps") slot-layout predictions back into voxel space,
//! restricted to a metaparcel of interest.
//!
//! ## Quick Start
//!
//! ```
//! use voxenc::prelude::*;
//! use voxenc::experiments::synthetic::{
//!     synthetic_batches, synthetic_geometry, MeanFieldDecoder, PooledBackbone, SyntheticConfig,
//! };
//!
//! let syn = SyntheticConfig::default();
//! let geometry = synthetic_geometry(&syn);
//! let mut model = BrainEncoder::new(
//!     EncoderConfig::new(syn.hidden_dim).with_seed(syn.seed),
//!     &geometry,
//!     PooledBackbone::new(syn.image_channels, syn.hidden_dim, syn.seed),
//!     MeanFieldDecoder::new(),
//! );
//!
//! let batches = synthetic_batches(&geometry, &syn, 4, 4);
//! let cfg = TrainerConfig::default().with_metaparcel(1);
//! let stats = train_one_epoch(
//!     &mut model,
//!     &SumSquaredError,
//!     &mut Sgd::new(0.05),
//!     batches,
//!     &geometry,
//!     &cfg,
//!     &mut NullLogger,
//!     0,
//! )
//! .unwrap();
//! assert!(stats.average("loss").unwrap().is_finite());
//! ```
//!
//! ## Feature Flags
//!
//! - `parallel`: sharded evaluation via rayon
//! - `serde` (default): serialization for configs and metric snapshots
//!
//! ## Modules
//!
//! - [`parcels`]: voxel/parcel geometry and masks
//! - [`readout`]: the shared masked readout head and its gradients
//! - [`recon`]: parcel-slot packing and metaparcel unwrap
//! - [`encoder`]: the model and its collaborator traits
//! - [`engine`]: training and evaluation loops
//! - [`metrics`]: smoothed meters and mergeable snapshots
//! - [`storage`]: checkpoint persistence

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/parcels.rs"]
pub mod parcels;

#[path = "core/readout.rs"]
pub mod readout;

#[path = "core/recon.rs"]
pub mod recon;

#[path = "core/metrics.rs"]
pub mod metrics;

#[path = "core/encoder.rs"]
pub mod encoder;

#[path = "core/engine.rs"]
pub mod engine;

#[path = "core/storage.rs"]
pub mod storage;

pub mod experiments;

/// Prelude module for convenient imports.
///
/// ```
/// use voxenc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::encoder::{
        Backbone, BrainEncoder, EncoderConfig, EncoderOutput, FeatureLevel, PaddedBatch,
        ParcelDecoder,
    };
    pub use crate::engine::{
        evaluate, pearson, train_one_epoch, Criterion, EpochStats, EvalOutcome, LogFacadeLogger,
        NullLogger, Optimizer, RunLogger, Sgd, SumSquaredError, TrainError, TrainerConfig,
    };
    pub use crate::metrics::{MeterSnapshot, MetricTracker, SmoothedValue, TrackerSnapshot};
    pub use crate::parcels::{GeometryError, ParcelGeometry};
    pub use crate::readout::{ReadoutGradients, ReadoutHead, ReadoutState};
    pub use crate::recon::{pack_parcel_slots, unwrap_metaparcel};
    pub use crate::storage::{CheckpointError, EncoderWeights};
    #[cfg(feature = "parallel")]
    pub use crate::engine::evaluate_sharded;
}
