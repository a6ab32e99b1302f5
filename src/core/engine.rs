//! Training and evaluation loops.
//!
//! One controlling thread drives the whole loop; every step is a synchronous
//! tensor computation. The only early exit is a non-finite loss, which is
//! fatal and returned as an error before any parameter update so a diverged
//! run can never keep training or silently restart. Cross-worker metric
//! reduction happens once, at the end, through `TrackerSnapshot::merge`.

use ndarray::{Array2, Axis};
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::encoder::{Backbone, BrainEncoder, EncoderError, PaddedBatch, ParcelDecoder};
use crate::metrics::{MeterSnapshot, MetricTracker, TrackerSnapshot};
use crate::parcels::ParcelGeometry;
use crate::recon::{pack_parcel_slots, unwrap_metaparcel};

/// Elementwise loss over dense predictions, sum-reduced, with its exact
/// gradient. Black box to the loop beyond these two calls.
pub trait Criterion {
    fn loss(&self, pred: &Array2<f32>, target: &Array2<f32>) -> f32;
    fn gradient(&self, pred: &Array2<f32>, target: &Array2<f32>) -> Array2<f32>;
}

/// Sum of squared errors.
pub struct SumSquaredError;

impl Criterion for SumSquaredError {
    fn loss(&self, pred: &Array2<f32>, target: &Array2<f32>) -> f32 {
        (pred - target).mapv(|d| d * d).sum()
    }

    fn gradient(&self, pred: &Array2<f32>, target: &Array2<f32>) -> Array2<f32> {
        (pred - target).mapv(|d| 2.0 * d)
    }
}

/// Gradient-based parameter update over flat parameter/gradient slices.
pub trait Optimizer {
    fn lr(&self) -> f32;
    fn step(&mut self, param: &mut [f32], grad: &[f32]);
}

/// Plain stochastic gradient descent.
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self, param: &mut [f32], grad: &[f32]) {
        for (p, g) in param.iter_mut().zip(grad) {
            *p -= self.lr * g;
        }
    }
}

#[derive(Debug, Error)]
#[error("run logger: {0}")]
pub struct LoggerError(pub String);

/// Periodic scalar sink (experiment tracker, stdout, ...). Failures are
/// best-effort by default; `TrainerConfig::strict_logging` makes them fatal.
pub trait RunLogger {
    fn log_scalars(&mut self, step: u64, scalars: &[(&str, f64)]) -> Result<(), LoggerError>;
}

/// Discards everything.
pub struct NullLogger;

impl RunLogger for NullLogger {
    fn log_scalars(&mut self, _step: u64, _scalars: &[(&str, f64)]) -> Result<(), LoggerError> {
        Ok(())
    }
}

/// Routes scalar batches to the `log` facade at info level.
pub struct LogFacadeLogger;

impl RunLogger for LogFacadeLogger {
    fn log_scalars(&mut self, step: u64, scalars: &[(&str, f64)]) -> Result<(), LoggerError> {
        let line = scalars
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        log::info!("step {step}: {line}");
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TrainError {
    /// Numerical divergence. Fatal, non-recoverable, never retried; returned
    /// before any optimizer update for the offending step.
    #[error("loss is {value}, stopping training at step {step}")]
    NonFiniteLoss { value: f32, step: u64 },
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error("external logger failed: {0}")]
    Logger(LoggerError),
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrainerConfig {
    /// Global gradient-norm clip threshold; 0 disables clipping.
    pub max_grad_norm: f32,
    /// Running loss/correlation are reported every this many steps.
    pub print_freq: u64,
    /// Metaparcel label the correlation metric is restricted to.
    pub metaparcel: u32,
    /// If true, a failing external logger aborts the run.
    pub strict_logging: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_grad_norm: 0.0,
            print_freq: 10,
            metaparcel: 0,
            strict_logging: false,
        }
    }
}

impl TrainerConfig {
    pub fn with_max_grad_norm(mut self, max_grad_norm: f32) -> Self {
        self.max_grad_norm = max_grad_norm;
        self
    }

    pub fn with_print_freq(mut self, print_freq: u64) -> Self {
        self.print_freq = print_freq.max(1);
        self
    }

    pub fn with_metaparcel(mut self, metaparcel: u32) -> Self {
        self.metaparcel = metaparcel;
        self
    }

    pub fn with_strict_logging(mut self, strict: bool) -> Self {
        self.strict_logging = strict;
        self
    }
}

/// Per-epoch metric summary; merging across workers is the associative
/// snapshot reduction, so any worker count yields the same averages.
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    snapshot: TrackerSnapshot,
}

impl EpochStats {
    pub fn snapshot(&self) -> &TrackerSnapshot {
        &self.snapshot
    }

    pub fn merge(self, other: &EpochStats) -> EpochStats {
        EpochStats {
            snapshot: self.snapshot.merge(&other.snapshot),
        }
    }

    pub fn average(&self, name: &str) -> Option<f64> {
        self.snapshot.global_avg(name)
    }
}

/// Pearson correlation between two flattened vectors. `None` when either
/// side has no variance (or the vectors are empty/mismatched): degenerate
/// batches are excluded from running averages instead of poisoning them.
pub fn pearson(xs: &[f32], ys: &[f32]) -> Option<f64> {
    if xs.len() != ys.len() || xs.is_empty() {
        return None;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().map(|&x| x as f64).sum::<f64>() / n;
    let mean_y = ys.iter().map(|&y| y as f64).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = x as f64 - mean_x;
        let dy = y as f64 - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some(cov / (var_x * var_y).sqrt())
}

// Scale all gradients so their joint L2 norm does not exceed `max_norm`.
fn clip_global_norm(grads: &mut [&mut [f32]], max_norm: f32) -> f32 {
    let total: f32 = grads
        .iter()
        .map(|g| g.iter().map(|x| x * x).sum::<f32>())
        .sum();
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for g in grads.iter_mut() {
            for x in g.iter_mut() {
                *x *= scale;
            }
        }
    }
    norm
}

fn dense_slice_mut(a: &mut Array2<f32>) -> &mut [f32] {
    a.as_slice_mut().expect("parameter arrays are standard layout")
}

/// Metaparcel-restricted reconstruction of a dense tensor, flattened for
/// correlation.
fn restricted_flat(dense: &Array2<f32>, geometry: &ParcelGeometry, metaparcel: u32) -> Vec<f32> {
    let slots = pack_parcel_slots(dense, geometry);
    let recon = unwrap_metaparcel(&slots, geometry, metaparcel);
    recon.iter().copied().collect()
}

/// One training epoch.
///
/// Per step: forward -> normalized loss -> finite check -> backward ->
/// optional global clip -> optimizer step -> metric update -> periodic
/// external logging. Ends when `batches` is exhausted; returns the epoch's
/// averaged metrics.
#[allow(clippy::too_many_arguments)]
pub fn train_one_epoch<B, D, C, O, L, I>(
    model: &mut BrainEncoder<B, D>,
    criterion: &C,
    optimizer: &mut O,
    batches: I,
    geometry: &ParcelGeometry,
    cfg: &TrainerConfig,
    logger: &mut L,
    epoch: u32,
) -> Result<EpochStats, TrainError>
where
    B: Backbone,
    D: ParcelDecoder,
    C: Criterion,
    O: Optimizer,
    L: RunLogger,
    I: IntoIterator<Item = (PaddedBatch, Array2<f32>)>,
{
    // Constant per dataset, not per batch: keeps loss magnitudes comparable
    // across geometries with different coverage.
    let num_valid = geometry.num_valid_voxels() as f32;

    let window = cfg.print_freq as usize;
    let mut tracker = MetricTracker::new()
        .with_meter("lr", window)
        .with_meter("loss", window);

    let mut running_loss = 0.0f64;
    let mut running_corr = 0.0f64;
    let mut corr_batches = 0u64;
    let mut step = 0u64;

    for (stimuli, target) in batches {
        let (output, state) = model.forward_with_state(&stimuli)?;
        let loss = criterion.loss(&output.pred, &target) / num_valid;

        if !loss.is_finite() {
            return Err(TrainError::NonFiniteLoss { value: loss, step });
        }

        // Backward: criterion -> readout -> decoder (which returns the
        // gradient for the query embeddings the core owns).
        let mut grad_pred = criterion.gradient(&output.pred, &target);
        grad_pred.mapv_inplace(|g| g / num_valid);
        let mut grads = model.readout.backward(&state, &grad_pred);
        let mut query_grad = model.decoder.backward(&grads.tokens)?;

        if cfg.max_grad_norm > 0.0 {
            clip_global_norm(
                &mut [
                    dense_slice_mut(&mut grads.weight),
                    grads
                        .bias
                        .as_slice_mut()
                        .expect("gradient arrays are standard layout"),
                    dense_slice_mut(&mut query_grad),
                ],
                cfg.max_grad_norm,
            );
        }

        optimizer.step(
            dense_slice_mut(&mut model.readout.weight),
            grads.weight.as_slice().expect("gradient arrays are standard layout"),
        );
        optimizer.step(
            model
                .readout
                .bias
                .as_slice_mut()
                .expect("parameter arrays are standard layout"),
            grads.bias.as_slice().expect("gradient arrays are standard layout"),
        );
        optimizer.step(
            dense_slice_mut(&mut model.queries),
            query_grad.as_slice().expect("gradient arrays are standard layout"),
        );

        tracker.update("loss", loss as f64);
        tracker.update("lr", optimizer.lr() as f64);

        let pred_flat = restricted_flat(&output.pred, geometry, cfg.metaparcel);
        let target_flat = restricted_flat(&target, geometry, cfg.metaparcel);
        if let Some(corr) = pearson(&pred_flat, &target_flat) {
            running_corr += corr;
            corr_batches += 1;
        }
        running_loss += loss as f64;

        if (step + 1) % cfg.print_freq == 0 {
            let avg_corr = if corr_batches > 0 {
                running_corr / corr_batches as f64
            } else {
                0.0
            };
            let scalars = [
                ("training_loss", running_loss / cfg.print_freq as f64),
                ("training_corr", avg_corr),
                ("epoch", epoch as f64),
                ("batch", step as f64),
            ];
            if let Err(err) = logger.log_scalars(step, &scalars) {
                if cfg.strict_logging {
                    return Err(TrainError::Logger(err));
                }
                log::warn!("external logger failed, continuing: {err}");
            }
            running_loss = 0.0;
            running_corr = 0.0;
            corr_batches = 0;
        }

        step += 1;
    }

    log::debug!("epoch {epoch} averaged stats: {tracker}");
    Ok(EpochStats {
        snapshot: tracker.snapshot(),
    })
}

/// Evaluation output: unwrapped targets and predictions stacked in
/// evaluation order, plus the loss snapshot for cross-worker averaging.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub targets: Array2<f32>,
    pub predictions: Array2<f32>,
    pub loss: MeterSnapshot,
}

impl EvalOutcome {
    pub fn avg_loss(&self) -> f64 {
        self.loss.global_avg()
    }
}

fn vstack(blocks: &[Array2<f32>], cols: usize) -> Array2<f32> {
    let rows: usize = blocks.iter().map(|b| b.shape()[0]).sum();
    let mut out = Array2::zeros((rows, cols));
    let mut offset = 0;
    for block in blocks {
        let n = block.shape()[0];
        out.slice_axis_mut(Axis(0), ndarray::Slice::from(offset..offset + n))
            .assign(block);
        offset += n;
    }
    out
}

/// One evaluation pass. No gradients anywhere; the model is shared
/// read-only.
pub fn evaluate<B, D, C, I>(
    model: &BrainEncoder<B, D>,
    criterion: &C,
    batches: I,
    geometry: &ParcelGeometry,
    cfg: &TrainerConfig,
) -> Result<EvalOutcome, TrainError>
where
    B: Backbone,
    D: ParcelDecoder,
    C: Criterion,
    I: IntoIterator<Item = (PaddedBatch, Array2<f32>)>,
{
    let num_valid = geometry.num_valid_voxels() as f32;
    let subset_size = geometry.metaparcel_voxels(cfg.metaparcel).len();
    let mut tracker = MetricTracker::new().with_meter("loss", 100);

    let mut preds: Vec<Array2<f32>> = Vec::new();
    let mut targets: Vec<Array2<f32>> = Vec::new();

    for (stimuli, target) in batches {
        let output = model.forward(&stimuli)?;
        let loss = criterion.loss(&output.pred, &target) / num_valid;
        tracker.update("loss", loss as f64);

        let pred_slots = pack_parcel_slots(&output.pred, geometry);
        preds.push(unwrap_metaparcel(&pred_slots, geometry, cfg.metaparcel));
        let target_slots = pack_parcel_slots(&target, geometry);
        targets.push(unwrap_metaparcel(&target_slots, geometry, cfg.metaparcel));
    }

    let snapshot = tracker.snapshot();
    let loss = snapshot
        .meters()
        .iter()
        .find(|(name, _)| name == "loss")
        .map(|(_, s)| *s)
        .unwrap_or_default();

    Ok(EvalOutcome {
        targets: vstack(&targets, subset_size),
        predictions: vstack(&preds, subset_size),
        loss,
    })
}

/// Sharded evaluation across rayon workers; each shard runs the full loop
/// over its slice of the data, then outcomes are concatenated in shard
/// order and loss snapshots are merged associatively.
#[cfg(feature = "parallel")]
pub fn evaluate_sharded<B, D, C>(
    model: &BrainEncoder<B, D>,
    criterion: &C,
    shards: Vec<Vec<(PaddedBatch, Array2<f32>)>>,
    geometry: &ParcelGeometry,
    cfg: &TrainerConfig,
) -> Result<EvalOutcome, TrainError>
where
    B: Backbone + Sync,
    D: ParcelDecoder + Sync,
    C: Criterion + Sync,
{
    use rayon::prelude::*;

    let outcomes: Result<Vec<EvalOutcome>, TrainError> = shards
        .into_par_iter()
        .map(|shard| evaluate(model, criterion, shard, geometry, cfg))
        .collect();
    let outcomes = outcomes?;

    let subset_size = geometry.metaparcel_voxels(cfg.metaparcel).len();
    let targets: Vec<Array2<f32>> = outcomes.iter().map(|o| o.targets.clone()).collect();
    let preds: Vec<Array2<f32>> = outcomes.iter().map(|o| o.predictions.clone()).collect();
    let loss = outcomes
        .iter()
        .map(|o| o.loss)
        .fold(MeterSnapshot::default(), MeterSnapshot::merge);

    Ok(EvalOutcome {
        targets: vstack(&targets, subset_size),
        predictions: vstack(&preds, subset_size),
        loss,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{BrainEncoder, EncoderConfig};
    use crate::experiments::synthetic::{
        synthetic_batches, synthetic_geometry, MeanFieldDecoder, PooledBackbone, SyntheticConfig,
    };

    fn setup(
        cfg: &SyntheticConfig,
    ) -> (
        ParcelGeometry,
        BrainEncoder<PooledBackbone, MeanFieldDecoder>,
        Vec<(PaddedBatch, Array2<f32>)>,
    ) {
        let geometry = synthetic_geometry(cfg);
        let backbone = PooledBackbone::new(cfg.image_channels, cfg.hidden_dim, cfg.seed);
        let decoder = MeanFieldDecoder::new();
        let model = BrainEncoder::new(
            EncoderConfig::new(cfg.hidden_dim).with_seed(cfg.seed),
            &geometry,
            backbone,
            decoder,
        );
        let batches = synthetic_batches(&geometry, cfg, 8, 4);
        (geometry, model, batches)
    }

    #[test]
    fn loss_normalization_is_scale_invariant() {
        // Doubling coverage while doubling the raw sum-reduced loss leaves
        // the normalized loss unchanged.
        let small = ParcelGeometry::new(vec![vec![0, 1, 2]], 3, vec![0; 3]).unwrap();
        let large =
            ParcelGeometry::new(vec![vec![0, 1, 2], vec![3, 4, 5]], 6, vec![0; 6]).unwrap();

        let criterion = SumSquaredError;
        // Constant per-voxel error of 0.5 in both cases.
        let pred_s = Array2::from_elem((2, 3), 1.0);
        let target_s = Array2::from_elem((2, 3), 0.5);
        let pred_l = Array2::from_elem((2, 6), 1.0);
        let target_l = Array2::from_elem((2, 6), 0.5);

        let norm_s = criterion.loss(&pred_s, &target_s) / small.num_valid_voxels() as f32;
        let norm_l = criterion.loss(&pred_l, &target_l) / large.num_valid_voxels() as f32;
        assert!((norm_s - norm_l).abs() < 1e-6);
    }

    #[test]
    fn pearson_identical_vectors_is_one() {
        let xs = [0.1f32, 0.5, -0.3, 0.9, 0.2];
        let corr = pearson(&xs, &xs).unwrap();
        assert!((corr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn pearson_degenerate_inputs_are_excluded() {
        let constant = [1.0f32; 5];
        let varied = [0.1f32, 0.2, 0.3, 0.4, 0.5];
        assert!(pearson(&constant, &varied).is_none());
        assert!(pearson(&varied, &constant).is_none());
        assert!(pearson(&[], &[]).is_none());
        assert!(pearson(&varied, &varied[..3]).is_none());
    }

    #[test]
    fn pearson_is_sign_aware() {
        let xs = [1.0f32, 2.0, 3.0, 4.0];
        let ys = [4.0f32, 3.0, 2.0, 1.0];
        let corr = pearson(&xs, &ys).unwrap();
        assert!((corr + 1.0).abs() < 1e-9);
    }

    #[test]
    fn clip_leaves_small_gradients_alone() {
        let mut a = vec![0.3f32, -0.4];
        let norm = clip_global_norm(&mut [&mut a], 1.0);
        assert!((norm - 0.5).abs() < 1e-6);
        assert_eq!(a, vec![0.3, -0.4]);
    }

    #[test]
    fn clip_scales_to_max_norm() {
        let mut a = vec![3.0f32];
        let mut b = vec![4.0f32];
        clip_global_norm(&mut [&mut a, &mut b], 1.0);
        let norm = (a[0] * a[0] + b[0] * b[0]).sqrt();
        assert!((norm - 1.0).abs() < 1e-3);
        // Direction preserved.
        assert!(a[0] > 0.0 && b[0] > 0.0);
        assert!((b[0] / a[0] - 4.0 / 3.0).abs() < 1e-4);
    }

    struct NanCriterion;

    impl Criterion for NanCriterion {
        fn loss(&self, _pred: &Array2<f32>, _target: &Array2<f32>) -> f32 {
            f32::NAN
        }
        fn gradient(&self, pred: &Array2<f32>, _target: &Array2<f32>) -> Array2<f32> {
            Array2::zeros(pred.raw_dim())
        }
    }

    struct CountingOptimizer {
        steps: u64,
    }

    impl Optimizer for CountingOptimizer {
        fn lr(&self) -> f32 {
            0.01
        }
        fn step(&mut self, _param: &mut [f32], _grad: &[f32]) {
            self.steps += 1;
        }
    }

    #[test]
    fn non_finite_loss_aborts_before_any_update() {
        let cfg = SyntheticConfig::default();
        let (geometry, mut model, batches) = setup(&cfg);
        let mut optimizer = CountingOptimizer { steps: 0 };
        let trainer_cfg = TrainerConfig::default();

        let err = train_one_epoch(
            &mut model,
            &NanCriterion,
            &mut optimizer,
            batches,
            &geometry,
            &trainer_cfg,
            &mut NullLogger,
            0,
        )
        .unwrap_err();

        assert!(matches!(err, TrainError::NonFiniteLoss { step: 0, .. }));
        assert_eq!(optimizer.steps, 0);
    }

    #[test]
    fn training_reduces_loss_on_synthetic_data() {
        let cfg = SyntheticConfig::default();
        let (geometry, mut model, batches) = setup(&cfg);
        let criterion = SumSquaredError;
        let mut optimizer = Sgd::new(0.05);
        let trainer_cfg = TrainerConfig::default().with_metaparcel(1);

        let first = train_one_epoch(
            &mut model,
            &criterion,
            &mut optimizer,
            batches.clone(),
            &geometry,
            &trainer_cfg,
            &mut NullLogger,
            0,
        )
        .unwrap();
        let mut last = first.clone();
        for epoch in 1..20 {
            last = train_one_epoch(
                &mut model,
                &criterion,
                &mut optimizer,
                batches.clone(),
                &geometry,
                &trainer_cfg,
                &mut NullLogger,
                epoch,
            )
            .unwrap();
        }

        let before = first.average("loss").unwrap();
        let after = last.average("loss").unwrap();
        assert!(after < before, "loss did not decrease: {before} -> {after}");
    }

    #[test]
    fn evaluation_stacks_all_batches_in_order() {
        let cfg = SyntheticConfig::default();
        let (geometry, model, batches) = setup(&cfg);
        let trainer_cfg = TrainerConfig::default().with_metaparcel(1);
        let subset = geometry.metaparcel_voxels(1).len();
        let total_rows: usize = batches.iter().map(|(b, _)| b.batch_size()).sum();

        let outcome =
            evaluate(&model, &SumSquaredError, batches, &geometry, &trainer_cfg).unwrap();
        assert_eq!(outcome.targets.dim(), (total_rows, subset));
        assert_eq!(outcome.predictions.dim(), (total_rows, subset));
        assert!(outcome.avg_loss().is_finite());
    }

    struct FailingLogger;

    impl RunLogger for FailingLogger {
        fn log_scalars(&mut self, _step: u64, _scalars: &[(&str, f64)]) -> Result<(), LoggerError> {
            Err(LoggerError("sink unreachable".into()))
        }
    }

    #[test]
    fn logger_failure_is_best_effort_by_default() {
        let cfg = SyntheticConfig::default();
        let (geometry, mut model, batches) = setup(&cfg);
        let trainer_cfg = TrainerConfig::default().with_print_freq(2);

        let result = train_one_epoch(
            &mut model,
            &SumSquaredError,
            &mut Sgd::new(0.01),
            batches,
            &geometry,
            &trainer_cfg,
            &mut FailingLogger,
            0,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn logger_failure_is_fatal_when_strict() {
        let cfg = SyntheticConfig::default();
        let (geometry, mut model, batches) = setup(&cfg);
        let trainer_cfg = TrainerConfig::default()
            .with_print_freq(2)
            .with_strict_logging(true);

        let err = train_one_epoch(
            &mut model,
            &SumSquaredError,
            &mut Sgd::new(0.01),
            batches,
            &geometry,
            &trainer_cfg,
            &mut FailingLogger,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::Logger(_)));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn sharded_evaluation_matches_sequential() {
        let cfg = SyntheticConfig::default();
        let (geometry, model, batches) = setup(&cfg);
        let trainer_cfg = TrainerConfig::default().with_metaparcel(1);

        let sequential = evaluate(
            &model,
            &SumSquaredError,
            batches.clone(),
            &geometry,
            &trainer_cfg,
        )
        .unwrap();

        let mid = batches.len() / 2;
        let mut shards = vec![Vec::new(), Vec::new()];
        for (i, b) in batches.into_iter().enumerate() {
            shards[usize::from(i >= mid)].push(b);
        }
        let sharded =
            evaluate_sharded(&model, &SumSquaredError, shards, &geometry, &trainer_cfg).unwrap();

        assert_eq!(sequential.targets, sharded.targets);
        assert_eq!(sequential.predictions, sharded.predictions);
        assert!((sequential.avg_loss() - sharded.avg_loss()).abs() < 1e-12);
    }
}
