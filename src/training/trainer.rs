//! Phase runner
//!
//! One phase = a fresh SGD optimizer (momentum, Nesterov, no dampening), a
//! fixed freezing policy and an epoch loop over shuffled mini-batches.
//! Each epoch is validated on the held-out set; an optional early-stopping
//! rule watches the validation loss.

use std::path::Path;

use burn::{
    data::dataloader::batcher::Batcher,
    data::dataset::Dataset,
    module::{AutodiffModule, Module},
    optim::{momentum::MomentumConfig, GradientsParams, Optimizer, SgdConfig},
    tensor::{
        activation::log_softmax,
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::{FogBatch, FogBatcher, FogDataset};
use crate::model::FogClassifier;
use crate::training::early_stopping::{EarlyStopStatus, EarlyStopping, EarlyStoppingConfig};
use crate::training::freeze::FreezePolicy;
use crate::utils::error::{FogError, Result};
use crate::utils::logging::PhaseLogger;
use crate::utils::metrics::{AccuracyMeter, LossMeter};

/// Optimizer settings and epoch budget of one phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub nesterov: bool,
}

impl PhaseConfig {
    /// Head-only training with the backbone frozen
    pub fn head_training() -> Self {
        Self {
            epochs: 5,
            learning_rate: 0.01,
            momentum: 0.9,
            nesterov: true,
        }
    }

    /// Low learning-rate fine-tuning of the backbone suffix
    pub fn fine_tuning() -> Self {
        Self {
            epochs: 100,
            learning_rate: 1e-4,
            momentum: 0.9,
            nesterov: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(FogError::Config("epochs must be greater than 0".to_string()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(FogError::Config("learning_rate must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(FogError::Config("momentum must be in range [0.0, 1.0)".to_string()));
        }
        Ok(())
    }

    fn optimizer(&self) -> SgdConfig {
        SgdConfig::new().with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(self.momentum)
                .with_dampening(0.0)
                .with_nesterov(self.nesterov),
        ))
    }
}

/// Metrics of one epoch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochRecord {
    pub phase: String,
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// All epochs of all phases, in order
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    records: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn phase(&self, phase: &str) -> impl Iterator<Item = &EpochRecord> {
        let phase = phase.to_string();
        self.records.iter().filter(move |r| r.phase == phase)
    }

    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// How a phase ended
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub epochs_run: usize,
    pub stopped_early: bool,
    /// Epoch with the lowest validation loss
    pub best_epoch: Option<usize>,
    pub best_val_loss: f64,
    pub restored_best: bool,
}

/// Categorical cross-entropy between `softmax(logits)` and one-hot targets
pub fn categorical_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    one_hot: Tensor<B, 2>,
) -> Tensor<B, 1> {
    (log_softmax(logits, 1) * one_hot)
        .sum_dim(1)
        .mean()
        .neg()
}

/// Arg-max class index of every row
pub fn predicted_classes<B: Backend>(scores: Tensor<B, 2>) -> Vec<usize> {
    scores
        .argmax(1)
        .squeeze_dim::<1>(1)
        .into_data()
        .iter::<i64>()
        .map(|v| v as usize)
        .collect()
}

/// Mean loss and accuracy of a model in inference mode
pub fn evaluate<B: Backend>(
    model: &FogClassifier<B>,
    dataset: &FogDataset,
    batcher: &FogBatcher,
    batch_size: usize,
) -> (f64, f64) {
    let device = model.devices().into_iter().next().unwrap_or_default();
    let mut loss = LossMeter::new();
    let mut accuracy = AccuracyMeter::new();

    let indices: Vec<usize> = (0..dataset.len()).collect();
    for chunk in indices.chunks(batch_size.max(1)) {
        let batch: FogBatch<B> = batcher.batch(dataset.select(chunk), &device);
        let logits = model.forward(batch.images);

        let batch_loss: f64 = categorical_cross_entropy(logits.clone(), batch.one_hot)
            .into_scalar()
            .elem();
        loss.update(batch_loss, chunk.len());

        let targets: Vec<usize> = batch
            .targets
            .into_data()
            .iter::<i64>()
            .map(|v| v as usize)
            .collect();
        accuracy.update(&predicted_classes(logits), &targets);
    }

    (loss.mean(), accuracy.value())
}

/// Runs training phases and keeps the history across them
pub struct Trainer<B: AutodiffBackend> {
    batcher: FogBatcher,
    batch_size: usize,
    device: B::Device,
    rng: ChaCha8Rng,
    history: TrainingHistory,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(batcher: FogBatcher, batch_size: usize, seed: u64, device: B::Device) -> Self {
        Self {
            batcher,
            batch_size: batch_size.max(1),
            device,
            rng: ChaCha8Rng::seed_from_u64(seed),
            history: TrainingHistory::default(),
        }
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn into_history(self) -> TrainingHistory {
        self.history
    }

    /// Train `model` for one phase
    ///
    /// Without `early_stopping` the phase runs for exactly `config.epochs`.
    #[allow(clippy::too_many_arguments)]
    pub fn run_phase(
        &mut self,
        phase: &str,
        mut model: FogClassifier<B>,
        policy: &FreezePolicy,
        config: &PhaseConfig,
        early_stopping: Option<&EarlyStoppingConfig>,
        train: &FogDataset,
        val: &FogDataset,
    ) -> Result<(FogClassifier<B>, PhaseOutcome)> {
        config.validate()?;
        if train.is_empty() {
            return Err(FogError::Training("training set is empty".to_string()));
        }
        if val.is_empty() {
            return Err(FogError::Training("validation set is empty".to_string()));
        }
        if policy.num_units() != model.num_backbone_units() {
            return Err(FogError::Training(format!(
                "freeze policy covers {} units, backbone has {}",
                policy.num_units(),
                model.num_backbone_units()
            )));
        }

        info!(
            "[{}] {} epochs, lr {}, {}",
            phase, config.epochs, config.learning_rate, policy
        );

        let mut optimizer = config.optimizer().init::<B, FogClassifier<B>>();
        let mut stopper = early_stopping.cloned().map(EarlyStopping::new);
        // Records copy the batch-norm running statistics; a module clone would share them
        let mut best_record: Option<<FogClassifier<B> as Module<B>>::Record> = None;
        let mut best = (None, f64::INFINITY);
        let mut logger = PhaseLogger::new(phase, config.epochs);
        let mut epochs_run = 0;
        let mut stopped_early = false;

        for epoch in 0..config.epochs {
            logger.epoch_started(epoch);

            let (trained, train_loss, train_accuracy) =
                self.train_epoch(model, &mut optimizer, policy, config.learning_rate, train);
            model = trained;

            let (val_loss, val_accuracy) =
                evaluate(&model.valid(), val, &self.batcher, self.batch_size);
            logger.epoch_finished((train_loss, train_accuracy), (val_loss, val_accuracy));
            epochs_run = epoch + 1;

            self.history.push(EpochRecord {
                phase: phase.to_string(),
                epoch: epoch + 1,
                train_loss,
                train_accuracy,
                val_loss,
                val_accuracy,
                learning_rate: config.learning_rate,
            });

            if val_loss < best.1 {
                logger.val_loss_improved(best.1, val_loss);
                best = (Some(epoch + 1), val_loss);
            }

            if let Some(stopper) = stopper.as_mut() {
                match stopper.observe(epoch, val_loss) {
                    EarlyStopStatus::Improved => {
                        if stopper.config().restore_best_weights {
                            best_record = Some(model.clone().into_record());
                        }
                    }
                    EarlyStopStatus::NoImprovement => {}
                    EarlyStopStatus::Stop => {
                        logger.stopped_early(stopper.config().patience);
                        stopped_early = true;
                        break;
                    }
                }
            }
        }

        let restored_best = match best_record {
            Some(record) => {
                info!("[{}] Restoring weights from epoch {:?}", phase, best.0);
                model = model.load_record(record);
                true
            }
            None => false,
        };

        debug!("[{}] finished in {:.1}s", phase, logger.phase_secs());

        Ok((
            model,
            PhaseOutcome {
                epochs_run,
                stopped_early,
                best_epoch: best.0,
                best_val_loss: best.1,
                restored_best,
            },
        ))
    }

    /// One pass over the shuffled training set
    fn train_epoch<O: Optimizer<FogClassifier<B>, B>>(
        &mut self,
        mut model: FogClassifier<B>,
        optimizer: &mut O,
        policy: &FreezePolicy,
        learning_rate: f64,
        train: &FogDataset,
    ) -> (FogClassifier<B>, f64, f64) {
        let mut indices: Vec<usize> = (0..train.len()).collect();
        indices.shuffle(&mut self.rng);

        let mut loss_avg = LossMeter::new();
        let mut accuracy = AccuracyMeter::new();
        let num_batches = indices.len().div_ceil(self.batch_size);

        for (batch_idx, chunk) in indices.chunks(self.batch_size).enumerate() {
            let batch: FogBatch<B> = self.batcher.batch(train.select(chunk), &self.device);

            let logits = model.forward_partially_frozen(batch.images, policy.trainable_from());
            let loss = categorical_cross_entropy(logits.clone(), batch.one_hot);

            let loss_value: f64 = loss.clone().into_scalar().elem();
            loss_avg.update(loss_value, chunk.len());

            let targets: Vec<usize> = batch
                .targets
                .into_data()
                .iter::<i64>()
                .map(|v| v as usize)
                .collect();
            accuracy.update(&predicted_classes(logits), &targets);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(learning_rate, model, grads);

            if (batch_idx + 1) % 10 == 0 || batch_idx + 1 == num_batches {
                debug!(
                    "  batch {}/{}: loss = {:.4}, acc = {:.2}%",
                    batch_idx + 1,
                    num_batches,
                    loss_value,
                    100.0 * accuracy.value()
                );
            }
        }

        (model, loss_avg.mean(), accuracy.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::FogRecord;
    use crate::model::FogClassifierConfig;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray>;

    const SIZE: usize = 32;

    fn dataset(n: usize) -> FogDataset {
        let records: Vec<FogRecord> = (0..n)
            .map(|i| {
                let label = i % 4;
                FogRecord {
                    image_id: i.to_string(),
                    basename: format!("{}.png", i),
                    path: format!("{}.png", i).into(),
                    site: "a".to_string(),
                    label,
                    pixels: vec![label as f32 / 4.0 + 0.1; 3 * SIZE * SIZE],
                }
            })
            .collect();
        FogDataset::from_records(&records, SIZE).unwrap()
    }

    fn values<B: Backend, const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().iter::<f32>().collect()
    }

    fn changed(a: &[f32], b: &[f32]) -> bool {
        a.iter().zip(b).any(|(x, y)| (x - y).abs() > 1e-9)
    }

    #[test]
    fn test_cross_entropy_matches_manual() {
        let device = Default::default();
        let logits = Tensor::<NdArray, 2>::from_floats([[2.0, 1.0, 0.0, 0.0]], &device);
        let one_hot = Tensor::<NdArray, 2>::from_floats([[1.0, 0.0, 0.0, 0.0]], &device);

        let loss: f64 = categorical_cross_entropy(logits, one_hot).into_scalar().elem();
        let denom = 2f64.exp() + 1f64.exp() + 2.0;
        let expected = -(2f64.exp() / denom).ln();
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn test_predicted_classes_single_row() {
        let device = Default::default();
        let scores = Tensor::<NdArray, 2>::from_floats([[0.1, 0.7, 0.2, 0.0]], &device);
        assert_eq!(predicted_classes(scores), vec![1]);

        let scores = Tensor::<NdArray, 2>::from_floats(
            [[0.9, 0.0, 0.1, 0.0], [0.0, 0.1, 0.2, 0.7]],
            &device,
        );
        assert_eq!(predicted_classes(scores), vec![0, 3]);
    }

    #[test]
    fn test_frozen_backbone_unchanged_by_head_training() {
        let device = Default::default();
        let model = FogClassifierConfig::tiny(SIZE).init::<TestBackend>(&device);
        let policy = FreezePolicy::frozen_backbone(model.num_backbone_units());

        let stem_before = values(model.backbone.stem.conv.weight.val());
        let last_before = values(model.backbone.blocks[3].conv3.weight.val());
        let head_before = values(model.head.output.bias.as_ref().unwrap().val());

        let mut trainer = Trainer::<TestBackend>::new(FogBatcher::new(SIZE), 4, 1, device);
        let config = PhaseConfig {
            epochs: 1,
            ..PhaseConfig::head_training()
        };
        let (model, outcome) = trainer
            .run_phase("head", model, &policy, &config, None, &dataset(8), &dataset(4))
            .unwrap();

        assert_eq!(outcome.epochs_run, 1);
        assert!(!changed(&stem_before, &values(model.backbone.stem.conv.weight.val())));
        assert!(!changed(&last_before, &values(model.backbone.blocks[3].conv3.weight.val())));
        assert!(changed(
            &head_before,
            &values(model.head.output.bias.as_ref().unwrap().val())
        ));
    }

    #[test]
    fn test_fine_tuning_updates_only_unfrozen_suffix() {
        let device = Default::default();
        let model = FogClassifierConfig::tiny(SIZE).init::<TestBackend>(&device);
        let mut policy = FreezePolicy::frozen_backbone(model.num_backbone_units());
        policy.unfreeze_from(4).unwrap();

        let early_block = values(model.backbone.blocks[0].conv1.weight.val());
        let last_block = values(model.backbone.blocks[3].conv1.weight.val());

        let mut trainer = Trainer::<TestBackend>::new(FogBatcher::new(SIZE), 4, 2, device);
        let config = PhaseConfig {
            epochs: 1,
            learning_rate: 0.05,
            ..PhaseConfig::fine_tuning()
        };
        let (model, _) = trainer
            .run_phase("fine_tune", model, &policy, &config, None, &dataset(8), &dataset(4))
            .unwrap();

        assert!(!changed(&early_block, &values(model.backbone.blocks[0].conv1.weight.val())));
        assert!(changed(&last_block, &values(model.backbone.blocks[3].conv1.weight.val())));
    }

    #[test]
    fn test_head_training_keeps_frozen_batch_norm_statistics() {
        let device = Default::default();
        let model = FogClassifierConfig::tiny(SIZE).init::<TestBackend>(&device);
        let policy = FreezePolicy::frozen_backbone(model.num_backbone_units());

        let stem_mean = values(model.backbone.stem.bn.running_mean.value_sync());
        let stem_var = values(model.backbone.stem.bn.running_var.value_sync());
        let last_mean = values(model.backbone.blocks[3].bn3.running_mean.value_sync());

        let mut trainer = Trainer::<TestBackend>::new(FogBatcher::new(SIZE), 4, 4, device);
        let config = PhaseConfig {
            epochs: 2,
            ..PhaseConfig::head_training()
        };
        let (model, _) = trainer
            .run_phase("head", model, &policy, &config, None, &dataset(8), &dataset(4))
            .unwrap();

        let bn = &model.backbone.stem.bn;
        assert!(!changed(&stem_mean, &values(bn.running_mean.value_sync())));
        assert!(!changed(&stem_var, &values(bn.running_var.value_sync())));
        assert!(!changed(
            &last_mean,
            &values(model.backbone.blocks[3].bn3.running_mean.value_sync())
        ));
    }

    #[test]
    fn test_fine_tuning_updates_unfrozen_batch_norm_statistics() {
        let device = Default::default();
        let model = FogClassifierConfig::tiny(SIZE).init::<TestBackend>(&device);
        let mut policy = FreezePolicy::frozen_backbone(model.num_backbone_units());
        policy.unfreeze_from(4).unwrap();

        let frozen_mean = values(model.backbone.blocks[0].bn1.running_mean.value_sync());
        let trainable_mean = values(model.backbone.blocks[3].bn1.running_mean.value_sync());

        let mut trainer = Trainer::<TestBackend>::new(FogBatcher::new(SIZE), 4, 5, device);
        let config = PhaseConfig {
            epochs: 1,
            ..PhaseConfig::fine_tuning()
        };
        let (model, _) = trainer
            .run_phase("fine_tune", model, &policy, &config, None, &dataset(8), &dataset(4))
            .unwrap();

        assert!(!changed(
            &frozen_mean,
            &values(model.backbone.blocks[0].bn1.running_mean.value_sync())
        ));
        assert!(changed(
            &trainable_mean,
            &values(model.backbone.blocks[3].bn1.running_mean.value_sync())
        ));
    }

    #[test]
    fn test_restored_weights_reproduce_best_validation_loss() {
        let device = Default::default();
        let model = FogClassifierConfig::tiny(SIZE)
            .with_dropout(0.0)
            .init::<TestBackend>(&device);
        let mut policy = FreezePolicy::frozen_backbone(model.num_backbone_units());
        policy.unfreeze_all();

        let batcher = FogBatcher::new(SIZE);
        let mut trainer = Trainer::<TestBackend>::new(batcher.clone(), 4, 6, device);
        // A large step size makes later epochs drift away from the best one
        let config = PhaseConfig {
            epochs: 5,
            learning_rate: 0.1,
            ..PhaseConfig::fine_tuning()
        };
        let early = EarlyStoppingConfig {
            patience: 5,
            min_delta: 0.0,
            restore_best_weights: true,
        };
        let val = dataset(8);
        let (model, outcome) = trainer
            .run_phase("fine_tune", model, &policy, &config, Some(&early), &dataset(8), &val)
            .unwrap();

        assert!(outcome.restored_best);
        let best_epoch = outcome.best_epoch.unwrap();
        let history_loss = trainer.history().records()[best_epoch - 1].val_loss;
        assert!((history_loss - outcome.best_val_loss).abs() < 1e-12);

        // Weights and batch-norm statistics both come from the best epoch
        let (val_loss, _) = evaluate(&model.valid(), &val, &batcher, 4);
        assert!(
            (val_loss - outcome.best_val_loss).abs() < 1e-5,
            "restored model scores {} but the best epoch scored {}",
            val_loss,
            outcome.best_val_loss
        );
    }

    #[test]
    fn test_history_and_early_stopping() {
        let device = Default::default();
        let model = FogClassifierConfig::tiny(SIZE).init::<TestBackend>(&device);
        let policy = FreezePolicy::frozen_backbone(model.num_backbone_units());

        let mut trainer = Trainer::<TestBackend>::new(FogBatcher::new(SIZE), 4, 3, device);
        // With min_delta = 1.0 nothing after the first epoch counts as improvement
        let config = PhaseConfig {
            epochs: 10,
            learning_rate: 1e-12,
            ..PhaseConfig::head_training()
        };
        let early = EarlyStoppingConfig {
            patience: 2,
            min_delta: 1.0,
            restore_best_weights: true,
        };
        let (_, outcome) = trainer
            .run_phase("fine_tune", model, &policy, &config, Some(&early), &dataset(4), &dataset(4))
            .unwrap();

        assert!(outcome.stopped_early);
        assert_eq!(outcome.epochs_run, 3);
        assert!(outcome.restored_best);
        assert_eq!(trainer.history().records().len(), 3);

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.csv");
        trainer.history().save_csv(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("phase,epoch,train_loss"));
        assert_eq!(content.lines().count(), 4);
    }

    #[test]
    fn test_history_write_failure_is_a_csv_error() {
        let history = TrainingHistory::default();
        let err = history
            .save_csv(Path::new("/nonexistent_dir/history.csv"))
            .unwrap_err();
        assert!(matches!(err, FogError::Csv(_)));
    }

    #[test]
    fn test_empty_validation_rejected() {
        let device = Default::default();
        let model = FogClassifierConfig::tiny(SIZE).init::<TestBackend>(&device);
        let policy = FreezePolicy::frozen_backbone(model.num_backbone_units());
        let empty = FogDataset::from_records(&[], SIZE).unwrap();

        let mut trainer = Trainer::<TestBackend>::new(FogBatcher::new(SIZE), 4, 0, device);
        let result = trainer.run_phase(
            "head",
            model,
            &policy,
            &PhaseConfig::head_training(),
            None,
            &dataset(4),
            &empty,
        );
        assert!(result.is_err());
    }
}
